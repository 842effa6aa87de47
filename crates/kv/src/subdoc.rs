//! Sub-document operation specs and results.
//!
//! A sub-document request reads or mutates several named paths within one
//! document in a single round trip. Paths are dotted (`a.b.c`); a path may
//! address an ordinary body field or a hidden extended attribute (xattr).
//! The empty path addresses the full document body.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Cas, KvError, MutationToken, Result};

/// Virtual xattr exposing per-document metadata (`CAS`, `revid`, `exptime`).
pub const VATTR_DOCUMENT: &str = "$document";

/// Virtual xattr exposing the server's logical clock (`now_ms`).
pub const VATTR_CLOCK: &str = "$vbucket.HLC";

/// One path to read in a `lookup_in` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupInSpec {
    /// Dotted path; empty string addresses the full document body.
    pub path: String,
    /// Whether the path is a hidden extended attribute.
    pub xattr: bool,
}

impl LookupInSpec {
    /// Reads an ordinary body path.
    pub fn get(path: impl Into<String>) -> Self {
        Self { path: path.into(), xattr: false }
    }

    /// Reads a hidden extended-attribute path (including virtual xattrs).
    pub fn get_xattr(path: impl Into<String>) -> Self {
        Self { path: path.into(), xattr: true }
    }

    /// Reads the full document body.
    #[must_use]
    pub fn full_doc() -> Self {
        Self { path: String::new(), xattr: false }
    }
}

/// Server-side macro: the server fills in the value at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMacro {
    /// The post-mutation CAS of the document, as a hex string.
    MutationCas,
    /// The server's monotonic clock at mutation time, epoch milliseconds.
    CurrentTimeMs,
    /// A checksum of the value written in the same request, as a hex string.
    ValueCrc,
}

/// Value carried by a mutation spec: a literal or a server macro.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubdocValue {
    /// Literal JSON bytes supplied by the client.
    Bytes(Vec<u8>),
    /// Server-expanded macro.
    Macro(ServerMacro),
}

impl SubdocValue {
    /// Encodes a serializable value as literal JSON bytes.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value).map_err(|source| KvError::Serialization { source })?;
        Ok(Self::Bytes(bytes))
    }
}

/// Kind of write a mutation spec performs at its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubdocWriteOp {
    /// Insert at the path; fails with `PathExists` if already present.
    InsertPath,
    /// Insert or overwrite at the path.
    UpsertPath,
    /// Remove the path; fails with `PathNotFound` if absent.
    RemovePath,
    /// Replace the full document body.
    SetDoc,
    /// Flag the document access-deleted: it disappears from ordinary reads
    /// but its content and xattrs stay present for tombstone-aware access.
    RemoveDoc,
}

/// One path mutation in a `mutate_in` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateInSpec {
    /// Dotted path; empty for whole-document ops.
    pub path: String,
    /// Whether the path is a hidden extended attribute.
    pub xattr: bool,
    /// Create missing intermediate objects along the path.
    pub create_path: bool,
    /// The write to perform.
    pub op: SubdocWriteOp,
    /// Value to write (ignored for removals).
    pub value: Option<SubdocValue>,
}

impl MutateInSpec {
    /// Inserts a hidden-attribute path, creating parents.
    pub fn insert_xattr(path: impl Into<String>, value: SubdocValue) -> Self {
        Self {
            path: path.into(),
            xattr: true,
            create_path: true,
            op: SubdocWriteOp::InsertPath,
            value: Some(value),
        }
    }

    /// Upserts a hidden-attribute path, creating parents.
    pub fn upsert_xattr(path: impl Into<String>, value: SubdocValue) -> Self {
        Self {
            path: path.into(),
            xattr: true,
            create_path: true,
            op: SubdocWriteOp::UpsertPath,
            value: Some(value),
        }
    }

    /// Removes a hidden-attribute path.
    pub fn remove_xattr(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            xattr: true,
            create_path: false,
            op: SubdocWriteOp::RemovePath,
            value: None,
        }
    }

    /// Replaces the full document body.
    #[must_use]
    pub fn set_doc(value: SubdocValue) -> Self {
        Self {
            path: String::new(),
            xattr: false,
            create_path: false,
            op: SubdocWriteOp::SetDoc,
            value: Some(value),
        }
    }

    /// Flags the document access-deleted, retaining content and xattrs.
    #[must_use]
    pub fn remove_doc() -> Self {
        Self {
            path: String::new(),
            xattr: false,
            create_path: false,
            op: SubdocWriteOp::RemoveDoc,
            value: None,
        }
    }
}

/// Result of a `lookup_in` request.
///
/// Entries align with the request specs; a `None` entry means the path was
/// absent (path-not-found is state information at this layer, not an error).
#[derive(Debug, Clone)]
pub struct LookupInResult {
    /// Current CAS of the document.
    pub cas: Cas,
    /// Whether the document is access-deleted (tombstone).
    pub tombstone: bool,
    /// Raw JSON bytes per requested spec, in request order.
    pub entries: Vec<Option<Vec<u8>>>,
}

impl LookupInResult {
    /// Deserializes entry `idx`, returning `None` if the path was absent.
    pub fn content_as<T: DeserializeOwned>(&self, idx: usize) -> Result<Option<T>> {
        match self.entries.get(idx).and_then(|e| e.as_deref()) {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|source| KvError::Serialization { source }),
        }
    }

    /// Returns true if entry `idx` was present.
    #[must_use]
    pub fn exists(&self, idx: usize) -> bool {
        self.entries.get(idx).is_some_and(Option::is_some)
    }
}

/// Result of a `mutate_in` request.
#[derive(Debug, Clone, Copy)]
pub struct MutateInResult {
    /// CAS of the document after the mutation.
    pub cas: Cas,
    /// Token identifying the mutation in the change log.
    pub token: MutationToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_spec_constructors() {
        let spec = LookupInSpec::get_xattr("txn.tid");
        assert!(spec.xattr);
        assert_eq!(spec.path, "txn.tid");

        let body = LookupInSpec::full_doc();
        assert!(!body.xattr);
        assert!(body.path.is_empty());
    }

    #[test]
    fn test_mutate_spec_set_doc() {
        let spec = MutateInSpec::set_doc(SubdocValue::Bytes(b"{}".to_vec()));
        assert_eq!(spec.op, SubdocWriteOp::SetDoc);
        assert!(spec.path.is_empty());
    }

    #[test]
    fn test_subdoc_value_json_encoding() {
        let value = SubdocValue::json(&serde_json::json!({"a": 1})).unwrap();
        match value {
            SubdocValue::Bytes(b) => assert_eq!(b, br#"{"a":1}"#.to_vec()),
            SubdocValue::Macro(_) => panic!("expected literal bytes"),
        }
    }

    #[test]
    fn test_lookup_result_accessors() {
        let result = LookupInResult {
            cas: Cas(9),
            tombstone: false,
            entries: vec![Some(br#"{"x":true}"#.to_vec()), None],
        };
        let parsed: Option<serde_json::Value> = result.content_as(0).unwrap();
        assert_eq!(parsed.unwrap()["x"], serde_json::json!(true));
        assert!(result.content_as::<serde_json::Value>(1).unwrap().is_none());
        assert!(result.exists(0));
        assert!(!result.exists(1));
        assert!(!result.exists(7));
    }
}
