//! Hidden-attribute layout shared by staging, ATR, and cleanup.
//!
//! All transactional metadata rides in extended attributes so ordinary
//! readers never see it:
//!
//! - Target documents carry a `txn` subtree: transaction/attempt ids, a
//!   pointer to the owning ATR, the operation kind, the staged payload, a
//!   server-computed checksum, and (for replace/remove) the restore
//!   metadata needed to detect external interference.
//! - ATR documents carry one entry per attempt under `attempts.<id>`.
//! - The client-record document carries one entry per live coordinator
//!   under `records.clients.<id>`.
//!
//! Persisted records hold document *identities* only (bucket, scope,
//! collection, key) — never live handles.

use coralkv_kv::{DocRef, KeyspaceRef};
use serde::{Deserialize, Serialize};

use crate::ledger::StagedMutationKind;

/// Root xattr key for staged-document metadata.
pub(crate) const TXN_XATTR: &str = "txn";

/// Checksum path within the `txn` subtree.
pub(crate) const TXN_CRC_PATH: &str = "txn.crc";

/// Root xattr key for ATR attempt entries.
pub(crate) const ATR_ATTEMPTS: &str = "attempts";

/// Document id of the cleanup client registry.
pub(crate) const CLIENT_RECORD_DOC_ID: &str = "_txn:client-record";

/// Root xattr path of client registrations inside the registry document.
pub(crate) const CLIENT_RECORDS_PATH: &str = "records.clients";

/// Prefix of ATR document ids.
const ATR_DOC_PREFIX: &str = "_txn:atr-";

/// Formats the document id of ATR partition `n`.
#[must_use]
pub(crate) fn atr_doc_id(partition: u32) -> String {
    format!("{ATR_DOC_PREFIX}{partition}")
}

/// Xattr path of one attempt's entry inside an ATR document.
#[must_use]
pub(crate) fn attempt_path(attempt_id: &str) -> String {
    format!("{ATR_ATTEMPTS}.{attempt_id}")
}

/// Xattr path of one field inside an attempt's ATR entry.
#[must_use]
pub(crate) fn attempt_field(attempt_id: &str, field: &str) -> String {
    format!("{ATR_ATTEMPTS}.{attempt_id}.{field}")
}

/// Xattr path of one client's registration entry.
#[must_use]
pub(crate) fn client_path(client_id: &str) -> String {
    format!("{CLIENT_RECORDS_PATH}.{client_id}")
}

/// Identity of a document recorded in transactional metadata.
///
/// Used both as the ATR pointer on staged documents and as the entries of
/// an ATR's inserted/replaced/removed lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRecord {
    /// Bucket name.
    #[serde(rename = "bkt")]
    pub bucket: String,
    /// Scope name.
    #[serde(rename = "scp")]
    pub scope: String,
    /// Collection name.
    #[serde(rename = "coll")]
    pub collection: String,
    /// Document key.
    pub id: String,
}

impl DocRecord {
    /// Builds a record from a keyspace and document key.
    pub fn new(keyspace: &KeyspaceRef, id: impl Into<String>) -> Self {
        Self {
            bucket: keyspace.bucket.clone(),
            scope: keyspace.scope.clone(),
            collection: keyspace.collection.clone(),
            id: id.into(),
        }
    }

    /// The record's keyspace.
    #[must_use]
    pub fn keyspace(&self) -> KeyspaceRef {
        KeyspaceRef::new(self.bucket.clone(), self.scope.clone(), self.collection.clone())
    }

    /// The record as a resolvable document reference.
    #[must_use]
    pub fn doc_ref(&self) -> DocRef {
        DocRef::new(self.keyspace(), self.id.clone())
    }
}

/// A staged document's ATR pointer.
pub type AtrRef = DocRecord;

/// Pre-transaction document metadata captured before staging a replace or
/// remove, used to restore the document on rollback and to detect external
/// interference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreMeta {
    /// Pre-staging CAS, hex-encoded as reported by `$document`.
    #[serde(alias = "CAS")]
    pub cas: String,
    /// Pre-staging revision id.
    pub revid: String,
    /// Pre-staging expiry, seconds.
    pub exptime: u32,
}

/// Typed view of the `txn` xattr subtree on a staged document.
///
/// Present on a document if and only if that document carries an in-flight
/// or abandoned staged change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionXattrs {
    /// Owning transaction id.
    pub tid: String,
    /// Owning attempt id.
    pub aid: String,
    /// Pointer to the ATR document holding the attempt's entry.
    pub atr: AtrRef,
    /// Operation kind staged on this document.
    pub op: StagedMutationKind,
    /// Staged content; absent for removes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged: Option<serde_json::Value>,
    /// Server-computed checksum of the staged content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc: Option<String>,
    /// Restore metadata; present for replace/remove only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreMeta>,
}

impl TransactionXattrs {
    /// True if this staged change belongs to the given attempt.
    #[must_use]
    pub fn owned_by(&self, transaction_id: &str, attempt_id: &str) -> bool {
        self.tid == transaction_id && self.aid == attempt_id
    }
}
