//! Core identity and version types for the document store.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Name of the scope/collection a bucket exposes by default.
pub const DEFAULT_NAME: &str = "_default";

/// Fully-qualified reference to a collection: bucket, scope, collection.
///
/// Persisted records store keyspace references as plain identity data, never
/// live handles; handles are resolved at the point of use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyspaceRef {
    /// Bucket name.
    pub bucket: String,
    /// Scope name within the bucket.
    pub scope: String,
    /// Collection name within the scope.
    pub collection: String,
}

impl KeyspaceRef {
    /// Creates a fully-qualified keyspace reference.
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self { bucket: bucket.into(), scope: scope.into(), collection: collection.into() }
    }

    /// Creates a reference to a bucket's default scope and collection.
    pub fn default_collection(bucket: impl Into<String>) -> Self {
        Self::new(bucket, DEFAULT_NAME, DEFAULT_NAME)
    }
}

impl fmt::Display for KeyspaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

/// Identity of a single document: keyspace plus document key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocRef {
    /// The collection holding the document.
    pub keyspace: KeyspaceRef,
    /// Document key.
    pub id: String,
}

impl DocRef {
    /// Creates a document reference.
    pub fn new(keyspace: KeyspaceRef, id: impl Into<String>) -> Self {
        Self { keyspace, id: id.into() }
    }
}

impl fmt::Display for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.keyspace, self.id)
    }
}

/// Opaque compare-and-swap token.
///
/// A write guarded by a CAS succeeds only if the document's current token
/// matches. [`Cas::ZERO`] on a guarded write means "the document must not
/// exist".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Cas(pub u64);

impl Cas {
    /// The "must not exist" sentinel.
    pub const ZERO: Cas = Cas(0);

    /// Returns true if this is the "must not exist" sentinel.
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Durability requirement attached to a write.
///
/// The store acknowledges the write only once the requested level is met;
/// an inconclusive wait surfaces [`KvError::DurabilityAmbiguous`], distinct
/// from an outright failure.
///
/// [`KvError::DurabilityAmbiguous`]: crate::KvError::DurabilityAmbiguous
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityLevel {
    /// No durability wait; acknowledged from the active node's memory.
    None,
    /// Replicated to a majority of nodes.
    #[default]
    Majority,
    /// Replicated to a majority and persisted on the active node.
    MajorityAndPersistToActive,
    /// Persisted on a majority of nodes.
    PersistToMajority,
}

impl DurabilityLevel {
    /// Wire name of the level, used when embedding in persisted records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "n",
            Self::Majority => "m",
            Self::MajorityAndPersistToActive => "pa",
            Self::PersistToMajority => "pm",
        }
    }

    /// Parses a wire name back into a level. Unknown names map to `Majority`
    /// so records written by newer clients stay readable.
    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "n" => Self::None,
            "pa" => Self::MajorityAndPersistToActive,
            "pm" => Self::PersistToMajority,
            _ => Self::Majority,
        }
    }
}

/// Opaque token identifying a mutation's position in the store's change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationToken {
    /// UUID of the partition that accepted the mutation.
    pub partition_uuid: u64,
    /// Sequence number of the mutation within the partition.
    pub seqno: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_display() {
        let ks = KeyspaceRef::new("travel", "inventory", "hotels");
        assert_eq!(ks.to_string(), "travel.inventory.hotels");
    }

    #[test]
    fn test_default_collection() {
        let ks = KeyspaceRef::default_collection("main");
        assert_eq!(ks.scope, DEFAULT_NAME);
        assert_eq!(ks.collection, DEFAULT_NAME);
    }

    #[test]
    fn test_cas_zero_sentinel() {
        assert!(Cas::ZERO.is_zero());
        assert!(!Cas(7).is_zero());
    }

    #[test]
    fn test_durability_wire_round_trip() {
        for level in [
            DurabilityLevel::None,
            DurabilityLevel::Majority,
            DurabilityLevel::MajorityAndPersistToActive,
            DurabilityLevel::PersistToMajority,
        ] {
            assert_eq!(DurabilityLevel::from_str_lossy(level.as_str()), level);
        }
        // Unknown names fall back to the default level.
        assert_eq!(DurabilityLevel::from_str_lossy("??"), DurabilityLevel::Majority);
    }
}
