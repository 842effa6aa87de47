//! Error types for document-store operations.
//!
//! Expected conflict conditions (CAS mismatch, path-not-found) are ordinary
//! variants callers match on, not faults. Each variant carries a
//! retryability/ambiguity classification consumed by retry layers.

use snafu::{Location, Snafu};

/// Result type alias for store operations.
pub type Result<T, E = KvError> = std::result::Result<T, E>;

/// Errors surfaced by the document-store contract.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum KvError {
    /// The document does not exist (or is access-deleted and the caller did
    /// not opt in to seeing tombstones).
    #[snafu(display("document not found"))]
    NotFound,

    /// An insert targeted a key that already exists.
    #[snafu(display("document already exists"))]
    AlreadyExists,

    /// A CAS-guarded write lost the race: the expected token is stale.
    #[snafu(display("CAS mismatch: expected {expected}, current {current}"))]
    CasMismatch {
        /// The token the caller presented.
        expected: crate::Cas,
        /// The document's current token.
        current: crate::Cas,
    },

    /// A sub-document path does not exist.
    #[snafu(display("sub-document path '{path}' not found"))]
    PathNotFound {
        /// The missing path.
        path: String,
    },

    /// A sub-document insert targeted a path that already exists.
    #[snafu(display("sub-document path '{path}' already exists"))]
    PathExists {
        /// The conflicting path.
        path: String,
    },

    /// The write may or may not have met its durability requirement.
    ///
    /// Callers must re-read the target to determine the actual outcome
    /// before retrying; blind re-issue risks double application.
    #[snafu(display("durability requirement ambiguous after {waited_ms}ms"))]
    DurabilityAmbiguous {
        /// How long the store waited before giving up.
        waited_ms: u64,
    },

    /// The store is temporarily unreachable or overloaded.
    #[snafu(display("store unavailable: {message}"))]
    Unavailable {
        /// Failure description.
        message: String,
    },

    /// The operation exceeded its time budget.
    #[snafu(display("operation timed out after {duration_ms}ms"))]
    Timeout {
        /// Elapsed time before the deadline fired.
        duration_ms: u64,
    },

    /// The request was malformed (bad path, conflicting flags).
    #[snafu(display("invalid argument at {location}: {message}"))]
    InvalidArgument {
        /// What was wrong with the request.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Payload could not be encoded or decoded.
    #[snafu(display("serialization error: {source}"))]
    Serialization {
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

impl KvError {
    /// Returns true if the failure is transient and safe to retry as-is.
    ///
    /// Ambiguous outcomes are deliberately excluded: they require a re-read
    /// first, not a blind retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }

    /// Returns true if the write's outcome is unknown to the caller.
    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::DurabilityAmbiguous { .. } | Self::Timeout { .. })
    }
}
