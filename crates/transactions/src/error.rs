//! Transaction error types and failure classification.
//!
//! Per-document KV failures are classified once, at the staging-engine
//! boundary, into an [`ErrorClass`]; only the attempt state machine decides
//! whether a classified failure is attempt-fatal. Expiry always takes
//! precedence over any concurrent classification — the coordinator fails
//! closed toward rollback.

use coralkv_kv::KvError;
use snafu::{Location, Snafu};

use crate::attempt::AttemptState;

/// Result type alias for transaction operations.
pub type Result<T, E = TransactionError> = std::result::Result<T, E>;

/// How a failure should be handled by the attempt state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Expected contention (CAS mismatch, path conflict, transient
    /// unavailability): re-read and retry the phase.
    TransientConflict,
    /// The target document or ATR entry is gone. Fatal while staging,
    /// benign during cleanup.
    NotFound,
    /// The write may or may not have applied; re-read before deciding.
    Ambiguous,
    /// The attempt ran out of time; roll back.
    Expired,
    /// Unrecoverable for this attempt.
    Fatal,
}

/// Errors surfaced by the transaction coordinator.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransactionError {
    /// The attempt exceeded the transaction's expiry window.
    #[snafu(display("attempt expired during {phase:?}"))]
    Expired {
        /// The phase in which expiry was detected.
        phase: AttemptState,
    },

    /// Another transaction holds a staged change on the target document.
    #[snafu(display("write-write conflict on {doc}: staged by transaction {other_transaction}"))]
    WriteWriteConflict {
        /// The contended document.
        doc: String,
        /// Transaction id found in the foreign staged metadata.
        other_transaction: String,
    },

    /// The target document does not exist.
    #[snafu(display("document {doc} not found"))]
    DocNotFound {
        /// The missing document.
        doc: String,
    },

    /// An insert targeted a document that already exists.
    #[snafu(display("document {doc} already exists"))]
    DocExists {
        /// The conflicting document.
        doc: String,
    },

    /// The commit's durability outcome could not be established.
    ///
    /// The transaction may or may not have committed; cleanup will converge
    /// it either way.
    #[snafu(display("commit outcome ambiguous for transaction {transaction_id}"))]
    AmbiguousCommit {
        /// The transaction whose outcome is unknown.
        transaction_id: String,
    },

    /// The commit point was reached but unstaging did not finish; the
    /// outcome is fixed (committed) and cleanup will complete it.
    #[snafu(display("transaction {transaction_id} committed but unstaging is incomplete"))]
    FailedPostCommit {
        /// The committed transaction.
        transaction_id: String,
    },

    /// All attempts within the expiry window failed.
    #[snafu(display("transaction exhausted after {attempts} attempts: {last_error}"))]
    AttemptExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Last attempt's failure.
        last_error: String,
    },

    /// An operation was issued in a state that does not allow it.
    #[snafu(display("illegal operation in state {state:?} at {location}: {message}"))]
    IllegalState {
        /// The attempt's current state.
        state: AttemptState,
        /// What was attempted.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Configuration validation error.
    #[snafu(display("configuration error: {message}"))]
    Config {
        /// What failed validation.
        message: String,
    },

    /// A store operation failed and was not absorbed by a retry path.
    #[snafu(display("store error: {source}"))]
    #[snafu(context(false))]
    Kv {
        /// The underlying store failure.
        source: KvError,
    },
}

impl TransactionError {
    /// True if a fresh attempt of the same transaction may succeed.
    #[must_use]
    pub fn is_retryable_attempt(&self) -> bool {
        match self {
            Self::WriteWriteConflict { .. } => true,
            // Lost CAS races and transient unavailability resolve on a
            // fresh read in the next attempt.
            Self::Kv { source } => {
                source.is_transient()
                    || matches!(source, KvError::CasMismatch { .. } | KvError::AlreadyExists)
            }
            // Expiry, exhaustion, post-commit states, and logic errors are
            // terminal for the transaction as a whole.
            _ => false,
        }
    }
}

/// Classifies a raw store failure for the current phase.
///
/// `PathNotFound`/`PathExists` surface here only when a guarded metadata
/// write raced another writer, so they classify as contention rather than
/// data errors.
#[must_use]
pub fn classify_kv(err: &KvError) -> ErrorClass {
    match err {
        KvError::CasMismatch { .. }
        | KvError::AlreadyExists
        | KvError::PathExists { .. }
        | KvError::PathNotFound { .. }
        | KvError::Unavailable { .. } => ErrorClass::TransientConflict,
        KvError::NotFound => ErrorClass::NotFound,
        KvError::DurabilityAmbiguous { .. } | KvError::Timeout { .. } => ErrorClass::Ambiguous,
        KvError::InvalidArgument { .. } | KvError::Serialization { .. } => ErrorClass::Fatal,
    }
}
