//! Document-store contract for CoralKV clients.
//!
//! This crate defines the narrow interface the transaction coordinator
//! consumes from the underlying document store:
//!
//! - **CAS-guarded single-document operations**: get/insert/replace/remove,
//!   each taking an expected [`Cas`] and returning a new one on success
//! - **Sub-document multi-path operations**: read or mutate several named
//!   paths (ordinary or hidden "xattr" paths) in one round trip
//! - **Access-deleted visibility**: reads and writes can opt in to seeing or
//!   creating documents that are logically deleted but still present
//! - **Durability levels**: writes wait for replication/persistence per a
//!   requested [`DurabilityLevel`], surfacing an ambiguous error when the
//!   wait is inconclusive
//! - **Server-side mutation macros**: a write can ask the server to fill in
//!   the post-mutation CAS, a monotonic timestamp, or a checksum of the
//!   written value
//!
//! Connection pooling, authentication, and key sharding live below this
//! contract and are not modeled here.
//!
//! The [`mock`] module provides a fully-functional in-memory implementation
//! with failure injection and a controllable server clock, used by the
//! transaction test suites.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod mock;
mod options;
mod store;
mod subdoc;
mod types;

pub use error::{KvError, Result};
pub use options::{
    GetOptions, InsertOptions, LookupInOptions, MutateInOptions, RemoveOptions, ReplaceOptions,
    StoreSemantics,
};
pub use store::{GetResult, KvStore, WriteResult};
pub use subdoc::{
    LookupInResult, LookupInSpec, MutateInResult, MutateInSpec, ServerMacro, SubdocValue,
    SubdocWriteOp, VATTR_CLOCK, VATTR_DOCUMENT,
};
pub use types::{Cas, DocRef, DurabilityLevel, KeyspaceRef, MutationToken};
