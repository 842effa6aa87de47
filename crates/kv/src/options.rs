//! Per-operation option structs.
//!
//! Each store operation takes an explicit immutable options value with
//! documented defaults; there is no ambient configuration.

use crate::{Cas, DurabilityLevel};

/// Options for `get`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Also return access-deleted (tombstoned) documents. Default: false.
    pub access_deleted: bool,
}

/// Options for `insert`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertOptions {
    /// Durability requirement. Default: [`DurabilityLevel::Majority`].
    pub durability: DurabilityLevel,
    /// Document expiry in seconds; 0 means no expiry. Default: 0.
    pub expiry_secs: u32,
}

/// Options for `replace`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceOptions {
    /// Expected CAS; `None` skips the guard. Default: `None`.
    pub cas: Option<Cas>,
    /// Durability requirement. Default: [`DurabilityLevel::Majority`].
    pub durability: DurabilityLevel,
}

/// Options for `remove`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Expected CAS; `None` skips the guard. Default: `None`.
    pub cas: Option<Cas>,
    /// Durability requirement. Default: [`DurabilityLevel::Majority`].
    pub durability: DurabilityLevel,
    /// Also remove access-deleted documents. Default: false.
    pub access_deleted: bool,
}

/// Options for `lookup_in`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LookupInOptions {
    /// Also read access-deleted documents. Default: false.
    pub access_deleted: bool,
}

/// Document-level semantics of a `mutate_in` request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreSemantics {
    /// The document must already exist. Default.
    #[default]
    Replace,
    /// The document must not exist; the request creates it.
    Insert,
    /// Create the document if absent, mutate it if present.
    Upsert,
}

/// Options for `mutate_in`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutateInOptions {
    /// Expected CAS; `None` skips the guard. Default: `None`.
    pub cas: Option<Cas>,
    /// Durability requirement. Default: [`DurabilityLevel::Majority`].
    pub durability: DurabilityLevel,
    /// Document-level create/replace semantics. Default: `Replace`.
    pub store_semantics: StoreSemantics,
    /// Operate on access-deleted documents. Default: false.
    pub access_deleted: bool,
    /// Create the document as access-deleted (tombstone with xattrs only).
    /// Requires `store_semantics == Insert`. Default: false.
    pub create_as_deleted: bool,
    /// Clear the access-deleted flag as part of this mutation, making the
    /// document visible to ordinary readers again. Default: false.
    pub revive: bool,
    /// Document expiry in seconds; 0 means no expiry. Default: 0.
    pub expiry_secs: u32,
}
