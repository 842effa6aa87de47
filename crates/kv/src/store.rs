//! The document-store contract consumed by transaction coordination.

use async_trait::async_trait;

use crate::{
    Cas, GetOptions, InsertOptions, KeyspaceRef, LookupInOptions, LookupInResult, LookupInSpec,
    MutateInOptions, MutateInResult, MutateInSpec, MutationToken, RemoveOptions, ReplaceOptions,
    Result,
};

/// Result of a full-document read.
#[derive(Debug, Clone)]
pub struct GetResult {
    /// Current CAS of the document.
    pub cas: Cas,
    /// Raw JSON body. Empty for access-deleted documents read with the
    /// tombstone flag.
    pub body: Vec<u8>,
    /// Whether the document is access-deleted.
    pub tombstone: bool,
}

/// Result of a full-document write.
#[derive(Debug, Clone, Copy)]
pub struct WriteResult {
    /// CAS of the document after the write.
    pub cas: Cas,
    /// Token identifying the mutation in the change log.
    pub token: MutationToken,
}

/// CAS-guarded single-document and sub-document operations.
///
/// This is the entire surface the transaction coordinator requires from the
/// underlying store. Implementations are expected to be cheap to share
/// (`Arc`) and safe to call concurrently.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads a document's full body.
    async fn get(&self, keyspace: &KeyspaceRef, id: &str, opts: GetOptions) -> Result<GetResult>;

    /// Creates a document; fails with `AlreadyExists` if the key is taken.
    async fn insert(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        body: &[u8],
        opts: InsertOptions,
    ) -> Result<WriteResult>;

    /// Replaces a document's body, optionally CAS-guarded.
    async fn replace(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        body: &[u8],
        opts: ReplaceOptions,
    ) -> Result<WriteResult>;

    /// Removes a document, optionally CAS-guarded.
    async fn remove(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        opts: RemoveOptions,
    ) -> Result<WriteResult>;

    /// Reads multiple paths in one round trip.
    ///
    /// Absent paths yield `None` entries rather than failing the request;
    /// the request as a whole fails only if the document itself is missing
    /// (subject to `access_deleted`).
    async fn lookup_in(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        specs: &[LookupInSpec],
        opts: LookupInOptions,
    ) -> Result<LookupInResult>;

    /// Applies multiple path mutations atomically in one round trip.
    async fn mutate_in(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        specs: &[MutateInSpec],
        opts: MutateInOptions,
    ) -> Result<MutateInResult>;
}
