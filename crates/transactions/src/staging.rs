//! Per-document stage/unstage engine.
//!
//! Every operation here mutates exactly one document: staging writes the
//! pending change as hidden metadata (the visible body is untouched, or the
//! document is created invisible), unstaging applies or discards it. No
//! function in this module knows about other documents; classification of
//! failures and cross-document sequencing belong to the attempt state
//! machine.

use coralkv_kv::{
    Cas, DurabilityLevel, KeyspaceRef, KvError, KvStore, LookupInOptions, LookupInSpec,
    MutateInOptions, MutateInResult, MutateInSpec, RemoveOptions, ServerMacro, StoreSemantics,
    SubdocValue, VATTR_DOCUMENT, WriteResult,
};
use tracing::debug;

use crate::fields::{RestoreMeta, TXN_CRC_PATH, TXN_XATTR, TransactionXattrs};

/// A document's current state as one multi-path read sees it.
///
/// This is the primitive every phase uses to classify a document before
/// acting. Each part is independently absent; an absent `txn` subtree means
/// no staged change is present, which is state information rather than a
/// failure.
#[derive(Debug, Clone)]
pub(crate) struct DocumentState {
    /// Current CAS.
    pub cas: Cas,
    /// Whether the document is access-deleted.
    pub tombstone: bool,
    /// Full body, when requested and present.
    pub body: Option<serde_json::Value>,
    /// Staged-transaction metadata, when present.
    pub txn: Option<TransactionXattrs>,
    /// Per-document metadata (`$document`), used as restore metadata.
    pub meta: Option<RestoreMeta>,
}

impl DocumentState {
    /// The staged content, if a staged change carries one.
    #[must_use]
    pub fn staged_content(&self) -> Option<&serde_json::Value> {
        self.txn.as_ref().and_then(|t| t.staged.as_ref())
    }
}

/// Reads transaction metadata, per-document metadata, and (optionally) the
/// full body in a single round trip.
///
/// Tombstones are always visible to this read; the caller decides what a
/// tombstone means in its phase.
pub(crate) async fn lookup_document(
    store: &dyn KvStore,
    keyspace: &KeyspaceRef,
    id: &str,
    fetch_full_body: bool,
) -> Result<DocumentState, KvError> {
    let mut specs =
        vec![LookupInSpec::get_xattr(TXN_XATTR), LookupInSpec::get_xattr(VATTR_DOCUMENT)];
    if fetch_full_body {
        specs.push(LookupInSpec::full_doc());
    }

    let result =
        store.lookup_in(keyspace, id, &specs, LookupInOptions { access_deleted: true }).await?;

    // A malformed `txn` subtree (foreign tooling, partial write) reads as
    // "no staged change"; the CAS guard on any subsequent write still
    // protects us from acting on a stale view.
    let txn = match result.content_as::<TransactionXattrs>(0) {
        Ok(txn) => txn,
        Err(err) => {
            debug!(doc = %id, error = %err, "unreadable transaction metadata, treating as absent");
            None
        }
    };
    let meta = result.content_as::<RestoreMeta>(1)?;
    let body =
        if fetch_full_body { result.content_as::<serde_json::Value>(2)? } else { None };

    Ok(DocumentState { cas: result.cas, tombstone: result.tombstone, body, txn, meta })
}

/// Encodes the `txn` subtree plus the server-computed checksum macro.
fn stage_specs(xattrs: &TransactionXattrs, fresh: bool) -> Result<Vec<MutateInSpec>, KvError> {
    let blob = SubdocValue::json(xattrs)?;
    let root = if fresh {
        MutateInSpec::insert_xattr(TXN_XATTR, blob)
    } else {
        MutateInSpec::upsert_xattr(TXN_XATTR, blob)
    };
    Ok(vec![root, MutateInSpec::upsert_xattr(TXN_CRC_PATH, SubdocValue::Macro(ServerMacro::ValueCrc))])
}

/// Stages an insert: the document is created access-deleted, so it appears
/// absent to ordinary readers until commit.
///
/// With `expected_cas` set this re-stages a previously half-staged insert
/// (recovery after an ambiguous response) via a guarded overwrite; otherwise
/// the key must not exist at all.
pub(crate) async fn stage_insert(
    store: &dyn KvStore,
    keyspace: &KeyspaceRef,
    id: &str,
    xattrs: &TransactionXattrs,
    durability: DurabilityLevel,
    expected_cas: Option<Cas>,
) -> Result<MutateInResult, KvError> {
    debug!(doc = %id, recovering = expected_cas.is_some(), "staging insert");
    let opts = match expected_cas {
        Some(cas) => MutateInOptions {
            cas: Some(cas),
            durability,
            store_semantics: StoreSemantics::Replace,
            access_deleted: true,
            ..Default::default()
        },
        None => MutateInOptions {
            durability,
            store_semantics: StoreSemantics::Insert,
            access_deleted: true,
            create_as_deleted: true,
            ..Default::default()
        },
    };
    store.mutate_in(keyspace, id, &stage_specs(xattrs, expected_cas.is_none())?, opts).await
}

/// Stages a replace: hidden metadata (including restore metadata captured
/// from the caller's snapshot) is written under a CAS guard while the
/// visible body stays unchanged.
pub(crate) async fn stage_replace(
    store: &dyn KvStore,
    keyspace: &KeyspaceRef,
    id: &str,
    cas: Cas,
    xattrs: &TransactionXattrs,
    durability: DurabilityLevel,
    allow_access_deleted: bool,
) -> Result<MutateInResult, KvError> {
    debug!(doc = %id, %cas, "staging replace");
    let opts = MutateInOptions {
        cas: Some(cas),
        durability,
        access_deleted: allow_access_deleted,
        ..Default::default()
    };
    store.mutate_in(keyspace, id, &stage_specs(xattrs, false)?, opts).await
}

/// Stages a remove: a single-blob `txn` payload describes the pending
/// remove and the document is flagged access-deleted, without being
/// physically removed yet.
pub(crate) async fn stage_remove(
    store: &dyn KvStore,
    keyspace: &KeyspaceRef,
    id: &str,
    cas: Cas,
    xattrs: &TransactionXattrs,
    durability: DurabilityLevel,
) -> Result<MutateInResult, KvError> {
    debug!(doc = %id, %cas, "staging remove");
    let specs = [
        MutateInSpec::upsert_xattr(TXN_XATTR, SubdocValue::json(xattrs)?),
        MutateInSpec::remove_doc(),
    ];
    let opts = MutateInOptions { cas: Some(cas), durability, ..Default::default() };
    store.mutate_in(keyspace, id, &specs, opts).await
}

/// Commits a staged insert or replace: writes the final content and strips
/// the transaction metadata in one request. `insert_mode` revives a
/// document that was created as deleted.
pub(crate) async fn unstage_insert_or_replace(
    store: &dyn KvStore,
    keyspace: &KeyspaceRef,
    id: &str,
    cas: Cas,
    final_content: &serde_json::Value,
    insert_mode: bool,
    durability: DurabilityLevel,
) -> Result<MutateInResult, KvError> {
    debug!(doc = %id, %cas, insert_mode, "unstaging insert/replace");
    let specs = [
        MutateInSpec::set_doc(SubdocValue::json(final_content)?),
        MutateInSpec::remove_xattr(TXN_XATTR),
    ];
    let opts = MutateInOptions {
        cas: Some(cas),
        durability,
        access_deleted: insert_mode,
        revive: insert_mode,
        ..Default::default()
    };
    store.mutate_in(keyspace, id, &specs, opts).await
}

/// Commits a staged remove: physically removes the document.
pub(crate) async fn unstage_remove(
    store: &dyn KvStore,
    keyspace: &KeyspaceRef,
    id: &str,
    cas: Cas,
    durability: DurabilityLevel,
) -> Result<WriteResult, KvError> {
    debug!(doc = %id, %cas, "unstaging remove");
    store
        .remove(
            keyspace,
            id,
            RemoveOptions { cas: Some(cas), durability, access_deleted: true },
        )
        .await
}

/// Rolls back a staged insert: strips the metadata from the phantom, which
/// purges it — the document reads as never having existed.
pub(crate) async fn remove_staged_insert(
    store: &dyn KvStore,
    keyspace: &KeyspaceRef,
    id: &str,
    cas: Cas,
    durability: DurabilityLevel,
) -> Result<MutateInResult, KvError> {
    debug!(doc = %id, %cas, "removing staged insert");
    let specs = [MutateInSpec::remove_xattr(TXN_XATTR)];
    let opts = MutateInOptions {
        cas: Some(cas),
        durability,
        access_deleted: true,
        ..Default::default()
    };
    store.mutate_in(keyspace, id, &specs, opts).await
}

/// Rolls back a staged replace or remove: strips the metadata, restoring
/// the document's pre-staging visible state without touching its body.
/// `is_deleted` revives a document the staged remove had flagged.
pub(crate) async fn clear_transaction_metadata(
    store: &dyn KvStore,
    keyspace: &KeyspaceRef,
    id: &str,
    cas: Cas,
    is_deleted: bool,
    durability: DurabilityLevel,
) -> Result<MutateInResult, KvError> {
    debug!(doc = %id, %cas, is_deleted, "clearing transaction metadata");
    let specs = [MutateInSpec::remove_xattr(TXN_XATTR)];
    let opts = MutateInOptions {
        cas: Some(cas),
        durability,
        access_deleted: is_deleted,
        revive: is_deleted,
        ..Default::default()
    };
    store.mutate_in(keyspace, id, &specs, opts).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use coralkv_kv::{GetOptions, mock::MockKvStore};
    use serde_json::json;

    use super::*;
    use crate::{fields::DocRecord, ledger::StagedMutationKind};

    fn ks() -> KeyspaceRef {
        KeyspaceRef::default_collection("test")
    }

    fn xattrs(op: StagedMutationKind, staged: Option<serde_json::Value>) -> TransactionXattrs {
        TransactionXattrs {
            tid: "t1".to_owned(),
            aid: "a1".to_owned(),
            atr: DocRecord::new(&ks(), "_txn:atr-0"),
            op,
            staged,
            crc: None,
            restore: None,
        }
    }

    #[tokio::test]
    async fn test_stage_insert_invisible_until_unstaged() {
        let store = MockKvStore::new();
        let content = json!({"name": "new"});
        let staged = stage_insert(
            &store,
            &ks(),
            "doc",
            &xattrs(StagedMutationKind::Insert, Some(content.clone())),
            DurabilityLevel::Majority,
            None,
        )
        .await
        .unwrap();

        assert!(store.get(&ks(), "doc", GetOptions::default()).await.is_err());

        let state = lookup_document(&store, &ks(), "doc", true).await.unwrap();
        assert!(state.tombstone);
        assert_eq!(state.staged_content(), Some(&content));

        unstage_insert_or_replace(
            &store,
            &ks(),
            "doc",
            staged.cas,
            &content,
            true,
            DurabilityLevel::Majority,
        )
        .await
        .unwrap();

        let visible = store.get(&ks(), "doc", GetOptions::default()).await.unwrap();
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&visible.body).unwrap(), content);
        let state = lookup_document(&store, &ks(), "doc", false).await.unwrap();
        assert!(state.txn.is_none(), "metadata must be gone after unstage");
    }

    #[tokio::test]
    async fn test_stage_replace_keeps_visible_body() {
        let store = MockKvStore::new();
        let cas = store.seed(&ks(), "doc", br#"{"v":1}"#);
        stage_replace(
            &store,
            &ks(),
            "doc",
            cas,
            &xattrs(StagedMutationKind::Replace, Some(json!({"v":2}))),
            DurabilityLevel::Majority,
            false,
        )
        .await
        .unwrap();

        let visible = store.get(&ks(), "doc", GetOptions::default()).await.unwrap();
        assert_eq!(visible.body, br#"{"v":1}"#.to_vec());

        let state = lookup_document(&store, &ks(), "doc", false).await.unwrap();
        assert_eq!(state.staged_content(), Some(&json!({"v":2})));
        assert!(state.txn.unwrap().crc.is_some(), "server checksum macro must expand");
    }

    #[tokio::test]
    async fn test_stage_replace_stale_cas_rejected() {
        let store = MockKvStore::new();
        let cas = store.seed(&ks(), "doc", br#"{"v":1}"#);
        store.seed(&ks(), "doc", br#"{"v":1.5}"#);

        let err = stage_replace(
            &store,
            &ks(),
            "doc",
            cas,
            &xattrs(StagedMutationKind::Replace, Some(json!({"v":2}))),
            DurabilityLevel::Majority,
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, KvError::CasMismatch { .. }));
    }

    #[tokio::test]
    async fn test_stage_remove_then_rollback_restores_visibility() {
        let store = MockKvStore::new();
        let cas = store.seed(&ks(), "doc", br#"{"v":1}"#);
        let staged = stage_remove(
            &store,
            &ks(),
            "doc",
            cas,
            &xattrs(StagedMutationKind::Remove, None),
            DurabilityLevel::Majority,
        )
        .await
        .unwrap();

        // Flagged access-deleted while staged.
        assert!(store.get(&ks(), "doc", GetOptions::default()).await.is_err());

        clear_transaction_metadata(
            &store,
            &ks(),
            "doc",
            staged.cas,
            true,
            DurabilityLevel::Majority,
        )
        .await
        .unwrap();

        let visible = store.get(&ks(), "doc", GetOptions::default()).await.unwrap();
        assert_eq!(visible.body, br#"{"v":1}"#.to_vec());
    }

    #[tokio::test]
    async fn test_stage_remove_then_unstage_removes() {
        let store = MockKvStore::new();
        let cas = store.seed(&ks(), "doc", br#"{"v":1}"#);
        let staged = stage_remove(
            &store,
            &ks(),
            "doc",
            cas,
            &xattrs(StagedMutationKind::Remove, None),
            DurabilityLevel::Majority,
        )
        .await
        .unwrap();

        unstage_remove(&store, &ks(), "doc", staged.cas, DurabilityLevel::Majority)
            .await
            .unwrap();
        assert!(!store.contains_any(&ks(), "doc"));
    }

    #[tokio::test]
    async fn test_remove_staged_insert_leaves_no_trace() {
        let store = MockKvStore::new();
        let staged = stage_insert(
            &store,
            &ks(),
            "ghost",
            &xattrs(StagedMutationKind::Insert, Some(json!({"v":1}))),
            DurabilityLevel::Majority,
            None,
        )
        .await
        .unwrap();

        remove_staged_insert(&store, &ks(), "ghost", staged.cas, DurabilityLevel::Majority)
            .await
            .unwrap();
        assert!(!store.contains_any(&ks(), "ghost"));
    }

    #[tokio::test]
    async fn test_lookup_document_reports_restore_metadata() {
        let store = MockKvStore::new();
        let cas = store.seed(&ks(), "doc", br#"{"v":1}"#);
        let state = lookup_document(&store, &ks(), "doc", false).await.unwrap();
        let meta = state.meta.unwrap();
        assert_eq!(meta.cas, format!("0x{:x}", cas.0));
        assert_eq!(meta.revid, "1");
    }

    #[tokio::test]
    async fn test_stage_insert_existing_key_conflicts() {
        let store = MockKvStore::new();
        store.seed(&ks(), "doc", b"{}");
        let err = stage_insert(
            &store,
            &ks(),
            "doc",
            &xattrs(StagedMutationKind::Insert, Some(json!({}))),
            DurabilityLevel::Majority,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, KvError::AlreadyExists));
    }
}
