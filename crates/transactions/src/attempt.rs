//! The attempt state machine.
//!
//! One `AttemptContext` drives a single execution try of a transaction
//! through `NOT_STARTED → STAGING → COMMITTING → COMPLETED`, or through
//! `ROLLING_BACK → ROLLED_BACK` when the attempt aborts. The first mutation
//! records the attempt's intent in its ATR; each mutation stages hidden
//! metadata on its target document; commit flips the ATR entry to
//! `COMMITTED` — the durability point past which the outcome is fixed even
//! if this process dies — and then rewrites every staged document to its
//! final state.
//!
//! Expiry is checked before every operation and phase transition and takes
//! precedence over any concurrently-detected conflict: the coordinator
//! fails closed toward rollback.

use std::sync::Arc;

use coralkv_kv::{Cas, DocRef, KeyspaceRef, KvError, KvStore};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    atr::{AtrManager, atr_id_for_key},
    cleanup::CleanupSet,
    config::TransactionsConfig,
    error::{ErrorClass, Result, TransactionError, classify_kv},
    fields::{RestoreMeta, TransactionXattrs},
    ledger::{MutationLedger, StagedMutation, StagedMutationKind},
    retry::with_retry,
    staging,
};

/// Bounded per-document retries when an unstage races a recovering peer.
const MAX_UNSTAGE_CAS_RETRIES: u32 = 3;

/// Phase of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// No document operation has happened yet.
    NotStarted,
    /// Intent is recorded; mutations are being staged.
    Staging,
    /// The commit sequence is running.
    Committing,
    /// Commit finished; all documents unstaged, entry removed.
    Completed,
    /// The rollback sequence is running.
    RollingBack,
    /// Rollback finished; all staged documents reversed, entry removed.
    RolledBack,
    /// The commit point was passed but unstaging did not finish; cleanup
    /// owns the remainder.
    FailedPostCommit,
}

/// A document read inside an attempt; required input for `replace`/`remove`.
#[derive(Debug, Clone)]
pub struct TransactionGetResult {
    doc: DocRef,
    cas: Cas,
    content: serde_json::Value,
    restore: Option<RestoreMeta>,
}

impl TransactionGetResult {
    /// The document's identity.
    #[must_use]
    pub fn doc_ref(&self) -> &DocRef {
        &self.doc
    }

    /// The CAS this read observed.
    #[must_use]
    pub fn cas(&self) -> Cas {
        self.cas
    }

    /// The document content this read observed.
    #[must_use]
    pub fn content(&self) -> &serde_json::Value {
        &self.content
    }

    /// Deserializes the content.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.content.clone())
            .map_err(|source| KvError::Serialization { source }.into())
    }
}

/// One execution try of a transaction.
///
/// Methods take `&self`: independent documents may be staged concurrently,
/// with the ledger as the only shared mutable state.
pub struct AttemptContext {
    store: Arc<dyn KvStore>,
    config: TransactionsConfig,
    transaction_id: String,
    attempt_id: String,
    started_at: tokio::time::Instant,
    state: Mutex<AttemptState>,
    ledger: Mutex<MutationLedger>,
    atr: OnceCell<Arc<AtrManager>>,
    cleanup_set: CleanupSet,
}

impl AttemptContext {
    /// Creates a fresh attempt for `transaction_id`.
    pub(crate) fn new(
        store: Arc<dyn KvStore>,
        config: TransactionsConfig,
        transaction_id: String,
        cleanup_set: CleanupSet,
    ) -> Self {
        Self {
            store,
            config,
            transaction_id,
            attempt_id: Uuid::new_v4().to_string(),
            started_at: tokio::time::Instant::now(),
            state: Mutex::new(AttemptState::NotStarted),
            ledger: Mutex::new(MutationLedger::new()),
            atr: OnceCell::new(),
            cleanup_set,
        }
    }

    /// The transaction this attempt belongs to.
    #[must_use]
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// This attempt's id.
    #[must_use]
    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    /// The attempt's current phase.
    #[must_use]
    pub fn state(&self) -> AttemptState {
        *self.state.lock()
    }

    /// Fails the operation if the transaction's expiry window has elapsed.
    ///
    /// Expiry takes precedence over everything else detected in the same
    /// operation.
    fn check_expiry(&self) -> Result<()> {
        if self.started_at.elapsed() > self.config.expiration_time {
            let phase = *self.state.lock();
            return Err(TransactionError::Expired { phase });
        }
        Ok(())
    }

    fn expect_staging_phase(&self, what: &str) -> Result<()> {
        let state = *self.state.lock();
        match state {
            AttemptState::NotStarted | AttemptState::Staging => Ok(()),
            _ => Err(TransactionError::IllegalState {
                state,
                message: what.to_owned(),
                location: snafu::Location::default(),
            }),
        }
    }

    /// Records the attempt's intent on first mutation and resolves the ATR
    /// placement: the configured metadata keyspace, or the keyspace of the
    /// first staged document.
    async fn ensure_started(&self, keyspace: &KeyspaceRef, first_key: &str) -> Result<Arc<AtrManager>> {
        let manager = self
            .atr
            .get_or_try_init(|| async {
                let atr_keyspace = self
                    .config
                    .metadata_keyspace
                    .clone()
                    .unwrap_or_else(|| keyspace.clone());
                let atr_id = atr_id_for_key(first_key, self.config.num_atrs);
                debug!(
                    transaction = %self.transaction_id,
                    attempt = %self.attempt_id,
                    atr = %atr_id,
                    "starting attempt"
                );
                let manager = Arc::new(AtrManager::new(
                    Arc::clone(&self.store),
                    atr_keyspace.clone(),
                    atr_id,
                    self.transaction_id.clone(),
                    self.attempt_id.clone(),
                    self.config.durability,
                    self.config.expiration_time,
                ));
                manager.mutate_pending().await?;
                self.cleanup_set.write().insert(atr_keyspace);
                Ok::<_, TransactionError>(manager)
            })
            .await?;

        let mut state = self.state.lock();
        if *state == AttemptState::NotStarted {
            *state = AttemptState::Staging;
        }
        Ok(Arc::clone(manager))
    }

    fn base_xattrs(&self, atr: &AtrManager, op: StagedMutationKind) -> TransactionXattrs {
        TransactionXattrs {
            tid: self.transaction_id.clone(),
            aid: self.attempt_id.clone(),
            atr: atr.atr_record(),
            op,
            staged: None,
            crc: None,
            restore: None,
        }
    }

    /// Reads a document, observing this attempt's own staged changes.
    pub async fn get(&self, keyspace: &KeyspaceRef, id: &str) -> Result<TransactionGetResult> {
        self.check_expiry()?;
        self.expect_staging_phase("get")?;

        let state = with_retry(&self.config.retry, self.config.kv_timeout, || {
            staging::lookup_document(self.store.as_ref(), keyspace, id, true)
        })
        .await
        .map_err(|err| match err {
            KvError::NotFound => TransactionError::DocNotFound {
                doc: format!("{keyspace}/{id}"),
            },
            other => other.into(),
        })?;

        let doc = DocRef::new(keyspace.clone(), id);

        if let Some(txn) = &state.txn {
            if txn.owned_by(&self.transaction_id, &self.attempt_id) {
                // Read-your-own-writes: a staged remove reads as gone, a
                // staged insert/replace reads as its staged content.
                return match txn.op {
                    StagedMutationKind::Remove => {
                        Err(TransactionError::DocNotFound { doc: doc.to_string() })
                    }
                    _ => Ok(TransactionGetResult {
                        doc,
                        cas: state.cas,
                        content: txn.staged.clone().unwrap_or(serde_json::Value::Null),
                        restore: state.meta,
                    }),
                };
            }
            // Foreign staged insert: the document does not exist yet from
            // this attempt's point of view.
            if state.tombstone {
                return Err(TransactionError::DocNotFound { doc: doc.to_string() });
            }
            // Foreign staged replace/remove: read the committed body; the
            // conflict only matters if this attempt goes on to write.
        } else if state.tombstone {
            return Err(TransactionError::DocNotFound { doc: doc.to_string() });
        }

        let Some(content) = state.body else {
            return Err(TransactionError::DocNotFound { doc: doc.to_string() });
        };
        Ok(TransactionGetResult { doc, cas: state.cas, content, restore: state.meta })
    }

    /// Stages an insert; the document stays invisible to everyone else
    /// until commit.
    pub async fn insert(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        content: serde_json::Value,
    ) -> Result<TransactionGetResult> {
        self.check_expiry()?;
        self.expect_staging_phase("insert")?;
        let atr = self.ensure_started(keyspace, id).await?;

        let mut xattrs = self.base_xattrs(&atr, StagedMutationKind::Insert);
        xattrs.staged = Some(content.clone());

        let staged = match with_retry(&self.config.retry, self.config.kv_timeout, || {
            staging::stage_insert(
                self.store.as_ref(),
                keyspace,
                id,
                &xattrs,
                self.config.durability,
                None,
            )
        })
        .await
        {
            Ok(result) => result,
            Err(KvError::AlreadyExists | KvError::DurabilityAmbiguous { .. }) => {
                self.recover_staged_insert(keyspace, id, &xattrs).await?
            }
            Err(err) => return Err(err.into()),
        };

        let mutation = StagedMutation {
            kind: StagedMutationKind::Insert,
            doc: DocRef::new(keyspace.clone(), id),
            cas: staged.cas,
            content: Some(content.clone()),
        };
        self.record_mutation(&atr, mutation).await?;

        Ok(TransactionGetResult {
            doc: DocRef::new(keyspace.clone(), id),
            cas: staged.cas,
            content,
            restore: None,
        })
    }

    /// Resolves an insert that hit an existing key or an ambiguous ack: our
    /// own half-staged phantom is taken over, anything else conflicts.
    async fn recover_staged_insert(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        xattrs: &TransactionXattrs,
    ) -> Result<coralkv_kv::MutateInResult> {
        let doc = format!("{keyspace}/{id}");
        let state = match staging::lookup_document(self.store.as_ref(), keyspace, id, false).await {
            Ok(state) => state,
            // The ambiguous write did not land after all; stage fresh.
            Err(KvError::NotFound) => {
                return staging::stage_insert(
                    self.store.as_ref(),
                    keyspace,
                    id,
                    xattrs,
                    self.config.durability,
                    None,
                )
                .await
                .map_err(Into::into);
            }
            Err(err) => return Err(err.into()),
        };

        match &state.txn {
            Some(txn) if txn.owned_by(&self.transaction_id, &self.attempt_id) => {
                // Our earlier write landed (or half-landed): re-stage over
                // it under its CAS.
                staging::stage_insert(
                    self.store.as_ref(),
                    keyspace,
                    id,
                    xattrs,
                    self.config.durability,
                    Some(state.cas),
                )
                .await
                .map_err(Into::into)
            }
            Some(txn) if state.tombstone => Err(TransactionError::WriteWriteConflict {
                doc,
                other_transaction: txn.tid.clone(),
            }),
            _ => Err(TransactionError::DocExists { doc }),
        }
    }

    /// Stages a replace of a document previously read in this attempt.
    pub async fn replace(
        &self,
        doc: &TransactionGetResult,
        content: serde_json::Value,
    ) -> Result<TransactionGetResult> {
        self.check_expiry()?;
        self.expect_staging_phase("replace")?;
        let atr = self.ensure_started(&doc.doc.keyspace, &doc.doc.id).await?;

        // Restaging our own earlier write keeps its original nature: a
        // replace layered on a staged insert is still an insert to the
        // outside world.
        let prior = self.ledger.lock().find(&doc.doc).cloned();
        let (kind, cas, restore, access_deleted) = match &prior {
            Some(m) if m.kind == StagedMutationKind::Insert => {
                (StagedMutationKind::Insert, m.cas, None, true)
            }
            Some(m) => (StagedMutationKind::Replace, m.cas, doc.restore.clone(), false),
            None => (StagedMutationKind::Replace, doc.cas, doc.restore.clone(), false),
        };

        let mut xattrs = self.base_xattrs(&atr, kind);
        xattrs.staged = Some(content.clone());
        xattrs.restore = restore;

        let keyspace = doc.doc.keyspace.clone();
        let id = doc.doc.id.clone();
        let staged = with_retry(&self.config.retry, self.config.kv_timeout, || {
            staging::stage_replace(
                self.store.as_ref(),
                &keyspace,
                &id,
                cas,
                &xattrs,
                self.config.durability,
                access_deleted,
            )
        })
        .await
        .map_err(|err| self.classify_stage_conflict(err, &doc.doc))?;

        let mutation = StagedMutation {
            kind,
            doc: doc.doc.clone(),
            cas: staged.cas,
            content: Some(content.clone()),
        };
        self.record_mutation(&atr, mutation).await?;

        Ok(TransactionGetResult {
            doc: doc.doc.clone(),
            cas: staged.cas,
            content,
            restore: doc.restore.clone(),
        })
    }

    /// Stages a remove of a document previously read in this attempt.
    pub async fn remove(&self, doc: &TransactionGetResult) -> Result<()> {
        self.check_expiry()?;
        self.expect_staging_phase("remove")?;
        let atr = self.ensure_started(&doc.doc.keyspace, &doc.doc.id).await?;

        let prior = self.ledger.lock().find(&doc.doc).cloned();
        if let Some(m) = prior
            && m.kind == StagedMutationKind::Insert
        {
            // Removing a document this attempt inserted cancels the pair:
            // drop the phantom and forget both operations.
            staging::remove_staged_insert(
                self.store.as_ref(),
                &doc.doc.keyspace,
                &doc.doc.id,
                m.cas,
                self.config.durability,
            )
            .await?;
            self.ledger.lock().remove(&doc.doc);
            let ledger = self.snapshot_ledger();
            atr.record_staged_docs(&ledger).await?;
            return Ok(());
        }

        let mut xattrs = self.base_xattrs(&atr, StagedMutationKind::Remove);
        xattrs.restore = doc.restore.clone();

        let keyspace = doc.doc.keyspace.clone();
        let id = doc.doc.id.clone();
        let cas = self.ledger.lock().find(&doc.doc).map_or(doc.cas, |m| m.cas);
        let staged = with_retry(&self.config.retry, self.config.kv_timeout, || {
            staging::stage_remove(
                self.store.as_ref(),
                &keyspace,
                &id,
                cas,
                &xattrs,
                self.config.durability,
            )
        })
        .await
        .map_err(|err| self.classify_stage_conflict(err, &doc.doc))?;

        let mutation = StagedMutation {
            kind: StagedMutationKind::Remove,
            doc: doc.doc.clone(),
            cas: staged.cas,
            content: None,
        };
        self.record_mutation(&atr, mutation).await?;
        Ok(())
    }

    /// Appends to the ledger and refreshes the ATR's doc lists so cleanup
    /// can reverse this attempt if the process dies here.
    async fn record_mutation(&self, atr: &AtrManager, mutation: StagedMutation) -> Result<()> {
        self.ledger.lock().upsert(mutation);
        let ledger = self.snapshot_ledger();
        atr.record_staged_docs(&ledger).await
    }

    /// Maps a staging failure on `doc` to its attempt-level meaning.
    fn classify_stage_conflict(&self, err: KvError, doc: &DocRef) -> TransactionError {
        match classify_kv(&err) {
            // The CAS guard lost: either an external writer or another
            // transaction raced us. Both abort this attempt; the facade
            // retries with a fresh read.
            ErrorClass::TransientConflict => {
                debug!(doc = %doc, error = %err, "staging lost a conflict race");
                err.into()
            }
            ErrorClass::NotFound => TransactionError::DocNotFound { doc: doc.to_string() },
            ErrorClass::Ambiguous | ErrorClass::Expired | ErrorClass::Fatal => err.into(),
        }
    }

    fn snapshot_ledger(&self) -> MutationLedger {
        let guard = self.ledger.lock();
        let mut copy = MutationLedger::new();
        for entry in guard.entries() {
            copy.upsert(entry.clone());
        }
        copy
    }

    /// Commits the attempt.
    ///
    /// Writes the `COMMITTED` record (the durability point), rewrites every
    /// staged document to its final state, then removes the ATR entry. Once
    /// the commit record is durable, rollback is no longer possible — a
    /// failure mid-unstage surfaces [`TransactionError::FailedPostCommit`]
    /// and cleanup finishes the job.
    pub async fn commit(&self) -> Result<()> {
        self.check_expiry()?;
        {
            let mut state = self.state.lock();
            match *state {
                // Nothing was staged and no intent recorded: an empty
                // attempt completes trivially.
                AttemptState::NotStarted => {
                    *state = AttemptState::Completed;
                    return Ok(());
                }
                AttemptState::Staging => *state = AttemptState::Committing,
                other => {
                    return Err(TransactionError::IllegalState {
                        state: other,
                        message: "commit".to_owned(),
                        location: snafu::Location::default(),
                    });
                }
            }
        }

        let Some(atr) = self.atr.get() else {
            // Intent was never recorded (started flag without ATR cannot
            // happen); treat as empty attempt.
            *self.state.lock() = AttemptState::Completed;
            return Ok(());
        };

        let ledger = self.snapshot_ledger();
        atr.mutate_commit(&ledger).await.map_err(|err| match err {
            TransactionError::Kv { source } if source.is_ambiguous() => {
                TransactionError::AmbiguousCommit { transaction_id: self.transaction_id.clone() }
            }
            other => other,
        })?;

        // Past the commit point the documents are independent; unstage them
        // concurrently.
        let results = join_all(ledger.entries().iter().map(|m| self.unstage_one(m))).await;
        let failures = results.iter().filter(|r| r.is_err()).count();
        if failures > 0 {
            warn!(
                transaction = %self.transaction_id,
                failures,
                total = ledger.len(),
                "commit incomplete, cleanup will finish unstaging"
            );
            *self.state.lock() = AttemptState::FailedPostCommit;
            return Err(TransactionError::FailedPostCommit {
                transaction_id: self.transaction_id.clone(),
            });
        }

        atr.mutate_complete().await?;
        *self.state.lock() = AttemptState::Completed;
        debug!(transaction = %self.transaction_id, docs = ledger.len(), "attempt committed");
        Ok(())
    }

    /// Applies one staged mutation as the document's real state.
    ///
    /// A CAS mismatch is retried only while the document still carries this
    /// attempt's metadata (an idempotent retry after an ambiguous ack); a
    /// foreign CAS means a recovering peer finished this document already.
    async fn unstage_one(&self, mutation: &StagedMutation) -> Result<()> {
        let keyspace = &mutation.doc.keyspace;
        let id = &mutation.doc.id;
        let mut cas = mutation.cas;
        let null = serde_json::Value::Null;

        for _ in 0..MAX_UNSTAGE_CAS_RETRIES {
            let result = match mutation.kind {
                StagedMutationKind::Insert | StagedMutationKind::Replace => {
                    let content = mutation.content.as_ref().unwrap_or(&null);
                    with_retry(&self.config.retry, self.config.kv_timeout, || {
                        staging::unstage_insert_or_replace(
                            self.store.as_ref(),
                            keyspace,
                            id,
                            cas,
                            content,
                            mutation.kind == StagedMutationKind::Insert,
                            self.config.durability,
                        )
                    })
                    .await
                    .map(|_| ())
                }
                StagedMutationKind::Remove => with_retry(&self.config.retry, self.config.kv_timeout, || {
                    staging::unstage_remove(
                        self.store.as_ref(),
                        keyspace,
                        id,
                        cas,
                        self.config.durability,
                    )
                })
                .await
                .map(|_| ()),
            };

            match result {
                Ok(()) => return Ok(()),
                // A lost CAS race or an ambiguous ack both resolve the same
                // way: re-read; if the document still carries our metadata
                // the write did not land, so retry under the fresh CAS; if
                // the metadata is gone, the work is done (by our ambiguous
                // write or by a cleanup takeover).
                Err(err)
                    if matches!(err, KvError::CasMismatch { .. }) || err.is_ambiguous() =>
                {
                    let state = match staging::lookup_document(
                        self.store.as_ref(),
                        keyspace,
                        id,
                        false,
                    )
                    .await
                    {
                        Ok(state) => state,
                        Err(KvError::NotFound) => return Ok(()),
                        Err(err) => return Err(err.into()),
                    };
                    match &state.txn {
                        Some(txn) if txn.owned_by(&self.transaction_id, &self.attempt_id) => {
                            cas = state.cas;
                        }
                        _ => return Ok(()),
                    }
                }
                Err(KvError::NotFound) if mutation.kind == StagedMutationKind::Remove => {
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(KvError::CasMismatch { expected: cas, current: Cas::ZERO }.into())
    }

    /// Rolls the attempt back: records `ABORTED`, reverses every staged
    /// document, then removes the ATR entry.
    pub async fn rollback(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                AttemptState::NotStarted => {
                    *state = AttemptState::RolledBack;
                    return Ok(());
                }
                AttemptState::Staging => *state = AttemptState::RollingBack,
                other => {
                    return Err(TransactionError::IllegalState {
                        state: other,
                        message: "rollback".to_owned(),
                        location: snafu::Location::default(),
                    });
                }
            }
        }

        let Some(atr) = self.atr.get() else {
            *self.state.lock() = AttemptState::RolledBack;
            return Ok(());
        };

        let ledger = self.snapshot_ledger();
        atr.mutate_aborted(&ledger).await?;

        let results = join_all(ledger.entries().iter().map(|m| self.rollback_one(m))).await;
        let failures = results.iter().filter(|r| r.is_err()).count();
        if failures > 0 {
            // The ABORTED record and its doc lists are durable; cleanup
            // finishes the reversal.
            warn!(
                transaction = %self.transaction_id,
                failures,
                total = ledger.len(),
                "rollback incomplete, cleanup will finish reversing"
            );
        } else {
            atr.mutate_rolled_back().await?;
        }
        *self.state.lock() = AttemptState::RolledBack;
        debug!(transaction = %self.transaction_id, docs = ledger.len(), "attempt rolled back");
        Ok(())
    }

    /// Reverses one staged mutation.
    async fn rollback_one(&self, mutation: &StagedMutation) -> Result<()> {
        let keyspace = &mutation.doc.keyspace;
        let id = &mutation.doc.id;
        let mut cas = mutation.cas;

        for _ in 0..MAX_UNSTAGE_CAS_RETRIES {
            let result = match mutation.kind {
                StagedMutationKind::Insert => with_retry(&self.config.retry, self.config.kv_timeout, || {
                    staging::remove_staged_insert(
                        self.store.as_ref(),
                        keyspace,
                        id,
                        cas,
                        self.config.durability,
                    )
                })
                .await
                .map(|_| ()),
                StagedMutationKind::Replace | StagedMutationKind::Remove => {
                    with_retry(&self.config.retry, self.config.kv_timeout, || {
                        staging::clear_transaction_metadata(
                            self.store.as_ref(),
                            keyspace,
                            id,
                            cas,
                            mutation.kind == StagedMutationKind::Remove,
                            self.config.durability,
                        )
                    })
                    .await
                    .map(|_| ())
                }
            };

            match result {
                Ok(()) => return Ok(()),
                Err(err)
                    if matches!(err, KvError::CasMismatch { .. }) || err.is_ambiguous() =>
                {
                    let state = match staging::lookup_document(
                        self.store.as_ref(),
                        keyspace,
                        id,
                        false,
                    )
                    .await
                    {
                        Ok(state) => state,
                        Err(KvError::NotFound) => return Ok(()),
                        Err(err) => return Err(err.into()),
                    };
                    match &state.txn {
                        Some(txn) if txn.owned_by(&self.transaction_id, &self.attempt_id) => {
                            cas = state.cas;
                        }
                        _ => return Ok(()),
                    }
                }
                Err(KvError::NotFound | KvError::PathNotFound { .. }) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
        Err(KvError::CasMismatch { expected: cas, current: Cas::ZERO }.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::{collections::HashSet, time::Duration};

    use coralkv_kv::{GetOptions, mock::MockKvStore};
    use parking_lot::RwLock;
    use serde_json::json;

    use super::*;

    fn ks() -> KeyspaceRef {
        KeyspaceRef::default_collection("test")
    }

    fn attempt(store: &Arc<MockKvStore>) -> AttemptContext {
        attempt_with_config(store, TransactionsConfig::builder().build().unwrap())
    }

    fn attempt_with_config(store: &Arc<MockKvStore>, config: TransactionsConfig) -> AttemptContext {
        AttemptContext::new(
            Arc::clone(store) as Arc<dyn KvStore>,
            config,
            Uuid::new_v4().to_string(),
            Arc::new(RwLock::new(HashSet::new())),
        )
    }

    #[tokio::test]
    async fn test_empty_commit_completes() {
        let store = Arc::new(MockKvStore::new());
        let ctx = attempt(&store);
        ctx.commit().await.unwrap();
        assert_eq!(ctx.state(), AttemptState::Completed);
        // No ATR document was ever written.
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_insert_commit_makes_content_visible() {
        let store = Arc::new(MockKvStore::new());
        let ctx = attempt(&store);
        ctx.insert(&ks(), "a", json!({"v": 1})).await.unwrap();
        assert_eq!(ctx.state(), AttemptState::Staging);

        // Invisible while staged.
        assert!(store.get(&ks(), "a", GetOptions::default()).await.is_err());

        ctx.commit().await.unwrap();
        assert_eq!(ctx.state(), AttemptState::Completed);
        let body = store.get(&ks(), "a", GetOptions::default()).await.unwrap().body;
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&body).unwrap(), json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_read_your_own_writes() {
        let store = Arc::new(MockKvStore::new());
        let ctx = attempt(&store);
        ctx.insert(&ks(), "a", json!({"v": 1})).await.unwrap();

        let read = ctx.get(&ks(), "a").await.unwrap();
        assert_eq!(read.content(), &json!({"v": 1}));

        let replaced = ctx.replace(&read, json!({"v": 2})).await.unwrap();
        assert_eq!(replaced.content(), &json!({"v": 2}));

        let read = ctx.get(&ks(), "a").await.unwrap();
        assert_eq!(read.content(), &json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_remove_after_insert_cancels_out() {
        let store = Arc::new(MockKvStore::new());
        let ctx = attempt(&store);
        ctx.insert(&ks(), "a", json!({})).await.unwrap();
        let read = ctx.get(&ks(), "a").await.unwrap();
        ctx.remove(&read).await.unwrap();

        assert!(ctx.get(&ks(), "a").await.is_err());
        ctx.commit().await.unwrap();
        assert!(!store.contains_any(&ks(), "a"));
    }

    #[tokio::test]
    async fn test_rollback_restores_pre_staging_state() {
        let store = Arc::new(MockKvStore::new());
        store.seed(&ks(), "b", br#"{"orig":true}"#);

        let ctx = attempt(&store);
        let read = ctx.get(&ks(), "b").await.unwrap();
        ctx.replace(&read, json!({"orig": false})).await.unwrap();
        ctx.rollback().await.unwrap();
        assert_eq!(ctx.state(), AttemptState::RolledBack);

        let body = store.get(&ks(), "b", GetOptions::default()).await.unwrap().body;
        assert_eq!(body, br#"{"orig":true}"#.to_vec());
    }

    #[tokio::test]
    async fn test_expired_attempt_refuses_operations() {
        let store = Arc::new(MockKvStore::new());
        let config = TransactionsConfig::builder()
            .with_expiration_time(Duration::from_millis(10))
            .build()
            .unwrap();
        let ctx = attempt_with_config(&store, config);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let err = ctx.insert(&ks(), "a", json!({})).await.unwrap_err();
        assert!(matches!(err, TransactionError::Expired { .. }));
    }

    #[tokio::test]
    async fn test_commit_then_commit_is_illegal() {
        let store = Arc::new(MockKvStore::new());
        let ctx = attempt(&store);
        ctx.insert(&ks(), "a", json!({})).await.unwrap();
        ctx.commit().await.unwrap();
        let err = ctx.commit().await.unwrap_err();
        assert!(matches!(err, TransactionError::IllegalState { .. }));
    }

    #[tokio::test]
    async fn test_rollback_after_commit_is_illegal() {
        let store = Arc::new(MockKvStore::new());
        let ctx = attempt(&store);
        ctx.insert(&ks(), "a", json!({})).await.unwrap();
        ctx.commit().await.unwrap();
        let err = ctx.rollback().await.unwrap_err();
        assert!(matches!(err, TransactionError::IllegalState { .. }));
    }

    #[tokio::test]
    async fn test_insert_existing_doc_fails() {
        let store = Arc::new(MockKvStore::new());
        store.seed(&ks(), "a", b"{}");
        let ctx = attempt(&store);
        let err = ctx.insert(&ks(), "a", json!({})).await.unwrap_err();
        assert!(matches!(err, TransactionError::DocExists { .. }));
    }

    #[tokio::test]
    async fn test_insert_conflicts_with_foreign_staged_insert() {
        let store = Arc::new(MockKvStore::new());
        let first = attempt(&store);
        first.insert(&ks(), "a", json!({"from": "first"})).await.unwrap();

        let second = attempt(&store);
        let err = second.insert(&ks(), "a", json!({"from": "second"})).await.unwrap_err();
        assert!(matches!(err, TransactionError::WriteWriteConflict { .. }));
    }

    #[tokio::test]
    async fn test_racing_replace_exactly_one_wins() {
        let store = Arc::new(MockKvStore::new());
        store.seed(&ks(), "b", br#"{"v":0}"#);

        let first = attempt(&store);
        let second = attempt(&store);
        let read_first = first.get(&ks(), "b").await.unwrap();
        let read_second = second.get(&ks(), "b").await.unwrap();

        first.replace(&read_first, json!({"v": 1})).await.unwrap();
        let err = second.replace(&read_second, json!({"v": 2})).await.unwrap_err();
        assert!(matches!(err, TransactionError::Kv { source: KvError::CasMismatch { .. } }));
        assert!(err.is_retryable_attempt());
    }

    #[tokio::test]
    async fn test_ambiguous_stage_insert_resolves() {
        let store = Arc::new(MockKvStore::new());
        let ctx = attempt(&store);
        // mutate_pending consumes no injection here: arm it after start by
        // staging a first doc, then injecting for the second.
        ctx.insert(&ks(), "warmup", json!({})).await.unwrap();
        store.inject_ambiguous(1);
        ctx.insert(&ks(), "a", json!({"v": 1})).await.unwrap();

        ctx.commit().await.unwrap();
        let body = store.get(&ks(), "a", GetOptions::default()).await.unwrap().body;
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&body).unwrap(), json!({"v": 1}));
    }
}
