//! Crash-recovery cleanup and client liveness.
//!
//! Every coordinating process registers itself in a shared client-record
//! document and heartbeats periodically. ATR partitions are divided among
//! the live clients; each client sweeps its share, looking for attempt
//! entries whose expiry has passed, and re-derives the outcome the dead
//! attempt would have reached: expired `PENDING`/`ABORTED` entries are
//! rolled back, expired `COMMITTED` entries are rolled forward. Every
//! document operation is CAS-guarded, so a takeover racing the original
//! (recovering) client is safe — whichever write loses sees a mismatch and
//! stops, because the work is already done.

use std::{collections::HashSet, sync::Arc, time::Duration};

use coralkv_kv::{
    Cas, DurabilityLevel, KeyspaceRef, KvError, KvStore, LookupInOptions, LookupInSpec,
    MutateInOptions, MutateInSpec, ServerMacro, StoreSemantics, SubdocValue, VATTR_CLOCK,
};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    atr::{AtrEntry, AttemptStatus, parse_attempts},
    error::Result,
    fields::{
        ATR_ATTEMPTS, CLIENT_RECORD_DOC_ID, CLIENT_RECORDS_PATH, DocRecord, atr_doc_id,
        attempt_path, client_path,
    },
    ledger::StagedMutationKind,
    staging,
};

/// How many ATR partitions this client advertises it will own.
const DEFAULT_ATR_SHARE: u32 = 1024;

/// Bounded retries when racing another client on a per-document CAS.
const MAX_CLEANUP_CAS_RETRIES: u32 = 3;

/// One client's liveness registration.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Client uuid.
    pub client_id: String,
    /// Server-assigned heartbeat timestamp, epoch ms.
    pub heartbeat_ms: u64,
    /// Staleness window the client advertised, ms.
    pub expires_ms: u64,
    /// ATR partitions the client is willing to own.
    pub num_atrs: u32,
}

impl ClientRecord {
    /// True if the record's heartbeat is stale at `server_now_ms`.
    #[must_use]
    pub fn expired_at(&self, server_now_ms: u64) -> bool {
        server_now_ms.saturating_sub(self.heartbeat_ms) > self.expires_ms
    }
}

/// The client registry plus the server clock snapshot it was read with.
///
/// The clock snapshot, not the local clock, decides staleness — this keeps
/// the protocol immune to skew between coordinating machines.
#[derive(Debug, Clone)]
pub struct ClientRecords {
    /// All registered clients.
    pub clients: Vec<ClientRecord>,
    /// Server logical clock at read time, epoch ms.
    pub server_now_ms: u64,
    /// CAS of the registry document.
    pub cas: Cas,
}

impl ClientRecords {
    /// Ids of clients whose heartbeat is stale.
    #[must_use]
    pub fn expired_ids(&self) -> Vec<String> {
        self.clients
            .iter()
            .filter(|c| c.expired_at(self.server_now_ms))
            .map(|c| c.client_id.clone())
            .collect()
    }

    /// Ids of live clients, sorted — the basis for partition assignment.
    #[must_use]
    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .clients
            .iter()
            .filter(|c| !c.expired_at(self.server_now_ms))
            .map(|c| c.client_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// The uniform slice of ATR partitions a client is responsible for.
///
/// Live clients sorted by id each take a contiguous range, so concurrent
/// cleanup clients neither overlap nor leave gaps. An unlisted client gets
/// everything: better duplicated cleanup than none.
#[must_use]
pub fn assigned_partitions(live_ids: &[String], client_id: &str, num_atrs: u32) -> std::ops::Range<u32> {
    let count = live_ids.len() as u32;
    match live_ids.iter().position(|id| id == client_id) {
        None => 0..num_atrs,
        Some(index) => {
            let index = index as u32;
            let start = index * num_atrs / count;
            let end = (index + 1) * num_atrs / count;
            start..end
        }
    }
}

/// Wire shape of one client entry in the registry document.
#[derive(Debug, Deserialize)]
struct ClientRecordWire {
    #[serde(default)]
    hbt: Option<u64>,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    atrs: Option<u32>,
}

/// Reads and maintains the shared client registry.
pub struct ClientRecordRepository {
    store: Arc<dyn KvStore>,
    keyspace: KeyspaceRef,
    durability: DurabilityLevel,
}

impl ClientRecordRepository {
    /// Creates a repository over the registry document in `keyspace`.
    pub fn new(store: Arc<dyn KvStore>, keyspace: KeyspaceRef, durability: DurabilityLevel) -> Self {
        Self { store, keyspace, durability }
    }

    /// Reads the registry and the server clock snapshot, creating the
    /// registry document first if it does not exist yet.
    pub async fn get_client_record(&self) -> Result<ClientRecords> {
        let specs = [
            LookupInSpec::get_xattr(CLIENT_RECORDS_PATH),
            LookupInSpec::get_xattr(VATTR_CLOCK),
        ];
        let result = match self
            .store
            .lookup_in(&self.keyspace, CLIENT_RECORD_DOC_ID, &specs, LookupInOptions::default())
            .await
        {
            Ok(result) => result,
            Err(KvError::NotFound) => {
                self.create_placeholder_client_record().await?;
                self.store
                    .lookup_in(
                        &self.keyspace,
                        CLIENT_RECORD_DOC_ID,
                        &specs,
                        LookupInOptions::default(),
                    )
                    .await?
            }
            Err(err) => return Err(err.into()),
        };

        #[derive(Deserialize)]
        struct Clock {
            now_ms: u64,
        }
        let clock: Option<Clock> = result.content_as(1)?;
        let raw: Option<serde_json::Value> = result.content_as(0)?;

        let clients = raw
            .as_ref()
            .and_then(serde_json::Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(client_id, value)| {
                        match serde_json::from_value::<ClientRecordWire>(value.clone()) {
                            Ok(wire) => Some(ClientRecord {
                                client_id: client_id.clone(),
                                heartbeat_ms: wire.hbt.unwrap_or(0),
                                expires_ms: wire.exp.unwrap_or(0),
                                num_atrs: wire.atrs.unwrap_or(DEFAULT_ATR_SHARE),
                            }),
                            Err(err) => {
                                warn!(client = %client_id, error = %err, "skipping unreadable client record");
                                None
                            }
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ClientRecords {
            clients,
            server_now_ms: clock.map(|c| c.now_ms).unwrap_or_default(),
            cas: result.cas,
        })
    }

    /// Idempotently creates the registry document if absent.
    pub async fn create_placeholder_client_record(&self) -> Result<()> {
        let specs = [MutateInSpec::set_doc(SubdocValue::json(&serde_json::json!({}))?)];
        let opts = MutateInOptions {
            durability: self.durability,
            store_semantics: StoreSemantics::Insert,
            ..Default::default()
        };
        match self.store.mutate_in(&self.keyspace, CLIENT_RECORD_DOC_ID, &specs, opts).await {
            Ok(_) => Ok(()),
            // Someone else created it first; that is the desired state.
            Err(KvError::AlreadyExists | KvError::DurabilityAmbiguous { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Heartbeats this client, advertises its ATR share, and prunes peers
    /// whose heartbeat exceeded their window — all in one request.
    pub async fn update_client_record(
        &self,
        client_id: &str,
        cleanup_window: Duration,
        atr_count: u32,
        expired_client_ids: &[String],
    ) -> Result<()> {
        let mut specs = vec![
            MutateInSpec::upsert_xattr(
                format!("{}.hbt", client_path(client_id)),
                SubdocValue::Macro(ServerMacro::CurrentTimeMs),
            ),
            MutateInSpec::upsert_xattr(
                format!("{}.exp", client_path(client_id)),
                SubdocValue::json(&(cleanup_window.as_millis() as u64))?,
            ),
            MutateInSpec::upsert_xattr(
                format!("{}.atrs", client_path(client_id)),
                SubdocValue::json(&atr_count)?,
            ),
        ];
        for expired in expired_client_ids {
            specs.push(MutateInSpec::remove_xattr(client_path(expired)));
        }

        let opts = MutateInOptions {
            durability: self.durability,
            store_semantics: StoreSemantics::Upsert,
            ..Default::default()
        };
        match self.store.mutate_in(&self.keyspace, CLIENT_RECORD_DOC_ID, &specs, opts).await {
            Ok(_) | Err(KvError::DurabilityAmbiguous { .. }) => Ok(()),
            // A peer pruned one of the expired records first. Re-issue the
            // heartbeat alone; pruning is already done.
            Err(KvError::PathNotFound { .. }) if !expired_client_ids.is_empty() => {
                debug!(client = %client_id, "expired peer already pruned, retrying heartbeat only");
                let heartbeat_only: Vec<MutateInSpec> = specs
                    .iter()
                    .filter(|s| !matches!(s.op, coralkv_kv::SubdocWriteOp::RemovePath))
                    .cloned()
                    .collect();
                self.store
                    .mutate_in(&self.keyspace, CLIENT_RECORD_DOC_ID, &heartbeat_only, opts)
                    .await
                    .map(|_| ())
                    .map_err(Into::into)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Gracefully deregisters this client on shutdown.
    pub async fn remove_client(&self, client_id: &str, durability: DurabilityLevel) -> Result<()> {
        let specs = [MutateInSpec::remove_xattr(client_path(client_id))];
        let opts = MutateInOptions { durability, ..Default::default() };
        match self.store.mutate_in(&self.keyspace, CLIENT_RECORD_DOC_ID, &specs, opts).await {
            Ok(_) => Ok(()),
            Err(
                KvError::PathNotFound { .. }
                | KvError::NotFound
                | KvError::DurabilityAmbiguous { .. },
            ) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Counters exposed by the cleanup supervisor.
#[derive(Debug, Default)]
pub struct CleanupStats {
    /// ATR documents scanned.
    pub atrs_scanned: std::sync::atomic::AtomicU64,
    /// Expired attempt entries found.
    pub entries_expired: std::sync::atomic::AtomicU64,
    /// Entries fully cleaned (docs handled, entry removed).
    pub entries_cleaned: std::sync::atomic::AtomicU64,
    /// Entries skipped this pass because of an error; retried next sweep.
    pub failures: std::sync::atomic::AtomicU64,
}

/// Sweeps ATR documents for abandoned attempts and finishes them.
pub struct CleanupProcessor {
    store: Arc<dyn KvStore>,
    durability: DurabilityLevel,
}

impl CleanupProcessor {
    /// Creates a processor writing with the given durability.
    pub fn new(store: Arc<dyn KvStore>, durability: DurabilityLevel) -> Self {
        Self { store, durability }
    }

    /// Reads all attempt entries in an ATR plus the server clock snapshot
    /// used to evaluate their expiry.
    pub async fn lookup_attempts(
        &self,
        keyspace: &KeyspaceRef,
        atr_id: &str,
    ) -> Result<(Vec<AtrEntry>, u64)> {
        let specs =
            [LookupInSpec::get_xattr(ATR_ATTEMPTS), LookupInSpec::get_xattr(VATTR_CLOCK)];
        let result = match self
            .store
            .lookup_in(keyspace, atr_id, &specs, LookupInOptions::default())
            .await
        {
            Ok(result) => result,
            // No ATR document: nothing was ever recorded here.
            Err(KvError::NotFound) => return Ok((Vec::new(), 0)),
            Err(err) => return Err(err.into()),
        };

        #[derive(Deserialize)]
        struct Clock {
            now_ms: u64,
        }
        let clock: Option<Clock> = result.content_as(1)?;
        let raw: Option<serde_json::Value> = result.content_as(0)?;
        let entries = raw.map(|v| parse_attempts(&v, result.cas)).unwrap_or_default();
        Ok((entries, clock.map(|c| c.now_ms).unwrap_or_default()))
    }

    /// Sweeps one ATR document: every expired entry is cleaned; errors are
    /// logged and the entry is left for the next pass so one stuck target
    /// never blocks the rest.
    pub async fn sweep_atr(
        &self,
        keyspace: &KeyspaceRef,
        atr_id: &str,
        stats: &CleanupStats,
    ) -> Result<()> {
        use std::sync::atomic::Ordering;

        let (entries, server_now_ms) = self.lookup_attempts(keyspace, atr_id).await?;
        stats.atrs_scanned.fetch_add(1, Ordering::Relaxed);

        for entry in entries {
            if !entry.expired_at(server_now_ms) {
                continue;
            }
            stats.entries_expired.fetch_add(1, Ordering::Relaxed);
            debug!(
                atr = %atr_id,
                attempt = %entry.attempt_id,
                status = entry.status.as_str(),
                started = %format_server_ms(entry.start_ms),
                "cleaning up expired attempt"
            );
            match self.cleanup_entry(keyspace, atr_id, &entry).await {
                Ok(()) => {
                    stats.entries_cleaned.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        atr = %atr_id,
                        attempt = %entry.attempt_id,
                        error = %err,
                        "cleanup failed, will retry next sweep"
                    );
                }
            }
        }
        Ok(())
    }

    /// Re-derives and applies the outcome a live attempt would have
    /// reached, then removes the entry.
    pub async fn cleanup_entry(
        &self,
        atr_keyspace: &KeyspaceRef,
        atr_id: &str,
        entry: &AtrEntry,
    ) -> Result<()> {
        // Listed documents usually share the ATR's keyspace; reuse that
        // handle where they do.
        let resolve = |record: &DocRecord| crate::atr::AtrManager::get_atr_collection(record, atr_keyspace);

        match entry.status {
            // The commit point was passed: roll forward.
            AttemptStatus::Committed => {
                for record in &entry.inserted {
                    self.commit_doc(entry, &resolve(record), &record.id, true).await?;
                }
                for record in &entry.replaced {
                    self.commit_doc(entry, &resolve(record), &record.id, false).await?;
                }
                for record in &entry.removed {
                    self.remove_doc(entry, &resolve(record), &record.id).await?;
                }
            }
            // Never committed: reverse everything that was staged.
            AttemptStatus::Pending | AttemptStatus::Aborted => {
                for record in &entry.inserted {
                    self.rollback_doc(entry, &resolve(record), &record.id, StagedMutationKind::Insert)
                        .await?;
                }
                for record in &entry.replaced {
                    self.rollback_doc(entry, &resolve(record), &record.id, StagedMutationKind::Replace)
                        .await?;
                }
                for record in &entry.removed {
                    self.rollback_doc(entry, &resolve(record), &record.id, StagedMutationKind::Remove)
                        .await?;
                }
            }
        }
        self.remove_entry(atr_keyspace, atr_id, &entry.attempt_id).await
    }

    /// Rolls one committed insert/replace forward, CAS-guarded against a
    /// racing recovery of the same attempt.
    async fn commit_doc(
        &self,
        entry: &AtrEntry,
        keyspace: &KeyspaceRef,
        id: &str,
        insert_mode: bool,
    ) -> Result<()> {
        for _ in 0..MAX_CLEANUP_CAS_RETRIES {
            let state = match staging::lookup_document(self.store.as_ref(), keyspace, id, false).await
            {
                Ok(state) => state,
                Err(KvError::NotFound) => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            let Some(txn) = &state.txn else {
                // Already unstaged by the original attempt or a peer.
                return Ok(());
            };
            if !txn.owned_by(&entry.transaction_id, &entry.attempt_id) {
                return Ok(());
            }
            let Some(content) = txn.staged.clone() else {
                return Ok(());
            };

            match staging::unstage_insert_or_replace(
                self.store.as_ref(),
                keyspace,
                id,
                state.cas,
                &content,
                insert_mode && state.tombstone,
                self.durability,
            )
            .await
            {
                Ok(_) => return Ok(()),
                // Someone else just won this document; re-read and
                // re-evaluate — most likely the work is now done.
                Err(KvError::CasMismatch { .. }) => continue,
                Err(KvError::NotFound) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Rolls one committed remove forward.
    async fn remove_doc(&self, entry: &AtrEntry, keyspace: &KeyspaceRef, id: &str) -> Result<()> {
        for _ in 0..MAX_CLEANUP_CAS_RETRIES {
            let state = match staging::lookup_document(self.store.as_ref(), keyspace, id, false).await
            {
                Ok(state) => state,
                Err(KvError::NotFound) => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            let still_ours = state
                .txn
                .as_ref()
                .is_some_and(|t| t.owned_by(&entry.transaction_id, &entry.attempt_id));
            if !still_ours {
                return Ok(());
            }
            match staging::unstage_remove(self.store.as_ref(), keyspace, id, state.cas, self.durability)
                .await
            {
                Ok(_) => return Ok(()),
                Err(KvError::CasMismatch { .. }) => continue,
                Err(KvError::NotFound) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Reverses one staged document of a never-committed attempt.
    async fn rollback_doc(
        &self,
        entry: &AtrEntry,
        keyspace: &KeyspaceRef,
        id: &str,
        kind: StagedMutationKind,
    ) -> Result<()> {
        for _ in 0..MAX_CLEANUP_CAS_RETRIES {
            let state = match staging::lookup_document(self.store.as_ref(), keyspace, id, false).await
            {
                Ok(state) => state,
                Err(KvError::NotFound) => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            let still_ours = state
                .txn
                .as_ref()
                .is_some_and(|t| t.owned_by(&entry.transaction_id, &entry.attempt_id));
            if !still_ours {
                return Ok(());
            }

            let result = match kind {
                StagedMutationKind::Insert => {
                    staging::remove_staged_insert(
                        self.store.as_ref(),
                        keyspace,
                        id,
                        state.cas,
                        self.durability,
                    )
                    .await
                    .map(|_| ())
                }
                StagedMutationKind::Replace | StagedMutationKind::Remove => {
                    staging::clear_transaction_metadata(
                        self.store.as_ref(),
                        keyspace,
                        id,
                        state.cas,
                        state.tombstone,
                        self.durability,
                    )
                    .await
                    .map(|_| ())
                }
            };
            match result {
                Ok(()) => return Ok(()),
                Err(KvError::CasMismatch { .. }) => continue,
                Err(KvError::NotFound | KvError::PathNotFound { .. }) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Removes the attempt's entry; absence means a peer finished first.
    async fn remove_entry(&self, keyspace: &KeyspaceRef, atr_id: &str, attempt_id: &str) -> Result<()> {
        let specs = [MutateInSpec::remove_xattr(attempt_path(attempt_id))];
        let opts = MutateInOptions { durability: self.durability, ..Default::default() };
        match self.store.mutate_in(keyspace, atr_id, &specs, opts).await {
            Ok(_) => Ok(()),
            Err(
                KvError::PathNotFound { .. }
                | KvError::NotFound
                | KvError::DurabilityAmbiguous { .. },
            ) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Set of keyspaces this coordinator has placed ATRs in; the sweep covers
/// all of them.
pub(crate) type CleanupSet = Arc<RwLock<HashSet<KeyspaceRef>>>;

/// Background task owning this client's heartbeat and cleanup sweeps.
pub struct CleanupSupervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    stats: Arc<CleanupStats>,
}

impl CleanupSupervisor {
    /// Spawns the heartbeat/sweep loop.
    ///
    /// The loop heartbeats every quarter of `cleanup_window` and sweeps this
    /// client's assigned ATR partitions once per window.
    pub(crate) fn spawn(
        store: Arc<dyn KvStore>,
        client_id: String,
        cleanup_window: Duration,
        num_atrs: u32,
        durability: DurabilityLevel,
        cleanup_set: CleanupSet,
    ) -> Self {
        let cancel = CancellationToken::new();
        let stats = Arc::new(CleanupStats::default());
        let task_cancel = cancel.clone();
        let task_stats = Arc::clone(&stats);

        let handle = tokio::spawn(async move {
            let heartbeat_every = (cleanup_window / 4).max(Duration::from_millis(250));
            let mut ticker = tokio::time::interval(heartbeat_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut ticks: u64 = 0;

            loop {
                tokio::select! {
                    biased;
                    () = task_cancel.cancelled() => {
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                let keyspaces: Vec<KeyspaceRef> =
                    cleanup_set.read().iter().cloned().collect();
                for keyspace in &keyspaces {
                    let repo = ClientRecordRepository::new(
                        Arc::clone(&store),
                        keyspace.clone(),
                        durability,
                    );
                    if let Err(err) = heartbeat_and_sweep(
                        &repo,
                        &store,
                        keyspace,
                        &client_id,
                        cleanup_window,
                        num_atrs,
                        durability,
                        &task_stats,
                        // Sweep once per full window; heartbeat every tick.
                        ticks % 4 == 0,
                    )
                    .await
                    {
                        warn!(keyspace = %keyspace, error = %err, "cleanup pass failed");
                    }
                }
                ticks += 1;
            }

            // Graceful deregistration for every keyspace we served.
            let keyspaces: Vec<KeyspaceRef> = cleanup_set.read().iter().cloned().collect();
            for keyspace in keyspaces {
                let repo =
                    ClientRecordRepository::new(Arc::clone(&store), keyspace, durability);
                if let Err(err) = repo.remove_client(&client_id, durability).await {
                    warn!(error = %err, "client deregistration failed");
                }
            }
            info!(client = %client_id, "cleanup supervisor stopped");
        });

        Self { cancel, handle, stats }
    }

    /// The supervisor's counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<CleanupStats> {
        &self.stats
    }

    /// Stops the loop and waits for deregistration to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            warn!(error = %err, "cleanup supervisor task panicked");
        }
    }
}

/// One heartbeat tick, optionally followed by a sweep of this client's
/// assigned partitions.
#[allow(clippy::too_many_arguments)]
async fn heartbeat_and_sweep(
    repo: &ClientRecordRepository,
    store: &Arc<dyn KvStore>,
    keyspace: &KeyspaceRef,
    client_id: &str,
    cleanup_window: Duration,
    num_atrs: u32,
    durability: DurabilityLevel,
    stats: &CleanupStats,
    sweep: bool,
) -> Result<()> {
    let records = repo.get_client_record().await?;
    let expired = records.expired_ids();
    repo.update_client_record(client_id, cleanup_window, num_atrs, &expired).await?;

    if !sweep {
        return Ok(());
    }

    // Partition assignment over the post-prune view of the registry.
    let mut live = records.live_ids();
    if !live.iter().any(|id| id == client_id) {
        live.push(client_id.to_owned());
        live.sort();
    }
    let partitions = assigned_partitions(&live, client_id, num_atrs);
    debug!(
        keyspace = %keyspace,
        clients = live.len(),
        partitions = partitions.len(),
        "sweeping assigned ATR partitions"
    );

    let processor = CleanupProcessor::new(Arc::clone(store), durability);
    for partition in partitions {
        let atr_id = atr_doc_id(partition);
        if let Err(err) = processor.sweep_atr(keyspace, &atr_id, stats).await {
            // A stuck ATR must never block cleanup of the others.
            warn!(atr = %atr_id, error = %err, "sweep failed for ATR, continuing");
        }
    }
    Ok(())
}

/// Renders a server timestamp for tracing output.
fn format_server_ms(ms: Option<u64>) -> String {
    ms.and_then(|ms| chrono::DateTime::from_timestamp_millis(ms as i64))
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_owned())
}
