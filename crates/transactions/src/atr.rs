//! Active Transaction Record management.
//!
//! An ATR document holds one entry per in-flight attempt under its
//! `attempts` xattr. The entry records intent (`PENDING`), the final set of
//! affected documents, and the terminal outcome (`COMMITTED`/`ABORTED`);
//! removing the entry is the terminal step of both the commit and rollback
//! paths. The entry is mutated only by its owning attempt; cleanup sweeps
//! in other processes read it and race completion through CAS guards on the
//! target documents, never through this manager.

use std::{sync::Arc, time::Duration};

use coralkv_kv::{
    Cas, DurabilityLevel, KeyspaceRef, KvError, KvStore, LookupInOptions, LookupInSpec,
    MutateInOptions, MutateInSpec, ServerMacro, StoreSemantics, SubdocValue,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::Result,
    fields::{DocRecord, atr_doc_id, attempt_field, attempt_path},
    ledger::{MutationLedger, StagedMutationKind},
};

/// Status of an attempt as recorded in its ATR entry.
///
/// Legal transitions: `Pending → Committed → (entry removed)` on the happy
/// path, `Pending → Aborted → (entry removed)` on rollback. Nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    /// Intent recorded; the attempt is staging documents.
    Pending,
    /// The commit point was passed; only forward recovery is legal.
    Committed,
    /// Rollback was chosen; staged documents are being reversed.
    Aborted,
}

impl AttemptStatus {
    /// Wire name stored in the `st` field.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Committed => "COMMITTED",
            Self::Aborted => "ABORTED",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "COMMITTED" => Some(Self::Committed),
            "ABORTED" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// True if `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Committed) | (Self::Pending, Self::Aborted)
        )
    }
}

/// Selects the ATR partition responsible for a document key.
///
/// Stable across clients and releases: every client must agree on which ATR
/// guards a key.
#[must_use]
pub fn atr_id_for_key(key: &str, num_atrs: u32) -> String {
    let partition = (seahash::hash(key.as_bytes()) % u64::from(num_atrs)) as u32;
    atr_doc_id(partition)
}

/// Wire shape of one attempt entry inside an ATR document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AtrEntryWire {
    st: String,
    tid: String,
    #[serde(default)]
    tst: Option<u64>,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    d: Option<String>,
    #[serde(default)]
    ins: Vec<DocRecord>,
    #[serde(default)]
    rep: Vec<DocRecord>,
    #[serde(default)]
    rem: Vec<DocRecord>,
    #[serde(default)]
    tsc: Option<u64>,
    #[serde(default)]
    tsrs: Option<u64>,
    #[serde(default)]
    p: Option<u8>,
}

/// One attempt's entry as read back from an ATR document.
#[derive(Debug, Clone)]
pub struct AtrEntry {
    /// Attempt id (the entry's key under `attempts`).
    pub attempt_id: String,
    /// Owning transaction id.
    pub transaction_id: String,
    /// Recorded status.
    pub status: AttemptStatus,
    /// Server-assigned start timestamp, epoch ms.
    pub start_ms: Option<u64>,
    /// Expiry window granted to the attempt, ms.
    pub expires_after_ms: u64,
    /// Durability the attempt runs with.
    pub durability: DurabilityLevel,
    /// Documents staged as inserts; recorded at commit/abort.
    pub inserted: Vec<DocRecord>,
    /// Documents staged as replaces; recorded at commit/abort.
    pub replaced: Vec<DocRecord>,
    /// Documents staged as removes; recorded at commit/abort.
    pub removed: Vec<DocRecord>,
    /// Commit-start timestamp, epoch ms.
    pub commit_start_ms: Option<u64>,
    /// Rollback-start timestamp, epoch ms.
    pub rollback_start_ms: Option<u64>,
    /// Set while unstaging may be incomplete.
    pub pending_unstage: bool,
    /// CAS of the ATR document when the entry was read.
    pub cas: Cas,
}

impl AtrEntry {
    fn from_wire(attempt_id: String, wire: AtrEntryWire, cas: Cas) -> Option<Self> {
        let status = AttemptStatus::parse(&wire.st)?;
        Some(Self {
            attempt_id,
            transaction_id: wire.tid,
            status,
            start_ms: wire.tst,
            expires_after_ms: wire.exp.unwrap_or(0),
            durability: wire
                .d
                .as_deref()
                .map(DurabilityLevel::from_str_lossy)
                .unwrap_or_default(),
            inserted: wire.ins,
            replaced: wire.rep,
            removed: wire.rem,
            commit_start_ms: wire.tsc,
            rollback_start_ms: wire.tsrs,
            pending_unstage: wire.p.is_some(),
            cas,
        })
    }

    /// True if the entry's expiry window has elapsed at `server_now_ms`.
    #[must_use]
    pub fn expired_at(&self, server_now_ms: u64) -> bool {
        match self.start_ms {
            // No server timestamp recorded: fail toward eligible so a
            // half-written entry cannot linger forever.
            None => true,
            Some(start) => server_now_ms.saturating_sub(start) > self.expires_after_ms,
        }
    }
}

/// Parses every attempt entry out of an ATR's `attempts` subtree.
pub(crate) fn parse_attempts(raw: &serde_json::Value, cas: Cas) -> Vec<AtrEntry> {
    let Some(map) = raw.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(attempt_id, value)| {
            match serde_json::from_value::<AtrEntryWire>(value.clone()) {
                Ok(wire) => AtrEntry::from_wire(attempt_id.clone(), wire, cas),
                Err(err) => {
                    warn!(attempt_id = %attempt_id, error = %err, "skipping unreadable ATR entry");
                    None
                }
            }
        })
        .collect()
}

/// Owns one attempt's entry in its ATR document.
pub struct AtrManager {
    store: Arc<dyn KvStore>,
    keyspace: KeyspaceRef,
    atr_id: String,
    transaction_id: String,
    attempt_id: String,
    durability: DurabilityLevel,
    expiry: Duration,
}

impl AtrManager {
    /// Creates a manager for one attempt's entry.
    pub fn new(
        store: Arc<dyn KvStore>,
        keyspace: KeyspaceRef,
        atr_id: String,
        transaction_id: String,
        attempt_id: String,
        durability: DurabilityLevel,
        expiry: Duration,
    ) -> Self {
        Self { store, keyspace, atr_id, transaction_id, attempt_id, durability, expiry }
    }

    /// The ATR document this manager writes to.
    #[must_use]
    pub fn atr_record(&self) -> DocRecord {
        DocRecord::new(&self.keyspace, self.atr_id.clone())
    }

    /// Resolves the keyspace an ATR reference points at, reusing the
    /// caller's handle when it already matches (the common case where ATR
    /// and document share a collection).
    #[must_use]
    pub fn get_atr_collection(atr_ref: &DocRecord, current: &KeyspaceRef) -> KeyspaceRef {
        if atr_ref.bucket == current.bucket
            && atr_ref.scope == current.scope
            && atr_ref.collection == current.collection
        {
            current.clone()
        } else {
            atr_ref.keyspace()
        }
    }

    /// Records the attempt's intent: inserts the entry with status
    /// `PENDING`, a server-assigned start timestamp, the expiry window, and
    /// the durability level, upserting a deterministic sentinel body so the
    /// ATR document itself always exists.
    pub async fn mutate_pending(&self) -> Result<()> {
        let aid = &self.attempt_id;
        let specs = [
            MutateInSpec::set_doc(SubdocValue::json(&serde_json::json!(0))?),
            MutateInSpec::insert_xattr(
                attempt_field(aid, "st"),
                SubdocValue::json(&AttemptStatus::Pending.as_str())?,
            ),
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "tid"),
                SubdocValue::json(&self.transaction_id)?,
            ),
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "tst"),
                SubdocValue::Macro(ServerMacro::CurrentTimeMs),
            ),
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "exp"),
                SubdocValue::json(&(self.expiry.as_millis() as u64))?,
            ),
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "d"),
                SubdocValue::json(&self.durability.as_str())?,
            ),
        ];
        let opts = MutateInOptions {
            durability: self.durability,
            store_semantics: StoreSemantics::Upsert,
            ..Default::default()
        };

        match self.store.mutate_in(&self.keyspace, &self.atr_id, &specs, opts).await {
            Ok(_) => {
                debug!(atr = %self.atr_id, attempt = %aid, "ATR entry pending");
                Ok(())
            }
            // An earlier, ambiguously-acknowledged write may have landed:
            // the entry existing with our transaction id means this call
            // already succeeded.
            Err(KvError::PathExists { .. } | KvError::DurabilityAmbiguous { .. }) => {
                match self.read_own_entry().await? {
                    Some(entry) if entry.transaction_id == self.transaction_id => Ok(()),
                    Some(_) => Err(KvError::PathExists { path: attempt_path(aid) }.into()),
                    // The ambiguous write did not land after all.
                    None => self
                        .store
                        .mutate_in(&self.keyspace, &self.atr_id, &specs, opts)
                        .await
                        .map(|_| ())
                        .map_err(Into::into),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Refreshes the entry's doc lists while still `PENDING`, so a cleanup
    /// takeover of a crashed attempt knows which staged documents to
    /// reverse. The commit/abort transition rewrites the lists
    /// authoritatively.
    pub async fn record_staged_docs(&self, ledger: &MutationLedger) -> Result<()> {
        let aid = &self.attempt_id;
        let specs = [
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "ins"),
                SubdocValue::json(&ledger.doc_records(StagedMutationKind::Insert))?,
            ),
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "rep"),
                SubdocValue::json(&ledger.doc_records(StagedMutationKind::Replace))?,
            ),
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "rem"),
                SubdocValue::json(&ledger.doc_records(StagedMutationKind::Remove))?,
            ),
        ];
        let opts = MutateInOptions { durability: self.durability, ..Default::default() };
        match self.store.mutate_in(&self.keyspace, &self.atr_id, &specs, opts).await {
            // The lists are re-derived on the next staging and rewritten at
            // commit/abort; an ambiguous ack needs no resolution here.
            Ok(_) | Err(KvError::DurabilityAmbiguous { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Transitions `PENDING → COMMITTED`, recording the attempt's doc lists
    /// and a commit-start timestamp plus the pending-unstage sentinel
    /// consumed by cleanup.
    pub async fn mutate_commit(&self, ledger: &MutationLedger) -> Result<()> {
        let aid = &self.attempt_id;
        let specs = [
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "st"),
                SubdocValue::json(&AttemptStatus::Committed.as_str())?,
            ),
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "tsc"),
                SubdocValue::Macro(ServerMacro::CurrentTimeMs),
            ),
            MutateInSpec::upsert_xattr(attempt_field(aid, "p"), SubdocValue::json(&0)?),
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "ins"),
                SubdocValue::json(&ledger.doc_records(StagedMutationKind::Insert))?,
            ),
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "rep"),
                SubdocValue::json(&ledger.doc_records(StagedMutationKind::Replace))?,
            ),
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "rem"),
                SubdocValue::json(&ledger.doc_records(StagedMutationKind::Remove))?,
            ),
        ];
        self.write_with_ambiguity_check(&specs, AttemptStatus::Committed).await?;
        debug!(atr = %self.atr_id, attempt = %aid, docs = ledger.len(), "ATR entry committed");
        Ok(())
    }

    /// Transitions `PENDING → ABORTED`, recording the same doc lists so
    /// cleanup knows exactly what to unwind, plus a rollback-start
    /// timestamp.
    pub async fn mutate_aborted(&self, ledger: &MutationLedger) -> Result<()> {
        let aid = &self.attempt_id;
        let specs = [
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "st"),
                SubdocValue::json(&AttemptStatus::Aborted.as_str())?,
            ),
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "tsrs"),
                SubdocValue::Macro(ServerMacro::CurrentTimeMs),
            ),
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "ins"),
                SubdocValue::json(&ledger.doc_records(StagedMutationKind::Insert))?,
            ),
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "rep"),
                SubdocValue::json(&ledger.doc_records(StagedMutationKind::Replace))?,
            ),
            MutateInSpec::upsert_xattr(
                attempt_field(aid, "rem"),
                SubdocValue::json(&ledger.doc_records(StagedMutationKind::Remove))?,
            ),
        ];
        self.write_with_ambiguity_check(&specs, AttemptStatus::Aborted).await?;
        debug!(atr = %self.atr_id, attempt = %aid, "ATR entry aborted");
        Ok(())
    }

    /// Removes the attempt's entry after a completed rollback — terminal.
    pub async fn mutate_rolled_back(&self) -> Result<()> {
        self.remove_entry().await
    }

    /// Removes the attempt's entry after all documents were unstaged —
    /// terminal, the commit path's counterpart to rollback.
    pub async fn mutate_complete(&self) -> Result<()> {
        self.remove_entry().await
    }

    /// Reads only the entry's status field, for fast polling.
    pub async fn lookup_atr_state(&self) -> Result<Option<AttemptStatus>> {
        let specs = [LookupInSpec::get_xattr(attempt_field(&self.attempt_id, "st"))];
        match self
            .store
            .lookup_in(&self.keyspace, &self.atr_id, &specs, LookupInOptions::default())
            .await
        {
            Ok(result) => {
                let status: Option<String> = result.content_as(0)?;
                Ok(status.as_deref().and_then(AttemptStatus::parse))
            }
            Err(KvError::NotFound) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads a specific attempt's entry out of a possibly-foreign ATR
    /// document. Absent means already cleaned up or never written.
    pub async fn find_entry_for_transaction(
        store: &dyn KvStore,
        atr_keyspace: &KeyspaceRef,
        atr_id: &str,
        attempt_id: &str,
    ) -> Result<Option<AtrEntry>, KvError> {
        let specs = [LookupInSpec::get_xattr(attempt_path(attempt_id))];
        let result = match store
            .lookup_in(atr_keyspace, atr_id, &specs, LookupInOptions::default())
            .await
        {
            Ok(result) => result,
            Err(KvError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        let wire: Option<AtrEntryWire> = result.content_as(0)?;
        Ok(wire.and_then(|w| AtrEntry::from_wire(attempt_id.to_owned(), w, result.cas)))
    }

    async fn read_own_entry(&self) -> Result<Option<AtrEntry>> {
        Self::find_entry_for_transaction(
            self.store.as_ref(),
            &self.keyspace,
            &self.atr_id,
            &self.attempt_id,
        )
        .await
        .map_err(Into::into)
    }

    /// Applies a status transition, resolving ambiguous durability by
    /// re-reading the entry: if the recorded status already reflects the
    /// transition, the earlier write landed and this call is a no-op.
    async fn write_with_ambiguity_check(
        &self,
        specs: &[MutateInSpec],
        target: AttemptStatus,
    ) -> Result<()> {
        let opts = MutateInOptions { durability: self.durability, ..Default::default() };
        match self.store.mutate_in(&self.keyspace, &self.atr_id, specs, opts).await {
            Ok(_) => Ok(()),
            Err(KvError::DurabilityAmbiguous { .. }) => match self.read_own_entry().await? {
                Some(entry) if entry.status == target => Ok(()),
                other => {
                    debug!(
                        atr = %self.atr_id,
                        observed = ?other.map(|e| e.status),
                        "ambiguous ATR write did not land, retrying once"
                    );
                    self.store
                        .mutate_in(&self.keyspace, &self.atr_id, specs, opts)
                        .await
                        .map(|_| ())
                        .map_err(Into::into)
                }
            },
            Err(err) => Err(err.into()),
        }
    }

    /// Removes the entry; an already-absent entry or ATR is benign (the
    /// work is done, possibly by a cleanup takeover).
    async fn remove_entry(&self) -> Result<()> {
        let specs = [MutateInSpec::remove_xattr(attempt_path(&self.attempt_id))];
        let opts = MutateInOptions { durability: self.durability, ..Default::default() };
        match self.store.mutate_in(&self.keyspace, &self.atr_id, &specs, opts).await {
            Ok(_) => {
                debug!(atr = %self.atr_id, attempt = %self.attempt_id, "ATR entry removed");
                Ok(())
            }
            Err(KvError::PathNotFound { .. } | KvError::NotFound) => Ok(()),
            Err(KvError::DurabilityAmbiguous { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
