//! In-memory mock document store for coordinator testing.
//!
//! This module provides a controllable [`KvStore`] implementation for testing
//! transaction logic without a real cluster.
//!
//! # Features
//!
//! - **Document storage**: full-body and sub-document operations over an
//!   in-memory map, including access-deleted (tombstone) documents
//! - **Server clock**: a manually-advanced logical clock backing the
//!   `$vbucket.HLC` virtual xattr and the `CurrentTimeMs` macro
//! - **Failure injection**: inject unavailability bursts, durability
//!   ambiguity (the write applies but the caller sees an ambiguous error),
//!   or per-request delays for resilience tests
//! - **Request counting**: per-operation counters for verification
//!
//! # Tombstone semantics
//!
//! An access-deleted document is deleted-but-present: invisible to ordinary
//! reads, reachable with `access_deleted`, its content and xattrs retained.
//! A bodyless tombstone whose last xattr is removed is purged entirely, so
//! "bare phantom" and "never existed" are indistinguishable, matching the
//! store's compaction behavior.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::{
    Cas, GetOptions, GetResult, InsertOptions, KeyspaceRef, KvError, KvStore, LookupInOptions,
    LookupInResult, LookupInSpec, MutateInOptions, MutateInResult, MutateInSpec, MutationToken,
    RemoveOptions, ReplaceOptions, Result, ServerMacro, StoreSemantics, SubdocValue, SubdocWriteOp,
    WriteResult,
    subdoc::{VATTR_CLOCK, VATTR_DOCUMENT},
};

/// Clock origin: 2025-01-01T00:00:00Z in epoch milliseconds.
const CLOCK_ORIGIN_MS: u64 = 1_735_689_600_000;

/// Key for document storage.
type DocKey = (KeyspaceRef, String);

/// A stored document: body bytes, hidden attributes, version metadata.
#[derive(Debug, Clone)]
struct StoredDoc {
    /// JSON body; `None` for documents created as deleted (phantoms).
    body: Option<Vec<u8>>,
    /// Access-deleted flag; the document is invisible to ordinary reads
    /// while set, its content retained.
    hidden: bool,
    /// Hidden extended attributes as a JSON object tree.
    xattrs: Map<String, Value>,
    /// Current CAS.
    cas: Cas,
    /// Revision counter, bumped on every mutation.
    revid: u64,
    /// Expiry in seconds; 0 means none. Carried as metadata only.
    expiry_secs: u32,
}

impl StoredDoc {
    fn is_tombstone(&self) -> bool {
        self.hidden
    }
}

/// Shared mutable state of the mock store.
#[derive(Debug, Default)]
struct MockState {
    /// Document storage.
    docs: RwLock<HashMap<DocKey, StoredDoc>>,

    /// Monotonic CAS source, shared across all documents.
    cas_counter: AtomicU64,

    /// Server logical clock offset from [`CLOCK_ORIGIN_MS`], in ms.
    clock_offset_ms: AtomicU64,

    /// Number of `Unavailable` errors to inject before succeeding.
    unavailable_count: AtomicUsize,

    /// Number of writes to apply but report as `DurabilityAmbiguous`.
    ambiguous_count: AtomicUsize,

    /// Delay injected before each request, in ms.
    delay_ms: AtomicU64,

    /// Total lookup/get requests served.
    read_count: AtomicUsize,

    /// Total mutation requests served.
    write_count: AtomicUsize,
}

/// Controllable in-memory document store.
///
/// Cheap to clone via `Arc`; all state lives behind locks.
#[derive(Debug, Default)]
pub struct MockKvStore {
    state: MockState,
}

impl MockKvStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the server clock.
    pub fn advance_clock(&self, by: Duration) {
        self.state.clock_offset_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Current server clock reading, epoch milliseconds.
    #[must_use]
    pub fn server_now_ms(&self) -> u64 {
        CLOCK_ORIGIN_MS + self.state.clock_offset_ms.load(Ordering::SeqCst)
    }

    /// Injects `n` `Unavailable` failures for upcoming requests.
    pub fn inject_unavailable(&self, n: usize) {
        self.state.unavailable_count.store(n, Ordering::SeqCst);
    }

    /// Injects `n` ambiguous writes: the mutation applies, but the caller
    /// receives `DurabilityAmbiguous`.
    pub fn inject_ambiguous(&self, n: usize) {
        self.state.ambiguous_count.store(n, Ordering::SeqCst);
    }

    /// Sets a delay applied before every request.
    pub fn set_delay(&self, delay: Duration) {
        self.state.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of read requests served.
    #[must_use]
    pub fn read_count(&self) -> usize {
        self.state.read_count.load(Ordering::SeqCst)
    }

    /// Number of mutation requests served.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.state.write_count.load(Ordering::SeqCst)
    }

    /// Returns true if a visible (non-tombstone) document exists.
    #[must_use]
    pub fn contains_visible(&self, keyspace: &KeyspaceRef, id: &str) -> bool {
        self.state
            .docs
            .read()
            .get(&(keyspace.clone(), id.to_owned()))
            .is_some_and(|d| !d.is_tombstone())
    }

    /// Returns true if any entry (tombstone included) exists for the key.
    #[must_use]
    pub fn contains_any(&self, keyspace: &KeyspaceRef, id: &str) -> bool {
        self.state.docs.read().contains_key(&(keyspace.clone(), id.to_owned()))
    }

    /// Seeds a visible document without durability or injection checks.
    pub fn seed(&self, keyspace: &KeyspaceRef, id: &str, body: &[u8]) -> Cas {
        let cas = self.next_cas();
        self.state.docs.write().insert(
            (keyspace.clone(), id.to_owned()),
            StoredDoc {
                body: Some(body.to_vec()),
                hidden: false,
                xattrs: Map::new(),
                cas,
                revid: 1,
                expiry_secs: 0,
            },
        );
        cas
    }

    fn next_cas(&self) -> Cas {
        Cas(self.state.cas_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Bumps the clock by one ms and returns the new reading, so macro
    /// timestamps are strictly monotonic.
    fn tick_ms(&self) -> u64 {
        CLOCK_ORIGIN_MS + self.state.clock_offset_ms.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn before_request(&self, is_write: bool) -> Result<()> {
        let delay = self.state.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if is_write {
            self.state.write_count.fetch_add(1, Ordering::SeqCst);
        } else {
            self.state.read_count.fetch_add(1, Ordering::SeqCst);
        }
        if take_one(&self.state.unavailable_count) {
            return Err(KvError::Unavailable { message: "injected unavailability".to_owned() });
        }
        Ok(())
    }

    /// Consumes one ambiguity injection if armed. Called after a write has
    /// been applied.
    fn take_ambiguous(&self) -> bool {
        take_one(&self.state.ambiguous_count)
    }

    fn check_cas(doc: &StoredDoc, expected: Option<Cas>) -> Result<()> {
        if let Some(expected) = expected
            && expected != doc.cas
        {
            return Err(KvError::CasMismatch { expected, current: doc.cas });
        }
        Ok(())
    }

    fn token(&self) -> MutationToken {
        MutationToken { partition_uuid: 0x6d6f636b, seqno: self.state.cas_counter.load(Ordering::SeqCst) }
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Navigates a dotted path within a JSON object, returning the value if the
/// full path resolves.
fn path_get<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = root.get(first)?;
    for seg in segments {
        current = current.as_object()?.get(seg)?;
    }
    Some(current)
}

/// Navigates to the parent object of `path`, creating intermediate objects
/// when `create` is set. Returns the parent map and the leaf key.
fn path_parent<'a>(
    root: &'a mut Map<String, Value>,
    path: &str,
    create: bool,
) -> Result<(&'a mut Map<String, Value>, String)> {
    let segments: Vec<&str> = path.split('.').collect();
    let (leaf, parents) = segments.split_last().ok_or_else(|| KvError::InvalidArgument {
        message: "empty sub-document path".to_owned(),
        location: snafu::Location::default(),
    })?;

    let mut current = root;
    for seg in parents {
        if !current.contains_key(*seg) {
            if !create {
                return Err(KvError::PathNotFound { path: path.to_owned() });
            }
            current.insert((*seg).to_owned(), Value::Object(Map::new()));
        }
        current = match current.get_mut(*seg) {
            Some(Value::Object(map)) => map,
            _ => return Err(KvError::PathNotFound { path: path.to_owned() }),
        };
    }
    Ok((current, (*leaf).to_owned()))
}

/// Hex checksum of the literal values written in a request, spec order.
fn value_checksum(specs: &[MutateInSpec]) -> String {
    let mut hasher = Sha256::new();
    for spec in specs {
        if let Some(SubdocValue::Bytes(bytes)) = &spec.value {
            hasher.update(bytes);
        }
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
impl KvStore for MockKvStore {
    async fn get(&self, keyspace: &KeyspaceRef, id: &str, opts: GetOptions) -> Result<GetResult> {
        self.before_request(false).await?;
        let docs = self.state.docs.read();
        let doc = docs.get(&(keyspace.clone(), id.to_owned())).ok_or(KvError::NotFound)?;
        if doc.is_tombstone() && !opts.access_deleted {
            return Err(KvError::NotFound);
        }
        Ok(GetResult {
            cas: doc.cas,
            body: doc.body.clone().unwrap_or_default(),
            tombstone: doc.is_tombstone(),
        })
    }

    async fn insert(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        body: &[u8],
        opts: InsertOptions,
    ) -> Result<WriteResult> {
        self.before_request(true).await?;
        let mut docs = self.state.docs.write();
        let key = (keyspace.clone(), id.to_owned());
        if docs.contains_key(&key) {
            return Err(KvError::AlreadyExists);
        }
        let cas = self.next_cas();
        docs.insert(
            key,
            StoredDoc {
                body: Some(body.to_vec()),
                hidden: false,
                xattrs: Map::new(),
                cas,
                revid: 1,
                expiry_secs: opts.expiry_secs,
            },
        );
        drop(docs);
        if self.take_ambiguous() {
            return Err(KvError::DurabilityAmbiguous { waited_ms: 2500 });
        }
        Ok(WriteResult { cas, token: self.token() })
    }

    async fn replace(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        body: &[u8],
        opts: ReplaceOptions,
    ) -> Result<WriteResult> {
        self.before_request(true).await?;
        let mut docs = self.state.docs.write();
        let doc = docs
            .get_mut(&(keyspace.clone(), id.to_owned()))
            .filter(|d| !d.is_tombstone())
            .ok_or(KvError::NotFound)?;
        Self::check_cas(doc, opts.cas)?;
        let cas = self.next_cas();
        doc.body = Some(body.to_vec());
        doc.cas = cas;
        doc.revid += 1;
        drop(docs);
        if self.take_ambiguous() {
            return Err(KvError::DurabilityAmbiguous { waited_ms: 2500 });
        }
        Ok(WriteResult { cas, token: self.token() })
    }

    async fn remove(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        opts: RemoveOptions,
    ) -> Result<WriteResult> {
        self.before_request(true).await?;
        let mut docs = self.state.docs.write();
        let key = (keyspace.clone(), id.to_owned());
        let doc = docs
            .get(&key)
            .filter(|d| opts.access_deleted || !d.is_tombstone())
            .ok_or(KvError::NotFound)?;
        Self::check_cas(doc, opts.cas)?;
        docs.remove(&key);
        drop(docs);
        let cas = self.next_cas();
        if self.take_ambiguous() {
            return Err(KvError::DurabilityAmbiguous { waited_ms: 2500 });
        }
        Ok(WriteResult { cas, token: self.token() })
    }

    async fn lookup_in(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        specs: &[LookupInSpec],
        opts: LookupInOptions,
    ) -> Result<LookupInResult> {
        self.before_request(false).await?;
        let docs = self.state.docs.read();
        let doc = docs.get(&(keyspace.clone(), id.to_owned())).ok_or(KvError::NotFound)?;
        if doc.is_tombstone() && !opts.access_deleted {
            return Err(KvError::NotFound);
        }

        let mut entries = Vec::with_capacity(specs.len());
        for spec in specs {
            let entry = if spec.xattr && spec.path == VATTR_CLOCK {
                Some(serde_json::to_vec(&json!({ "now_ms": self.server_now_ms() })).map_err(
                    |source| KvError::Serialization { source },
                )?)
            } else if spec.xattr && spec.path == VATTR_DOCUMENT {
                Some(
                    serde_json::to_vec(&json!({
                        "CAS": format!("0x{:x}", doc.cas.0),
                        "revid": doc.revid.to_string(),
                        "exptime": doc.expiry_secs,
                    }))
                    .map_err(|source| KvError::Serialization { source })?,
                )
            } else if spec.xattr {
                path_get(&doc.xattrs, &spec.path)
                    .map(|v| serde_json::to_vec(v).map_err(|source| KvError::Serialization { source }))
                    .transpose()?
            } else if spec.path.is_empty() {
                doc.body.clone()
            } else {
                // Body sub-paths: navigate the parsed JSON body.
                match &doc.body {
                    None => None,
                    Some(bytes) => {
                        let parsed: Value = serde_json::from_slice(bytes)
                            .map_err(|source| KvError::Serialization { source })?;
                        parsed
                            .as_object()
                            .and_then(|obj| path_get(obj, &spec.path).cloned())
                            .map(|v| {
                                serde_json::to_vec(&v)
                                    .map_err(|source| KvError::Serialization { source })
                            })
                            .transpose()?
                    }
                }
            };
            entries.push(entry);
        }

        Ok(LookupInResult { cas: doc.cas, tombstone: doc.is_tombstone(), entries })
    }

    async fn mutate_in(
        &self,
        keyspace: &KeyspaceRef,
        id: &str,
        specs: &[MutateInSpec],
        opts: MutateInOptions,
    ) -> Result<MutateInResult> {
        self.before_request(true).await?;
        let mut docs = self.state.docs.write();
        let key = (keyspace.clone(), id.to_owned());

        // Resolve document-level semantics first.
        let existed = docs.contains_key(&key);
        match (existed, opts.store_semantics) {
            (true, StoreSemantics::Insert) => return Err(KvError::AlreadyExists),
            (false, StoreSemantics::Replace) => return Err(KvError::NotFound),
            (false, StoreSemantics::Insert | StoreSemantics::Upsert) => {
                let body = if opts.create_as_deleted { None } else { Some(b"{}".to_vec()) };
                docs.insert(
                    key.clone(),
                    StoredDoc {
                        body,
                        hidden: opts.create_as_deleted,
                        xattrs: Map::new(),
                        cas: Cas::ZERO,
                        revid: 0,
                        expiry_secs: opts.expiry_secs,
                    },
                );
            }
            (true, _) => {}
        }
        let Some(doc) = docs.get_mut(&key) else {
            return Err(KvError::NotFound);
        };
        if existed {
            if doc.is_tombstone() && !opts.access_deleted {
                return Err(KvError::NotFound);
            }
            Self::check_cas(doc, opts.cas)?;
        }

        let new_cas = self.next_cas();
        let checksum = value_checksum(specs);

        // Work on a copy so a failed spec leaves the document untouched;
        // the whole request applies atomically or not at all.
        let mut xattrs = doc.xattrs.clone();
        let mut body = doc.body.clone();
        let mut hidden = doc.hidden;

        for spec in specs {
            let value = spec.value.as_ref().map(|v| match v {
                SubdocValue::Bytes(bytes) => serde_json::from_slice::<Value>(bytes)
                    .map_err(|source| KvError::Serialization { source }),
                SubdocValue::Macro(ServerMacro::MutationCas) => {
                    Ok(Value::String(format!("0x{:x}", new_cas.0)))
                }
                SubdocValue::Macro(ServerMacro::CurrentTimeMs) => Ok(json!(self.tick_ms())),
                SubdocValue::Macro(ServerMacro::ValueCrc) => Ok(Value::String(checksum.clone())),
            });

            match spec.op {
                SubdocWriteOp::SetDoc => {
                    let value = value.transpose()?.ok_or_else(|| KvError::InvalidArgument {
                        message: "set_doc requires a value".to_owned(),
                        location: snafu::Location::default(),
                    })?;
                    body = Some(
                        serde_json::to_vec(&value)
                            .map_err(|source| KvError::Serialization { source })?,
                    );
                }
                SubdocWriteOp::RemoveDoc => {
                    hidden = true;
                }
                SubdocWriteOp::InsertPath | SubdocWriteOp::UpsertPath => {
                    if !spec.xattr {
                        return Err(KvError::InvalidArgument {
                            message: "body path mutations are limited to set_doc/remove_doc"
                                .to_owned(),
                            location: snafu::Location::default(),
                        });
                    }
                    let value = value.transpose()?.ok_or_else(|| KvError::InvalidArgument {
                        message: "path write requires a value".to_owned(),
                        location: snafu::Location::default(),
                    })?;
                    let (parent, leaf) = path_parent(&mut xattrs, &spec.path, spec.create_path)?;
                    if spec.op == SubdocWriteOp::InsertPath && parent.contains_key(&leaf) {
                        return Err(KvError::PathExists { path: spec.path.clone() });
                    }
                    parent.insert(leaf, value);
                }
                SubdocWriteOp::RemovePath => {
                    if !spec.xattr {
                        return Err(KvError::InvalidArgument {
                            message: "body path mutations are limited to set_doc/remove_doc"
                                .to_owned(),
                            location: snafu::Location::default(),
                        });
                    }
                    let (parent, leaf) = path_parent(&mut xattrs, &spec.path, false)?;
                    if parent.remove(&leaf).is_none() {
                        return Err(KvError::PathNotFound { path: spec.path.clone() });
                    }
                }
            }
        }

        if opts.revive {
            hidden = false;
        }
        doc.xattrs = xattrs;
        doc.body = body;
        doc.hidden = hidden;
        doc.cas = new_cas;
        doc.revid += 1;

        // A bodyless phantom with no xattrs left is purged; it reads as
        // never having existed.
        if doc.hidden && doc.body.is_none() && doc.xattrs.is_empty() {
            docs.remove(&key);
        }
        drop(docs);

        if self.take_ambiguous() {
            return Err(KvError::DurabilityAmbiguous { waited_ms: 2500 });
        }
        Ok(MutateInResult { cas: new_cas, token: self.token() })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn ks() -> KeyspaceRef {
        KeyspaceRef::default_collection("test")
    }

    #[tokio::test]
    async fn test_insert_then_get() {
        let store = MockKvStore::new();
        let result = store.insert(&ks(), "a", br#"{"v":1}"#, InsertOptions::default()).await.unwrap();
        let got = store.get(&ks(), "a", GetOptions::default()).await.unwrap();
        assert_eq!(got.cas, result.cas);
        assert_eq!(got.body, br#"{"v":1}"#.to_vec());
    }

    #[tokio::test]
    async fn test_insert_existing_fails() {
        let store = MockKvStore::new();
        store.seed(&ks(), "a", b"{}");
        let err = store.insert(&ks(), "a", b"{}", InsertOptions::default()).await.unwrap_err();
        assert!(matches!(err, KvError::AlreadyExists));
    }

    #[tokio::test]
    async fn test_replace_with_stale_cas() {
        let store = MockKvStore::new();
        let cas = store.seed(&ks(), "a", b"{}");
        store
            .replace(&ks(), "a", br#"{"v":2}"#, ReplaceOptions { cas: Some(cas), ..Default::default() })
            .await
            .unwrap();
        // The original CAS is now stale.
        let err = store
            .replace(&ks(), "a", br#"{"v":3}"#, ReplaceOptions { cas: Some(cas), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::CasMismatch { .. }));
    }

    #[tokio::test]
    async fn test_create_as_deleted_is_invisible() {
        let store = MockKvStore::new();
        let specs =
            [MutateInSpec::insert_xattr("txn.tid", SubdocValue::Bytes(br#""t1""#.to_vec()))];
        store
            .mutate_in(
                &ks(),
                "ghost",
                &specs,
                MutateInOptions {
                    store_semantics: StoreSemantics::Insert,
                    create_as_deleted: true,
                    access_deleted: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Ordinary readers see nothing.
        assert!(matches!(
            store.get(&ks(), "ghost", GetOptions::default()).await.unwrap_err(),
            KvError::NotFound
        ));
        // Tombstone-aware readers see the staged metadata.
        let result = store
            .lookup_in(
                &ks(),
                "ghost",
                &[LookupInSpec::get_xattr("txn.tid")],
                LookupInOptions { access_deleted: true },
            )
            .await
            .unwrap();
        assert!(result.tombstone);
        assert_eq!(result.content_as::<String>(0).unwrap().unwrap(), "t1");
    }

    #[tokio::test]
    async fn test_removing_last_xattr_purges_tombstone() {
        let store = MockKvStore::new();
        let specs = [MutateInSpec::insert_xattr("txn.tid", SubdocValue::Bytes(br#""t""#.to_vec()))];
        let staged = store
            .mutate_in(
                &ks(),
                "ghost",
                &specs,
                MutateInOptions {
                    store_semantics: StoreSemantics::Insert,
                    create_as_deleted: true,
                    access_deleted: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store
            .mutate_in(
                &ks(),
                "ghost",
                &[MutateInSpec::remove_xattr("txn")],
                MutateInOptions {
                    cas: Some(staged.cas),
                    access_deleted: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(!store.contains_any(&ks(), "ghost"));
    }

    #[tokio::test]
    async fn test_macro_expansion() {
        let store = MockKvStore::new();
        store.seed(&ks(), "a", b"{}");
        let specs = [
            MutateInSpec::upsert_xattr("meta.cas", SubdocValue::Macro(ServerMacro::MutationCas)),
            MutateInSpec::upsert_xattr("meta.ts", SubdocValue::Macro(ServerMacro::CurrentTimeMs)),
            MutateInSpec::upsert_xattr("meta.crc", SubdocValue::Macro(ServerMacro::ValueCrc)),
        ];
        let result = store.mutate_in(&ks(), "a", &specs, MutateInOptions::default()).await.unwrap();

        let lookup = store
            .lookup_in(
                &ks(),
                "a",
                &[
                    LookupInSpec::get_xattr("meta.cas"),
                    LookupInSpec::get_xattr("meta.ts"),
                    LookupInSpec::get_xattr("meta.crc"),
                ],
                LookupInOptions::default(),
            )
            .await
            .unwrap();
        let cas_str: String = lookup.content_as(0).unwrap().unwrap();
        assert_eq!(cas_str, format!("0x{:x}", result.cas.0));
        let ts: u64 = lookup.content_as(1).unwrap().unwrap();
        assert!(ts >= CLOCK_ORIGIN_MS);
        let crc: String = lookup.content_as(2).unwrap().unwrap();
        assert_eq!(crc.len(), 16);
    }

    #[tokio::test]
    async fn test_virtual_clock_xattr() {
        let store = MockKvStore::new();
        store.seed(&ks(), "a", b"{}");
        store.advance_clock(Duration::from_secs(30));

        let result = store
            .lookup_in(&ks(), "a", &[LookupInSpec::get_xattr(VATTR_CLOCK)], LookupInOptions::default())
            .await
            .unwrap();
        let clock: Value = result.content_as(0).unwrap().unwrap();
        assert_eq!(clock["now_ms"], json!(CLOCK_ORIGIN_MS + 30_000));
    }

    #[tokio::test]
    async fn test_failed_spec_leaves_document_untouched() {
        let store = MockKvStore::new();
        store.seed(&ks(), "a", b"{}");
        let specs = [
            MutateInSpec::upsert_xattr("one", SubdocValue::Bytes(b"1".to_vec())),
            MutateInSpec::remove_xattr("does.not.exist"),
        ];
        let err = store.mutate_in(&ks(), "a", &specs, MutateInOptions::default()).await.unwrap_err();
        assert!(matches!(err, KvError::PathNotFound { .. }));

        let lookup = store
            .lookup_in(&ks(), "a", &[LookupInSpec::get_xattr("one")], LookupInOptions::default())
            .await
            .unwrap();
        assert!(!lookup.exists(0), "partial request must not apply");
    }

    #[tokio::test]
    async fn test_unavailable_injection_drains() {
        let store = MockKvStore::new();
        store.seed(&ks(), "a", b"{}");
        store.inject_unavailable(2);
        for _ in 0..2 {
            let err = store.get(&ks(), "a", GetOptions::default()).await.unwrap_err();
            assert!(matches!(err, KvError::Unavailable { .. }));
        }
        assert!(store.get(&ks(), "a", GetOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_ambiguous_injection_applies_write() {
        let store = MockKvStore::new();
        let cas = store.seed(&ks(), "a", b"{}");
        store.inject_ambiguous(1);
        let err = store
            .replace(&ks(), "a", br#"{"v":9}"#, ReplaceOptions { cas: Some(cas), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::DurabilityAmbiguous { .. }));
        // The write landed despite the ambiguous response.
        let got = store.get(&ks(), "a", GetOptions::default()).await.unwrap();
        assert_eq!(got.body, br#"{"v":9}"#.to_vec());
    }

    #[tokio::test]
    async fn test_remove_doc_flag_and_revive() {
        let store = MockKvStore::new();
        let cas = store.seed(&ks(), "a", br#"{"keep":1}"#);

        // Flag access-deleted while retaining content.
        let flagged = store
            .mutate_in(
                &ks(),
                "a",
                &[
                    MutateInSpec::upsert_xattr("txn.op", SubdocValue::Bytes(br#""remove""#.to_vec())),
                    MutateInSpec::remove_doc(),
                ],
                MutateInOptions { cas: Some(cas), ..Default::default() },
            )
            .await
            .unwrap();

        assert!(matches!(
            store.get(&ks(), "a", GetOptions::default()).await.unwrap_err(),
            KvError::NotFound
        ));
        let hidden = store.get(&ks(), "a", GetOptions { access_deleted: true }).await.unwrap();
        assert!(hidden.tombstone);
        assert_eq!(hidden.body, br#"{"keep":1}"#.to_vec());

        // Revive restores ordinary visibility with the original body.
        store
            .mutate_in(
                &ks(),
                "a",
                &[MutateInSpec::remove_xattr("txn")],
                MutateInOptions {
                    cas: Some(flagged.cas),
                    access_deleted: true,
                    revive: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let visible = store.get(&ks(), "a", GetOptions::default()).await.unwrap();
        assert_eq!(visible.body, br#"{"keep":1}"#.to_vec());
    }

    #[tokio::test]
    async fn test_insert_path_conflict() {
        let store = MockKvStore::new();
        store.seed(&ks(), "a", b"{}");
        let spec = [MutateInSpec::insert_xattr("txn.tid", SubdocValue::Bytes(br#""x""#.to_vec()))];
        store.mutate_in(&ks(), "a", &spec, MutateInOptions::default()).await.unwrap();
        let err = store.mutate_in(&ks(), "a", &spec, MutateInOptions::default()).await.unwrap_err();
        assert!(matches!(err, KvError::PathExists { .. }));
    }
}
