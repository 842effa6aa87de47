//! In-memory staged-mutation bookkeeping for one attempt.

use coralkv_kv::{Cas, DocRef};
use serde::{Deserialize, Serialize};

use crate::fields::DocRecord;

/// Kind of mutation staged against a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagedMutationKind {
    /// The document is created by this transaction.
    Insert,
    /// The document's body is replaced by this transaction.
    Replace,
    /// The document is removed by this transaction.
    Remove,
}

/// One staged mutation, owned exclusively by the attempt that created it.
///
/// Never persisted directly; only its effects are, via the target document's
/// hidden metadata and the ATR's doc lists.
#[derive(Debug, Clone)]
pub struct StagedMutation {
    /// Operation kind.
    pub kind: StagedMutationKind,
    /// Target document identity.
    pub doc: DocRef,
    /// CAS of the staged write, used to drive unstage/rollback.
    pub cas: Cas,
    /// Staged content; `None` for removes.
    pub content: Option<serde_json::Value>,
}

impl StagedMutation {
    /// The mutation's serialization view for ATR embedding: identity only.
    #[must_use]
    pub fn record(&self) -> DocRecord {
        DocRecord::new(&self.doc.keyspace, self.doc.id.clone())
    }
}

/// Ordered, append-only collection of an attempt's staged mutations.
///
/// Restaging a document the attempt already staged replaces the earlier
/// entry in place, so the ledger holds at most one entry per document. The
/// ledger has no internal locking; the attempt serializes access.
#[derive(Debug, Default)]
pub struct MutationLedger {
    entries: Vec<StagedMutation>,
}

impl MutationLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a mutation, replacing any earlier entry for the same document.
    pub fn upsert(&mut self, mutation: StagedMutation) {
        match self.entries.iter_mut().find(|e| e.doc == mutation.doc) {
            Some(existing) => *existing = mutation,
            None => self.entries.push(mutation),
        }
    }

    /// The staged mutation for a document, if any.
    #[must_use]
    pub fn find(&self, doc: &DocRef) -> Option<&StagedMutation> {
        self.entries.iter().find(|e| &e.doc == doc)
    }

    /// Drops a document's entry, returning it if one was staged.
    ///
    /// Used when an attempt removes a document it inserted itself: the pair
    /// cancels out entirely.
    pub fn remove(&mut self, doc: &DocRef) -> Option<StagedMutation> {
        let index = self.entries.iter().position(|e| &e.doc == doc)?;
        Some(self.entries.remove(index))
    }

    /// All entries, in staging order.
    #[must_use]
    pub fn entries(&self) -> &[StagedMutation] {
        &self.entries
    }

    /// Entries of one kind, in staging order.
    pub fn of_kind(&self, kind: StagedMutationKind) -> impl Iterator<Item = &StagedMutation> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    /// Document identities of one kind, for ATR embedding.
    #[must_use]
    pub fn doc_records(&self, kind: StagedMutationKind) -> Vec<DocRecord> {
        self.of_kind(kind).map(StagedMutation::record).collect()
    }

    /// Number of staged mutations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing has been staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use coralkv_kv::KeyspaceRef;

    use super::*;

    fn doc(id: &str) -> DocRef {
        DocRef::new(KeyspaceRef::default_collection("main"), id)
    }

    fn staged(kind: StagedMutationKind, id: &str, cas: u64) -> StagedMutation {
        let content = match kind {
            StagedMutationKind::Remove => None,
            _ => Some(serde_json::json!({"id": id})),
        };
        StagedMutation { kind, doc: doc(id), cas: Cas(cas), content }
    }

    #[test]
    fn test_upsert_preserves_order_and_dedups() {
        let mut ledger = MutationLedger::new();
        ledger.upsert(staged(StagedMutationKind::Insert, "a", 1));
        ledger.upsert(staged(StagedMutationKind::Replace, "b", 2));
        // Restaging "a" replaces the entry in place.
        ledger.upsert(staged(StagedMutationKind::Replace, "a", 3));

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.entries()[0].doc.id, "a");
        assert_eq!(ledger.entries()[0].kind, StagedMutationKind::Replace);
        assert_eq!(ledger.entries()[0].cas, Cas(3));
    }

    #[test]
    fn test_filter_by_kind() {
        let mut ledger = MutationLedger::new();
        ledger.upsert(staged(StagedMutationKind::Insert, "a", 1));
        ledger.upsert(staged(StagedMutationKind::Remove, "b", 2));
        ledger.upsert(staged(StagedMutationKind::Insert, "c", 3));

        let inserts = ledger.doc_records(StagedMutationKind::Insert);
        assert_eq!(inserts.len(), 2);
        assert_eq!(inserts[0].id, "a");
        assert_eq!(inserts[1].id, "c");
        assert_eq!(ledger.doc_records(StagedMutationKind::Replace).len(), 0);
    }

    #[test]
    fn test_find() {
        let mut ledger = MutationLedger::new();
        ledger.upsert(staged(StagedMutationKind::Remove, "a", 1));
        assert!(ledger.find(&doc("a")).is_some());
        assert!(ledger.find(&doc("zz")).is_none());
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(serde_json::to_value(StagedMutationKind::Insert).unwrap(), "insert");
        assert_eq!(serde_json::to_value(StagedMutationKind::Replace).unwrap(), "replace");
        assert_eq!(serde_json::to_value(StagedMutationKind::Remove).unwrap(), "remove");
    }
}
