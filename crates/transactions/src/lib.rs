//! Multi-document ACID transactions for CoralKV.
//!
//! CoralKV exposes only single-document, CAS-guarded operations. This crate
//! layers atomicity, isolation, and crash recovery on top of that substrate
//! using a staging protocol and a durable commit log — the Active
//! Transaction Record (ATR) — written as hidden metadata inside ordinary
//! documents.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use coralkv_kv::KeyspaceRef;
//! use coralkv_transactions::{Transactions, TransactionsConfig};
//!
//! #[tokio::main]
//! async fn main() -> coralkv_transactions::Result<()> {
//!     let store = Arc::new(connect().await?);
//!     let txns = Transactions::new(store, TransactionsConfig::builder().build()?);
//!
//!     let orders = KeyspaceRef::default_collection("orders");
//!     txns.run(|ctx| {
//!         let orders = orders.clone();
//!         async move {
//!             let doc = ctx.get(&orders, "order-17").await?;
//!             ctx.replace(&doc, serde_json::json!({"status": "paid"})).await?;
//!             ctx.insert(&orders, "receipt-17", serde_json::json!({"order": 17})).await?;
//!             Ok(())
//!         }
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Transactions (facade)                      │
//! │  .run() │ attempt retry loop │ cleanup supervisor           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  AttemptContext (state machine)             │
//! │  get/insert/replace/remove │ commit │ rollback │ expiry     │
//! ├──────────────┬──────────────────────┬───────────────────────┤
//! │ Staging      │ AtrManager           │ Cleanup/Liveness      │
//! │ engine       │ PENDING→COMMITTED/   │ client records,       │
//! │ (per-doc     │ ABORTED→removed      │ lost-attempt sweeps   │
//! │ hidden meta) │                      │                       │
//! ├──────────────┴──────────────────────┴───────────────────────┤
//! │            coralkv-kv: CAS + sub-document contract          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol sketch
//!
//! An attempt stages each mutation as hidden metadata on its target document
//! (the visible body is untouched), records intent and outcome in its ATR
//! entry, and only then rewrites documents to their final state. The ATR
//! write that moves the entry to `COMMITTED` is the durability point: before
//! it, a crashed attempt is rolled back; after it, any client — including a
//! cleanup sweep in a different process — rolls the attempt forward.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod atr;
mod attempt;
mod cleanup;
mod config;
mod coordinator;
mod error;
mod fields;
mod ledger;
mod retry;
mod staging;

pub use atr::{AtrEntry, AtrManager, AttemptStatus, atr_id_for_key};
pub use attempt::{AttemptContext, AttemptState, TransactionGetResult};
pub use cleanup::{
    CleanupProcessor, CleanupStats, CleanupSupervisor, ClientRecord, ClientRecordRepository,
    ClientRecords,
};
pub use config::{RetryPolicy, TransactionsConfig, TransactionsConfigBuilder};
pub use coordinator::{TransactionResult, Transactions};
pub use error::{ErrorClass, Result, TransactionError, classify_kv};
pub use fields::{AtrRef, DocRecord, RestoreMeta, TransactionXattrs};
pub use ledger::{MutationLedger, StagedMutation, StagedMutationKind};

// Re-export the identity types callers pass in.
pub use coralkv_kv::{Cas, DocRef, DurabilityLevel, KeyspaceRef};
