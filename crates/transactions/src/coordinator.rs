//! Transactions entry point.
//!
//! `Transactions` owns the store handle, the validated configuration, and
//! this process's cleanup registration. `run` executes application logic
//! against fresh attempts, retrying attempts that fail with recoverable
//! conflicts until the transaction's expiry window closes.

use std::{collections::HashSet, future::Future, sync::Arc};

use coralkv_kv::KvStore;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    attempt::{AttemptContext, AttemptState},
    cleanup::{CleanupStats, CleanupSupervisor},
    config::TransactionsConfig,
    error::{Result, TransactionError},
    retry::apply_jitter,
};

/// Outcome of a successfully committed transaction.
#[derive(Debug, Clone)]
pub struct TransactionResult {
    /// The transaction's id, traceable in ATR entries and staged metadata.
    pub transaction_id: String,
    /// False if the commit point was reached but some documents were left
    /// for cleanup to unstage (the outcome is committed either way).
    pub unstaging_complete: bool,
    /// Number of attempts the transaction took.
    pub attempts: u32,
}

/// The transaction coordinator for one process.
///
/// Cheap to share behind an `Arc`; all per-transaction state lives in the
/// attempts it creates.
pub struct Transactions {
    store: Arc<dyn KvStore>,
    config: TransactionsConfig,
    client_id: String,
    cleanup_set: crate::cleanup::CleanupSet,
    supervisor: Mutex<Option<CleanupSupervisor>>,
}

impl Transactions {
    /// Creates a coordinator and, unless disabled, starts the background
    /// cleanup supervisor for this process.
    pub fn new(store: Arc<dyn KvStore>, config: TransactionsConfig) -> Self {
        let client_id = Uuid::new_v4().to_string();
        let cleanup_set: crate::cleanup::CleanupSet = Arc::new(RwLock::new(HashSet::new()));
        if let Some(keyspace) = &config.metadata_keyspace {
            cleanup_set.write().insert(keyspace.clone());
        }

        let supervisor = config.run_cleanup.then(|| {
            CleanupSupervisor::spawn(
                Arc::clone(&store),
                client_id.clone(),
                config.cleanup_window,
                config.num_atrs,
                config.durability,
                Arc::clone(&cleanup_set),
            )
        });

        Self { store, config, client_id, cleanup_set, supervisor: Mutex::new(supervisor) }
    }

    /// This process's cleanup client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The coordinator's configuration.
    #[must_use]
    pub fn config(&self) -> &TransactionsConfig {
        &self.config
    }

    /// Counters of the background cleanup task, if it is running.
    #[must_use]
    pub fn cleanup_stats(&self) -> Option<Arc<CleanupStats>> {
        self.supervisor.lock().as_ref().map(|s| Arc::clone(s.stats()))
    }

    /// Creates a standalone attempt for callers that drive the state
    /// machine directly instead of through [`Transactions::run`].
    #[must_use]
    pub fn new_attempt(&self) -> AttemptContext {
        AttemptContext::new(
            Arc::clone(&self.store),
            self.config.clone(),
            Uuid::new_v4().to_string(),
            Arc::clone(&self.cleanup_set),
        )
    }

    /// Runs `logic` inside a transaction.
    ///
    /// The closure receives a fresh attempt each time; returning `Ok` commits
    /// it. Attempts that fail with a recoverable conflict are rolled back
    /// and retried with jittered backoff until the expiry window closes.
    pub async fn run<F, Fut>(&self, mut logic: F) -> Result<TransactionResult>
    where
        F: FnMut(Arc<AttemptContext>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let transaction_id = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + self.config.expiration_time;
        let mut backoff = self.config.retry.initial_backoff;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let ctx = Arc::new(AttemptContext::new(
                Arc::clone(&self.store),
                self.config.clone(),
                transaction_id.clone(),
                Arc::clone(&self.cleanup_set),
            ));

            let outcome = match logic(Arc::clone(&ctx)).await {
                Ok(()) => ctx.commit().await,
                Err(err) => Err(err),
            };

            match outcome {
                Ok(()) => {
                    return Ok(TransactionResult {
                        transaction_id,
                        unstaging_complete: true,
                        attempts,
                    });
                }
                // Committed but not fully unstaged: the outcome is fixed;
                // report success and leave the rest to cleanup.
                Err(TransactionError::FailedPostCommit { .. }) => {
                    return Ok(TransactionResult {
                        transaction_id,
                        unstaging_complete: false,
                        attempts,
                    });
                }
                Err(err) => {
                    self.abandon_attempt(&ctx).await;

                    if !err.is_retryable_attempt() {
                        return Err(err);
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(TransactionError::AttemptExhausted {
                            attempts,
                            last_error: err.to_string(),
                        });
                    }

                    debug!(
                        transaction = %transaction_id,
                        attempt = attempts,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(apply_jitter(backoff, self.config.retry.jitter)).await;
                    backoff = (backoff.mul_f64(self.config.retry.multiplier))
                        .min(self.config.retry.max_backoff);
                }
            }
        }
    }

    /// Best-effort rollback of a failed attempt; staged leftovers are
    /// cleanup's job if this fails too.
    async fn abandon_attempt(&self, ctx: &AttemptContext) {
        if matches!(ctx.state(), AttemptState::NotStarted | AttemptState::Staging)
            && let Err(rollback_err) = ctx.rollback().await
        {
            warn!(
                transaction = %ctx.transaction_id(),
                error = %rollback_err,
                "rollback of failed attempt incomplete, cleanup will finish it"
            );
        }
    }

    /// Stops the cleanup supervisor and deregisters this client.
    pub async fn shutdown(&self) {
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use coralkv_kv::{GetOptions, KeyspaceRef, mock::MockKvStore};
    use serde_json::json;

    use super::*;

    fn ks() -> KeyspaceRef {
        KeyspaceRef::default_collection("test")
    }

    fn coordinator(store: &Arc<MockKvStore>) -> Transactions {
        let config = TransactionsConfig::builder().with_run_cleanup(false).build().unwrap();
        Transactions::new(Arc::clone(store) as Arc<dyn KvStore>, config)
    }

    #[tokio::test]
    async fn test_run_commits_logic() {
        let store = Arc::new(MockKvStore::new());
        store.seed(&ks(), "doc", br#"{"n":1}"#);
        let txns = coordinator(&store);

        let result = txns
            .run(|ctx| async move {
                let doc = ctx.get(&ks(), "doc").await?;
                let n = doc.content()["n"].as_i64().unwrap();
                ctx.replace(&doc, json!({"n": n + 1})).await?;
                ctx.insert(&ks(), "audit", json!({"was": n})).await?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(result.unstaging_complete);
        assert_eq!(result.attempts, 1);

        let body = store.get(&ks(), "doc", GetOptions::default()).await.unwrap().body;
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&body).unwrap(), json!({"n": 2}));
        assert!(store.contains_visible(&ks(), "audit"));
    }

    #[tokio::test]
    async fn test_run_retries_lost_cas_race() {
        let store = Arc::new(MockKvStore::new());
        store.seed(&ks(), "doc", br#"{"n":1}"#);
        let txns = coordinator(&store);
        let passes = Arc::new(AtomicU32::new(0));

        let passes_outer = Arc::clone(&passes);
        let store_outer = Arc::clone(&store);
        let result = txns
            .run(move |ctx| {
                let passes = Arc::clone(&passes_outer);
                let store = Arc::clone(&store_outer);
                async move {
                    let doc = ctx.get(&ks(), "doc").await?;
                    if passes.fetch_add(1, Ordering::SeqCst) == 0 {
                        // An external writer races the first attempt.
                        store.seed(&ks(), "doc", br#"{"n":99}"#);
                    }
                    ctx.replace(&doc, json!({"n": 2})).await?;
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(result.attempts, 2);
        let body = store.get(&ks(), "doc", GetOptions::default()).await.unwrap().body;
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&body).unwrap(), json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_run_rolls_back_on_logic_error() {
        let store = Arc::new(MockKvStore::new());
        store.seed(&ks(), "doc", br#"{"n":1}"#);
        let txns = coordinator(&store);

        let err = txns
            .run(|ctx| async move {
                let doc = ctx.get(&ks(), "doc").await?;
                ctx.replace(&doc, json!({"n": 2})).await?;
                // Application-level failure after staging.
                Err(TransactionError::Config { message: "boom".to_owned() })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::Config { .. }));

        // The staged change was reversed.
        let body = store.get(&ks(), "doc", GetOptions::default()).await.unwrap().body;
        assert_eq!(body, br#"{"n":1}"#.to_vec());
    }

    #[tokio::test]
    async fn test_new_attempt_is_driveable_directly() {
        let store = Arc::new(MockKvStore::new());
        let txns = coordinator(&store);
        let ctx = txns.new_attempt();
        ctx.insert(&ks(), "a", json!({"ok": true})).await.unwrap();
        ctx.commit().await.unwrap();
        assert!(store.contains_visible(&ks(), "a"));
    }

    #[tokio::test]
    async fn test_shutdown_without_cleanup_is_noop() {
        let store = Arc::new(MockKvStore::new());
        let txns = coordinator(&store);
        txns.shutdown().await;
    }
}
