//! Coordinator configuration with builder pattern.

use std::time::Duration;

use coralkv_kv::{DurabilityLevel, KeyspaceRef};
use snafu::ensure;

use crate::error::{ConfigSnafu, Result};

/// Default transaction expiry window (15 seconds).
const DEFAULT_EXPIRATION: Duration = Duration::from_secs(15);

/// Default cleanup window (60 seconds).
const DEFAULT_CLEANUP_WINDOW: Duration = Duration::from_secs(60);

/// Default per-operation KV timeout (2.5 seconds).
const DEFAULT_KV_TIMEOUT: Duration = Duration::from_millis(2500);

/// Default number of ATR documents keys are partitioned across.
const DEFAULT_NUM_ATRS: u32 = 1024;

/// Upper bound on ATR partitions; beyond this a sweep cannot keep up.
const MAX_NUM_ATRS: u32 = 16_384;

/// Retry policy for transient per-operation failures within an attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts per operation (initial try included).
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    /// Backoff cap.
    pub max_backoff: Duration,
    /// Backoff multiplier between retries.
    pub multiplier: f64,
    /// Jitter factor in `[0, 1]` applied to each backoff.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(250),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Configuration for the transaction coordinator.
#[derive(Debug, Clone)]
pub struct TransactionsConfig {
    /// Overall expiry window per transaction.
    pub(crate) expiration_time: Duration,

    /// Durability applied to every transactional mutation.
    pub(crate) durability: DurabilityLevel,

    /// Staleness window after which another client's attempts are eligible
    /// for cleanup takeover.
    pub(crate) cleanup_window: Duration,

    /// Whether this coordinator runs the background cleanup task.
    pub(crate) run_cleanup: bool,

    /// Keyspace holding ATR and client-record documents. `None` places each
    /// transaction's ATR in the keyspace of its first staged document.
    pub(crate) metadata_keyspace: Option<KeyspaceRef>,

    /// Number of ATR documents keys are partitioned across.
    pub(crate) num_atrs: u32,

    /// Per-operation KV time budget.
    pub(crate) kv_timeout: Duration,

    /// Retry policy for transient per-operation failures.
    pub(crate) retry: RetryPolicy,
}

impl TransactionsConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> TransactionsConfigBuilder {
        TransactionsConfigBuilder::default()
    }

    /// The transaction expiry window.
    #[must_use]
    pub fn expiration_time(&self) -> Duration {
        self.expiration_time
    }

    /// The durability level applied to transactional mutations.
    #[must_use]
    pub fn durability(&self) -> DurabilityLevel {
        self.durability
    }

    /// The cleanup takeover window.
    #[must_use]
    pub fn cleanup_window(&self) -> Duration {
        self.cleanup_window
    }

    /// The number of ATR partitions.
    #[must_use]
    pub fn num_atrs(&self) -> u32 {
        self.num_atrs
    }
}

/// Builder for [`TransactionsConfig`].
#[derive(Debug, Default)]
pub struct TransactionsConfigBuilder {
    expiration_time: Option<Duration>,
    durability: Option<DurabilityLevel>,
    cleanup_window: Option<Duration>,
    run_cleanup: Option<bool>,
    metadata_keyspace: Option<KeyspaceRef>,
    num_atrs: Option<u32>,
    kv_timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
}

impl TransactionsConfigBuilder {
    /// Sets the overall transaction expiry window.
    ///
    /// Default: 15 seconds.
    #[must_use]
    pub fn with_expiration_time(mut self, expiry: Duration) -> Self {
        self.expiration_time = Some(expiry);
        self
    }

    /// Sets the durability level for every transactional mutation.
    ///
    /// Default: [`DurabilityLevel::Majority`].
    #[must_use]
    pub fn with_durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = Some(durability);
        self
    }

    /// Sets the staleness window for cleanup takeover.
    ///
    /// Default: 60 seconds.
    #[must_use]
    pub fn with_cleanup_window(mut self, window: Duration) -> Self {
        self.cleanup_window = Some(window);
        self
    }

    /// Enables or disables this client's background cleanup task.
    ///
    /// Default: enabled.
    #[must_use]
    pub fn with_run_cleanup(mut self, run: bool) -> Self {
        self.run_cleanup = Some(run);
        self
    }

    /// Pins ATR and client-record documents to a dedicated keyspace.
    ///
    /// Default: each transaction's ATR lives in the keyspace of its first
    /// staged document.
    #[must_use]
    pub fn with_metadata_keyspace(mut self, keyspace: KeyspaceRef) -> Self {
        self.metadata_keyspace = Some(keyspace);
        self
    }

    /// Sets the number of ATR documents keys are partitioned across.
    ///
    /// Default: 1024.
    #[must_use]
    pub fn with_num_atrs(mut self, num_atrs: u32) -> Self {
        self.num_atrs = Some(num_atrs);
        self
    }

    /// Sets the per-operation KV time budget.
    ///
    /// Default: 2.5 seconds.
    #[must_use]
    pub fn with_kv_timeout(mut self, timeout: Duration) -> Self {
        self.kv_timeout = Some(timeout);
        self
    }

    /// Sets the retry policy for transient per-operation failures.
    ///
    /// Default: [`RetryPolicy::default()`].
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Builds the configuration, validating all settings.
    pub fn build(self) -> Result<TransactionsConfig> {
        let expiration_time = self.expiration_time.unwrap_or(DEFAULT_EXPIRATION);
        ensure!(
            !expiration_time.is_zero(),
            ConfigSnafu { message: "expiration_time must be non-zero".to_owned() }
        );

        let cleanup_window = self.cleanup_window.unwrap_or(DEFAULT_CLEANUP_WINDOW);
        ensure!(
            cleanup_window >= Duration::from_secs(1),
            ConfigSnafu { message: "cleanup_window must be at least one second".to_owned() }
        );

        let num_atrs = self.num_atrs.unwrap_or(DEFAULT_NUM_ATRS);
        ensure!(
            (1..=MAX_NUM_ATRS).contains(&num_atrs),
            ConfigSnafu { message: format!("num_atrs must be in 1..={MAX_NUM_ATRS}") }
        );

        let retry = self.retry.unwrap_or_default();
        ensure!(
            retry.max_attempts >= 1,
            ConfigSnafu { message: "retry.max_attempts must be at least 1".to_owned() }
        );

        Ok(TransactionsConfig {
            expiration_time,
            durability: self.durability.unwrap_or_default(),
            cleanup_window,
            run_cleanup: self.run_cleanup.unwrap_or(true),
            metadata_keyspace: self.metadata_keyspace,
            num_atrs,
            kv_timeout: self.kv_timeout.unwrap_or(DEFAULT_KV_TIMEOUT),
            retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransactionsConfig::builder().build().unwrap();
        assert_eq!(config.expiration_time(), DEFAULT_EXPIRATION);
        assert_eq!(config.durability(), DurabilityLevel::Majority);
        assert_eq!(config.cleanup_window(), DEFAULT_CLEANUP_WINDOW);
        assert_eq!(config.num_atrs(), DEFAULT_NUM_ATRS);
        assert!(config.run_cleanup);
    }

    #[test]
    fn test_zero_expiry_rejected() {
        let err = TransactionsConfig::builder()
            .with_expiration_time(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("expiration_time"));
    }

    #[test]
    fn test_num_atrs_bounds() {
        assert!(TransactionsConfig::builder().with_num_atrs(0).build().is_err());
        assert!(TransactionsConfig::builder().with_num_atrs(MAX_NUM_ATRS + 1).build().is_err());
        assert!(TransactionsConfig::builder().with_num_atrs(64).build().is_ok());
    }

    #[test]
    fn test_metadata_keyspace_override() {
        let ks = KeyspaceRef::default_collection("system");
        let config =
            TransactionsConfig::builder().with_metadata_keyspace(ks.clone()).build().unwrap();
        assert_eq!(config.metadata_keyspace, Some(ks));
    }
}
