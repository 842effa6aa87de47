//! Retry logic with exponential backoff.
//!
//! Transient store failures (unavailability, timeouts) inside an attempt
//! are retried here with jittered exponential backoff. Conflicts and
//! ambiguous outcomes are deliberately not retried by this layer — they
//! need a re-read first, which is phase-specific logic.

use std::{future::Future, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use coralkv_kv::KvError;
use rand::Rng;

use crate::config::RetryPolicy;

/// Executes a store operation, bounding each try by `op_timeout` and
/// retrying transient failures per `policy`.
///
/// Non-transient errors (CAS mismatch, not-found, durability ambiguity)
/// return immediately for the caller to classify.
pub(crate) async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    op_timeout: Duration,
    mut operation: F,
) -> Result<T, KvError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, KvError>>,
{
    // backon counts retries, not total attempts.
    let max_retries = policy.max_attempts.saturating_sub(1) as usize;
    let jitter_factor = policy.jitter;

    let backoff = ExponentialBuilder::new()
        .with_min_delay(policy.initial_backoff)
        .with_max_delay(policy.max_backoff)
        .with_factor(policy.multiplier as f32)
        .with_max_times(max_retries);

    let bounded = move || {
        let fut = operation();
        async move {
            match tokio::time::timeout(op_timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(KvError::Timeout { duration_ms: op_timeout.as_millis() as u64 }),
            }
        }
    };

    bounded
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .when(|e: &KvError| e.is_transient())
        .notify(|err: &KvError, dur: Duration| {
            let jittered = apply_jitter(dur, jitter_factor);
            tracing::debug!(
                backoff_ms = jittered.as_millis() as u64,
                error = %err,
                "retrying after backoff"
            );
        })
        .await
}

/// Applies jitter in `[dur * (1 - factor), dur * (1 + factor)]` to avoid
/// synchronized retries across contending attempts.
pub(crate) fn apply_jitter(dur: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return dur;
    }

    let factor = factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();

    let base_nanos = dur.as_nanos() as f64;
    let min_nanos = base_nanos * (1.0 - factor);
    let max_nanos = base_nanos * (1.0 + factor);

    let jittered_nanos = rng.random_range(min_nanos..=max_nanos);
    Duration::from_nanos(jittered_nanos as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    fn test_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_transient_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = with_retry(&test_policy(), Duration::from_secs(1), || {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(KvError::Unavailable { message: "blip".to_owned() })
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_conflict_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<(), _> = with_retry(&test_policy(), Duration::from_secs(1), || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(KvError::CasMismatch {
                    expected: coralkv_kv::Cas(1),
                    current: coralkv_kv::Cas(2),
                })
            }
        })
        .await;

        assert!(matches!(result.unwrap_err(), KvError::CasMismatch { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<(), _> = with_retry(&test_policy(), Duration::from_secs(1), || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(KvError::Timeout { duration_ms: 5 })
            }
        })
        .await;

        assert!(matches!(result.unwrap_err(), KvError::Timeout { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_slow_operation_times_out() {
        let policy = RetryPolicy { max_attempts: 1, ..test_policy() };
        let result: Result<(), _> = with_retry(&policy, Duration::from_millis(20), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result.unwrap_err(), KvError::Timeout { .. }));
    }

    #[test]
    fn test_apply_jitter_zero_factor_is_identity() {
        let dur = Duration::from_millis(100);
        assert_eq!(apply_jitter(dur, 0.0), dur);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod proptest_tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Jittered duration stays within `[base*(1-f), base*(1+f)]`.
        #[test]
        fn prop_jitter_within_bounds(base_ms in 1u64..10_000, factor in 0.0f64..=1.0) {
            let dur = Duration::from_millis(base_ms);
            let jittered = apply_jitter(dur, factor);

            let min = Duration::from_nanos((dur.as_nanos() as f64 * (1.0 - factor)).floor() as u64);
            let max = Duration::from_nanos((dur.as_nanos() as f64 * (1.0 + factor)).ceil() as u64);
            prop_assert!(jittered >= min, "{jittered:?} below {min:?}");
            prop_assert!(jittered <= max, "{jittered:?} above {max:?}");
        }

        /// Negative factors are treated as no jitter.
        #[test]
        fn prop_negative_factor_is_identity(base_ms in 1u64..10_000, factor in -10.0f64..0.0) {
            let dur = Duration::from_millis(base_ms);
            prop_assert_eq!(apply_jitter(dur, factor), dur);
        }

        /// ATR partition selection is total and stable.
        #[test]
        fn prop_atr_partition_stable(key in ".{1,64}", num in 1u32..4096) {
            let a = crate::atr::atr_id_for_key(&key, num);
            let b = crate::atr::atr_id_for_key(&key, num);
            prop_assert_eq!(&a, &b);
            let suffix: u32 = a.trim_start_matches("_txn:atr-").parse().unwrap();
            prop_assert!(suffix < num);
        }
    }
}
