//! Retry helpers for optimistic-concurrency writes.
//!
//! Status writes are conditioned on the object's resourceVersion. When a
//! concurrent writer wins, the store answers with a conflict and the whole
//! read-compute-write cycle is repeated with exponential backoff and jitter.
//! Conflicts never leave this module as long as attempts remain; any other
//! error is returned immediately so the work queue can requeue the key.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};
use vmt_storage::StorageError;

use crate::config::BackoffConfig;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Jittered exponential delay for the `failures`-th consecutive failure.
pub fn backoff_delay(cfg: &BackoffConfig, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(20);
    let raw = cfg.base().as_secs_f64() * 2f64.powi(exp as i32);
    let capped = raw.min(cfg.max().as_secs_f64());
    let jitter = rand::rng().random_range(0.5..1.5);
    Duration::from_secs_f64((capped * jitter).min(cfg.max().as_secs_f64()))
}

/// Run `operation` until it succeeds, fails with something other than a
/// conflict, or the attempt budget is exhausted.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_conflict() => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "conflict retries exhausted"
                    );
                    return Err(e);
                }
                let jitter = rand::rng().random_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                debug!(
                    operation = %operation_name,
                    attempt,
                    delay_ms = jittered.as_millis(),
                    "write conflict, re-reading"
                );
                tokio::time::sleep(jittered).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
            Err(e) => return Err(e),
        }
    }
}
