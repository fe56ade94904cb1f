//! Retry utilities with exponential backoff and jitter.
//!
//! Two flavours share one [`RetryConfig`]:
//! - [`retry_with_backoff`] retries an async call inline (used around single
//!   API calls that may fail transiently).
//! - [`BackoffTracker`] remembers consecutive reconcile failures per object so
//!   a controller's error policy can requeue with a growing delay.
//!
//! # Example
//!
//! ```ignore
//! use conduit_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let pod = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(3),
//!     "get_pod",
//!     || async { pods.get("configcheck-agt-vector-1a2b3c").await },
//! ).await?;
//! ```

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Backoff used by controller error policies: 5s doubling up to 5 minutes
    pub fn reconcile() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }

    /// Un-jittered delay before retry number `attempt` (0-based), capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(64) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Apply 0.5x to 1.5x jitter to a delay
fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
///
/// # Returns
/// The result of the operation, or the last error if max_attempts is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = jitter(config.delay_for_attempt(attempt - 1));
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Per-object consecutive failure counter for controller error policies.
///
/// `kube::runtime::Controller` error policies are synchronous and stateless,
/// so the count lives here, keyed by the object's `kind/namespace/name`.
#[derive(Debug)]
pub struct BackoffTracker {
    config: RetryConfig,
    failures: DashMap<String, u32>,
}

impl Default for BackoffTracker {
    fn default() -> Self {
        Self::new(RetryConfig::reconcile())
    }
}

impl BackoffTracker {
    /// Create a tracker with the given backoff curve
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: DashMap::new(),
        }
    }

    /// Record a failure for `key` and return the jittered delay before the next attempt
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut entry = self.failures.entry(key.to_string()).or_insert(0);
        let attempt = *entry;
        *entry = entry.saturating_add(1);
        jitter(self.config.delay_for_attempt(attempt))
    }

    /// The longest delay this tracker will ever hand out (before jitter)
    pub fn max_delay(&self) -> Duration {
        self.config.max_delay
    }

    /// Forget failures for `key` after a successful reconcile
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Number of consecutive failures recorded for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|v| *v).unwrap_or(0)
    }
}
