//! Backoff policies for store retries.
//!
//! The policy only decides how long to wait before the next attempt, so the
//! write and scan loops stay testable with a zero-delay policy.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::Result;

/// Decides the delay before retry number `attempt` (1-based).
pub trait BackoffPolicy: Send + Sync {
    /// `None` means give up.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Doubling delay, capped, with a bounded number of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExponentialBackoff {
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_retries: 8,
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }
}

/// Retries immediately, a fixed number of times. Used by tests and dry runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmediateRetry {
    pub max_retries: u32,
}

impl BackoffPolicy for ImmediateRetry {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt >= 1 && attempt <= self.max_retries).then_some(Duration::ZERO)
    }
}

/// Run `op`, retrying transient failures until the policy gives up.
pub async fn retry_transient<T, F, Fut>(
    policy: &dyn BackoffPolicy,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                attempt += 1;
                let Some(delay) = policy.next_delay(attempt) else {
                    return Err(e);
                };
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient store error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = ExponentialBackoff {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_retries: 4,
        };
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(350)));
        assert_eq!(policy.next_delay(4), Some(Duration::from_millis(350)));
        assert_eq!(policy.next_delay(5), None);
    }

    #[tokio::test]
    async fn retry_transient_gives_up_after_policy_limit() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(&ImmediateRetry { max_retries: 2 }, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::TransientStore("throttled".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::TransientStore(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_transient_does_not_retry_not_found() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(&ImmediateRetry { max_retries: 5 }, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::NotFound("0/A_0".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
