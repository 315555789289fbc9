//! Bounded retry policy shared by the LLM client and the backend transport.
//!
//! Rate-limit faults back off exponentially (`base * 2^n`: 1s, 2s, 4s with the
//! default base) up to `rate_limit_retries` times. Any other transport fault
//! is retried `transient_retries` times. Configuration faults are never
//! retried.

use crate::config::RetryConfig;
use crate::error::{Error, FaultKind, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub rate_limit_retries: u32,
    pub transient_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            rate_limit_retries: config.rate_limit_retries,
            transient_retries: config.transient_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            rate_limit_retries: 0,
            transient_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Same retry counts, no waiting. Used by tests and dry runs.
    pub fn without_delay(mut self) -> Self {
        self.base_delay = Duration::ZERO;
        self.max_delay = Duration::ZERO;
        self
    }

    /// How long to wait before the next attempt, or `None` to give up.
    ///
    /// `retries_so_far` counts earlier retries of the same fault class.
    pub fn next_delay(&self, error: &Error, retries_so_far: u32) -> Option<Duration> {
        let budget = match error.fault_kind() {
            FaultKind::Configuration => return None,
            FaultKind::RateLimited => self.rate_limit_retries,
            FaultKind::Transport => self.transient_retries,
        };
        if retries_so_far >= budget {
            return None;
        }
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retries_so_far));
        let hinted = error
            .retry_after_secs()
            .map(Duration::from_secs)
            .unwrap_or_default();
        Some(backoff.max(hinted).min(self.max_delay))
    }

    /// Run `op` until it succeeds or the policy gives up; returns the last error.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut rate_limited = 0;
        let mut transient = 0;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let kind = err.fault_kind();
            let counter = match kind {
                FaultKind::RateLimited => &mut rate_limited,
                FaultKind::Transport => &mut transient,
                FaultKind::Configuration => return Err(err),
            };
            let Some(delay) = self.next_delay(&err, *counter) else {
                return Err(err);
            };
            *counter += 1;

            warn!(
                call = label,
                fault = ?kind,
                attempt = rate_limited + transient,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "remote call failed, retrying"
            );
            if !delay.is_zero() {
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rate_limit() -> Error {
        Error::RateLimit {
            platform: "llm".into(),
            retry_after_secs: None,
        }
    }

    #[test]
    fn rate_limit_backoff_doubles() {
        let policy = RetryPolicy::default();
        let err = rate_limit();
        assert_eq!(policy.next_delay(&err, 0), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(&err, 1), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(&err, 2), Some(Duration::from_secs(4)));
        assert_eq!(policy.next_delay(&err, 3), None);
    }

    #[test]
    fn transient_retried_once_config_never() {
        let policy = RetryPolicy::default();
        let transport = Error::http("connection refused");
        assert_eq!(policy.next_delay(&transport, 0), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(&transport, 1), None);
        assert_eq!(policy.next_delay(&Error::config("bad key"), 0), None);
    }

    #[test]
    fn retry_after_hint_is_capped() {
        let policy = RetryPolicy::default();
        let err = Error::RateLimit {
            platform: "llm".into(),
            retry_after_secs: Some(600),
        };
        assert_eq!(policy.next_delay(&err, 0), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn run_stops_after_budget() {
        let policy = RetryPolicy::default().without_delay();
        let calls = &AtomicU32::new(0);
        let result: Result<()> = policy
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(rate_limit())
            })
            .await;
        assert!(matches!(result, Err(Error::RateLimit { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn run_recovers_after_one_failure() {
        let policy = RetryPolicy::default().without_delay();
        let calls = &AtomicU32::new(0);
        let result = policy
            .run("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::http("reset"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_does_not_retry_configuration() {
        let policy = RetryPolicy::default().without_delay();
        let calls = &AtomicU32::new(0);
        let result: Result<()> = policy
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::api_with_status("llm", "API key not valid", 400))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
