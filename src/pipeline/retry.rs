//! Bounded retries with exponential backoff

use crate::extract::ExtractError;
use crate::source::SourceError;
use crate::storage::StorageError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Classification of an error for the retry loop
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// External throttling; adds rate-limit backoff on top of the normal delay
    fn is_rate_limit(&self) -> bool {
        false
    }

    /// Server-requested wait, if any
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for ExtractError {
    fn is_retryable(&self) -> bool {
        !matches!(self, ExtractError::Parse(_))
    }

    fn is_rate_limit(&self) -> bool {
        matches!(self, ExtractError::RateLimited { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ExtractError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Database(_) | StorageError::Io(_) | StorageError::Task(_)
        )
    }
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Unavailable { .. } | SourceError::Io(_))
    }
}

/// Retry policy for one step of chunk processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            rate_limit_backoff: Duration::from_secs(5),
        }
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
    /// At least one attempt was throttled
    pub rate_limited: bool,
}

impl RetryPolicy {
    /// Policy with no waiting between attempts
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            rate_limit_backoff: Duration::ZERO,
        }
    }

    /// Wait before the retry that follows failed attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32, rate_limited: bool, retry_after: Option<Duration>) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        if rate_limited {
            exponential + self.rate_limit_backoff.max(retry_after.unwrap_or_default())
        } else {
            exponential
        }
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempt limit is reached
    pub async fn run<F, Fut, T, E>(&self, operation: &str, mut f: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let allowed = self.max_retries.max(1);
        let mut attempt = 0;
        let mut rate_limited = false;

        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(
                            operation,
                            attempts = attempt + 1,
                            "Operation succeeded after retries"
                        );
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt + 1,
                        rate_limited,
                    };
                }
                Err(e) => {
                    attempt += 1;
                    rate_limited |= e.is_rate_limit();

                    if !e.is_retryable() || attempt >= allowed {
                        warn!(
                            operation,
                            attempts = attempt,
                            retryable = e.is_retryable(),
                            error = %e,
                            "Operation failed"
                        );
                        return RetryOutcome {
                            result: Err(e),
                            attempts: attempt,
                            rate_limited,
                        };
                    }

                    let delay = self.delay_for(attempt - 1, e.is_rate_limit(), e.retry_after());
                    warn!(
                        operation,
                        attempt,
                        max_retries = allowed,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            rate_limit_backoff: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_for(0, false, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1, false, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2, false, None), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3, false, None), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40, false, None), Duration::from_millis(500));
    }

    #[test]
    fn rate_limit_adds_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            rate_limit_backoff: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_for(0, true, None), Duration::from_millis(2100));
        assert_eq!(
            policy.delay_for(0, true, Some(Duration::from_secs(5))),
            Duration::from_millis(5100)
        );
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<(), ExtractError> = RetryPolicy::immediate(3)
            .run("extract", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ExtractError::Timeout(Duration::from_secs(1))) }
            })
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn parse_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<(), ExtractError> = RetryPolicy::immediate(5)
            .run("extract", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ExtractError::Parse("garbage".into())) }
            })
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_and_reports_rate_limiting() {
        let calls = AtomicU32::new(0);
        let outcome = RetryPolicy::immediate(3)
            .run("extract", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ExtractError::RateLimited { retry_after: None })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), 1);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.rate_limited);
    }

    #[tokio::test]
    async fn zero_max_retries_still_attempts_once() {
        let outcome: RetryOutcome<u8, StorageError> =
            RetryPolicy::immediate(0).run("commit", || async { Ok(7) }).await;
        assert_eq!(outcome.result.unwrap(), 7);
        assert_eq!(outcome.attempts, 1);
    }

    #[test]
    fn classification_of_store_and_source_errors() {
        assert!(StorageError::Task("join".into()).is_retryable());
        assert!(!StorageError::MissingEndpoint {
            relationship: "r".into(),
            entity: "e".into()
        }
        .is_retryable());
        assert!(SourceError::Unavailable {
            collection: "kbli".into(),
            reason: "down".into()
        }
        .is_retryable());
        assert!(!SourceError::ChunkNotFound {
            collection: "kbli".into(),
            chunk_id: "k1".into()
        }
        .is_retryable());
    }
}
