#![forbid(unsafe_code)]

//! Exponential backoff for collaborator calls.
//!
//! Only errors classified as transient are retried. Waiting goes through a
//! [`Pacer`] so tests can run the backoff schedule without real sleeps.

use async_trait::async_trait;
use std::{fmt, future::Future, time::Duration};
use tracing::debug;

use crate::{error::Classify, shutdown::Shutdown};

/// Time source for backoff and polling delays.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioPacer;

#[async_trait]
impl Pacer for TokioPacer {
    async fn pause(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub enum RetryFailure<E> {
    /// The last error seen, either non-transient or the final transient one.
    Failed { error: E, attempts: u32 },
    /// Shutdown interrupted the attempt or the backoff wait.
    Abandoned,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1 for the first retry).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        pacer: &dyn Pacer,
        shutdown: &Shutdown,
        mut attempt_fn: F,
    ) -> Result<T, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = shutdown.aborted() => return Err(RetryFailure::Abandoned),
                result = attempt_fn(attempt) => result,
            };
            match result {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for_retry(attempt);
                    debug!(operation, attempt, ?delay, %error, "transient failure; retrying");
                    tokio::select! {
                        biased;
                        _ = shutdown.draining() => return Err(RetryFailure::Abandoned),
                        _ = pacer.pause(delay) => {}
                    }
                }
                Err(error) => return Err(RetryFailure::Failed { error, attempts: attempt }),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::InstantPacer;
    use super::*;
    use crate::error::SourceError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        }
    }

    async fn flaky(calls: &AtomicU32, failures: u32) -> Result<&'static str, SourceError> {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        if call < failures {
            Err(SourceError::RateLimited("429".into()))
        } else {
            Ok("done")
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy(5);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for_retry(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn succeeds_when_attempts_exceed_transient_failures() {
        let pacer = InstantPacer::default();
        let calls = AtomicU32::new(0);
        let result = policy(4)
            .run("download", &pacer, &Shutdown::new(), |_| flaky(&calls, 3))
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(pacer.delays.lock().len(), 3);
    }

    #[tokio::test]
    async fn fails_when_transient_failures_use_every_attempt() {
        let pacer = InstantPacer::default();
        let calls = AtomicU32::new(0);
        let result = policy(3)
            .run("download", &pacer, &Shutdown::new(), |_| flaky(&calls, 3))
            .await;
        match result {
            Err(RetryFailure::Failed { error, attempts }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(error, SourceError::RateLimited(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn item_errors_are_not_retried() {
        let pacer = InstantPacer::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(5)
            .run("download", &pacer, &Shutdown::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SourceError::NotFound("private".into())) }
            })
            .await;
        assert!(matches!(
            result,
            Err(RetryFailure::Failed { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(pacer.delays.lock().is_empty());
    }

    #[tokio::test]
    async fn draining_abandons_pending_retry() {
        let pacer = InstantPacer::default();
        let shutdown = Shutdown::new();
        shutdown.begin(Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        let result = policy(5)
            .run("upload", &pacer, &shutdown, |_| flaky(&calls, 10))
            .await;
        assert!(matches!(result, Err(RetryFailure::Abandoned)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
