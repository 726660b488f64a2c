use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::capabilities::CapabilityError;
use crate::errors::PipelineError;
use crate::models::PipelineConfig;

/// Errors a retry loop can classify.
pub trait Retryable: Sized {
    fn is_transient(&self) -> bool;
    /// The error reported when a single attempt exceeds its deadline.
    fn timed_out(label: &str, after: Duration) -> Self;
}

impl Retryable for CapabilityError {
    fn is_transient(&self) -> bool {
        CapabilityError::is_transient(self)
    }

    fn timed_out(label: &str, after: Duration) -> Self {
        CapabilityError::Transient(format!(
            "{} timed out after {:.1}s",
            label,
            after.as_secs_f64()
        ))
    }
}

impl Retryable for PipelineError {
    fn is_transient(&self) -> bool {
        PipelineError::is_transient(self)
    }

    fn timed_out(label: &str, after: Duration) -> Self {
        PipelineError::FetchTimeout(format!(
            "{} timed out after {:.1}s",
            label,
            after.as_secs_f64()
        ))
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    Cancelled,
    /// Every attempt failed transiently.
    Exhausted { attempts: u32, last: E },
    Permanent(E),
}

/// Exponential backoff: the delay after the n-th failed attempt is
/// `base * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, exhausts the attempt
    /// budget or `cancel` fires. Each attempt is bounded by `deadline`; an
    /// attempt that exceeds it counts as a transient failure.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let call = op();
            let bounded = async {
                match deadline {
                    Some(limit) => match tokio::time::timeout(limit, call).await {
                        Ok(result) => result,
                        Err(_) => Err(E::timed_out(label, limit)),
                    },
                    None => call.await,
                }
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = bounded => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(RetryError::Permanent(e)),
                Err(e) if attempt >= max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    })
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {}ms",
                        label,
                        attempt,
                        max_attempts,
                        e,
                        delay.as_millis()
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
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
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    async fn flaky(calls: &AtomicU32, failures: u32) -> Result<&'static str, CapabilityError> {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < failures {
            Err(CapabilityError::Transient("503".to_string()))
        } else {
            Ok("ok")
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_succeeds_within_budget() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result = policy(3)
            .run("ocr", None, &token, || flaky(&calls, 2))
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result = policy(3)
            .run("ocr", None, &token, || flaky(&calls, 3))
            .await;
        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.is_transient());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let token = CancellationToken::new();
        let result: Result<(), _> = policy(5)
            .run("ocr", None, &token, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CapabilityError::Permanent("400".to_string()))
            })
            .await;
        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_counts_as_transient() {
        let token = CancellationToken::new();
        let result: Result<(), _> = policy(2)
            .run(
                "translate",
                Some(Duration::from_millis(20)),
                &token,
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<(), CapabilityError>(())
                },
            )
            .await;
        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(last.to_string().contains("timed out"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_call() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let started = Arc::new(AtomicU32::new(0));
        let seen = started.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result: Result<(), RetryError<CapabilityError>> = policy(3)
            .run("ocr", None, &token, || {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_calls() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        token.cancel();
        let result = policy(3)
            .run("ocr", None, &token, || flaky(&calls, 0))
            .await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
