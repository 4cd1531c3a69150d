//! Bounded exponential backoff for backend calls.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::backend::ClassifyError;
use crate::operation::OperationError;

/// Retry ceiling and backoff curve applied to every backend call.
///
/// `max_attempts` counts the first attempt, so a value of `1` disables
/// retries. Which errors qualify is decided by the backend error's
/// [`ClassifyError`] implementation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts per operation, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Factor applied to the delay after each retry.
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Policy with `max_attempts` attempts and no delay between them.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Returns the delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

/// Runs `attempt` until it succeeds, fails permanently, or exhausts the
/// policy's attempt budget.
///
/// # Errors
///
/// Returns [`OperationError::Backend`] for non-transient failures and
/// [`OperationError::RetriesExhausted`] once the ceiling is reached.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt: F,
) -> Result<T, OperationError<E>>
where
    E: ClassifyError + std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let ceiling = policy.max_attempts.max(1);
    let mut made = 0;
    loop {
        made += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => {
                return Err(OperationError::Backend {
                    operation: operation.to_owned(),
                    source: err,
                });
            }
            Err(err) if made >= ceiling => {
                warn!(operation, attempts = made, error = %err, "retry ceiling reached");
                return Err(OperationError::RetriesExhausted {
                    operation: operation.to_owned(),
                    attempts: made,
                    source: err,
                });
            }
            Err(err) => {
                let delay = policy.backoff_after(made);
                debug!(
                    operation,
                    attempt = made,
                    ?delay,
                    error = %err,
                    "transient failure, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use rstest::rstest;
    use thiserror::Error;

    use crate::backend::ErrorClass;

    #[derive(Debug, Error)]
    #[error("{0:?}")]
    struct FakeError(ErrorClass);

    impl ClassifyError for FakeError {
        fn class(&self) -> ErrorClass {
            self.0
        }
    }

    #[rstest]
    #[case(1, Duration::from_millis(100))]
    #[case(2, Duration::from_millis(200))]
    #[case(3, Duration::from_millis(400))]
    #[case(6, Duration::from_secs(1))]
    fn backoff_grows_exponentially_up_to_cap(#[case] attempt: u32, #[case] expected: Duration) {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2,
        };
        assert_eq!(policy.backoff_after(attempt), expected);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures_within_ceiling() {
        let calls = Cell::new(0);
        let result: Result<u32, OperationError<FakeError>> =
            with_retry(&RetryPolicy::immediate(3), "probe", || {
                calls.set(calls.get() + 1);
                let current = calls.get();
                async move {
                    if current < 3 {
                        Err(FakeError(ErrorClass::Transient))
                    } else {
                        Ok(current)
                    }
                }
            })
            .await;

        assert_eq!(result.ok(), Some(3));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn gives_up_at_the_ceiling() {
        let calls = Cell::new(0);
        let result: Result<(), OperationError<FakeError>> =
            with_retry(&RetryPolicy::immediate(2), "probe", || {
                calls.set(calls.get() + 1);
                async { Err(FakeError(ErrorClass::Transient)) }
            })
            .await;

        assert!(
            matches!(result, Err(OperationError::RetriesExhausted { attempts: 2, .. })),
            "unexpected result: {result:?}"
        );
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), OperationError<FakeError>> =
            with_retry(&RetryPolicy::immediate(5), "probe", || {
                calls.set(calls.get() + 1);
                async { Err(FakeError(ErrorClass::Permanent)) }
            })
            .await;

        assert!(matches!(result, Err(OperationError::Backend { .. })));
        assert_eq!(calls.get(), 1);
    }
}
