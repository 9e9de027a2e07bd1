use crate::error::is_retryable;
use anyhow::Result;
use log::warn;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra wait added to every delay.
    pub jitter: Duration,
}

#[derive(Debug)]
pub enum RetryOutcome<T> {
    Done { value: T, attempts: u32 },
    Failed { attempts: u32, error: anyhow::Error },
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: MAX_BACKOFF.max(initial_delay),
            jitter: initial_delay / 4,
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome::Done {
                        value,
                        attempts: attempt,
                    }
                }
                Err(error) => {
                    if attempt >= self.max_attempts || !is_retryable(&error) {
                        return RetryOutcome::Failed {
                            attempts: attempt,
                            error,
                        };
                    }
                    let delay = self.backoff(attempt) + self.jitter_delay();
                    warn!(
                        "{}: attempt {}/{} failed: {:#}. Retrying in {:?}",
                        label, attempt, self.max_attempts, error, delay
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    fn jitter_delay(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Done { attempts, .. } | RetryOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            RetryOutcome::Done { value, .. } => Ok(value),
            RetryOutcome::Failed { error, .. } => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = Arc::new(Mutex::new(0));
        let policy = RetryPolicy::immediate(3);
        let counter = calls.clone();
        let outcome = policy
            .run("test", |attempt| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    if attempt < 3 {
                        Err(anyhow::anyhow!("flaky"))
                    } else {
                        Ok("text")
                    }
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Done { value: "text", attempts: 3 }));
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let policy = RetryPolicy::immediate(3);
        let outcome: RetryOutcome<()> = policy
            .run("test", |_| async { Err(anyhow::anyhow!("down")) })
            .await;
        match outcome {
            RetryOutcome::Failed { attempts, error } => {
                assert_eq!(attempts, 3);
                assert_eq!(error.to_string(), "down");
            }
            RetryOutcome::Done { .. } => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_rejected_stops_immediately() {
        let policy = RetryPolicy::immediate(5);
        let outcome: RetryOutcome<()> = policy
            .run("test", |_| async {
                Err(LlmError::Rejected {
                    status: 401,
                    message: "API key not valid".into(),
                }
                .into())
            })
            .await;
        assert_eq!(outcome.attempts(), 1);
        assert!(outcome.into_result().is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_secs(10));
        assert_eq!(policy.backoff(1), Duration::from_secs(10));
        assert_eq!(policy.backoff(2), Duration::from_secs(20));
        assert_eq!(policy.backoff(3), Duration::from_secs(40));
        assert_eq!(policy.backoff(10), MAX_BACKOFF);
    }
}
