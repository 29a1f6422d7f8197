//! Bounded retry for Brain calls
//!
//! Fixed attempt count with exponential backoff. The sleeper is injected so the
//! policy can be exercised without real waiting.

use crate::conversation::Turn;
use crate::error::{AgentError, Result};
use crate::llm::{Brain, BrainRequest};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Wraps any Brain with the retry policy; exhaustion becomes `ModelUnavailable`.
pub struct RetryingBrain {
    inner: Arc<dyn Brain>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryingBrain {
    pub fn new(inner: Arc<dyn Brain>, policy: RetryPolicy) -> Self {
        Self::with_sleeper(inner, policy, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(inner: Arc<dyn Brain>, policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { inner, policy, sleeper }
    }
}

#[async_trait]
impl Brain for RetryingBrain {
    async fn converse(&self, request: &BrainRequest) -> Result<Turn> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.converse(request).await {
                Ok(turn) => return Ok(turn),
                Err(e) if e.is_transient() => {
                    if attempt >= self.policy.max_attempts {
                        return Err(AgentError::ModelUnavailable {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        "Brain call failed (attempt {}/{}): {}; retrying in {:?}",
                        attempt, self.policy.max_attempts, e, delay
                    );
                    self.sleeper.sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    struct FlakyBrain {
        failures_left: Mutex<u32>,
        calls: Mutex<u32>,
        error: fn() -> AgentError,
    }

    #[async_trait]
    impl Brain for FlakyBrain {
        async fn converse(&self, _request: &BrainRequest) -> Result<Turn> {
            *self.calls.lock().unwrap() += 1;
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err((self.error)());
            }
            Ok(Turn::model_text("ok"))
        }
    }

    fn flaky(failures: u32, error: fn() -> AgentError) -> Arc<FlakyBrain> {
        Arc::new(FlakyBrain {
            failures_left: Mutex::new(failures),
            calls: Mutex::new(0),
            error,
        })
    }

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_secs(2),
            multiplier: 2,
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
        assert_eq!(policy.delay_after(4), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let inner = flaky(2, || AgentError::Llm("503".to_string()));
        let sleeper = Arc::new(RecordingSleeper { slept: Mutex::new(Vec::new()) });
        let brain = RetryingBrain::with_sleeper(inner.clone(), RetryPolicy::new(3, Duration::from_millis(100)), sleeper.clone());

        let text = brain.complete(&BrainRequest::prompt("hi")).await.unwrap();
        assert_eq!(text, "ok");
        assert_eq!(*inner.calls.lock().unwrap(), 3);
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn test_exhaustion_is_model_unavailable() {
        let inner = flaky(10, || AgentError::Llm("timeout".to_string()));
        let sleeper = Arc::new(RecordingSleeper { slept: Mutex::new(Vec::new()) });
        let brain = RetryingBrain::with_sleeper(inner.clone(), RetryPolicy::new(3, Duration::from_millis(1)), sleeper);

        let err = brain.converse(&BrainRequest::prompt("hi")).await.unwrap_err();
        assert!(matches!(err, AgentError::ModelUnavailable { attempts: 3, .. }));
        assert_eq!(*inner.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let inner = flaky(1, || AgentError::LlmResponse("400 bad request".to_string()));
        let sleeper = Arc::new(RecordingSleeper { slept: Mutex::new(Vec::new()) });
        let brain = RetryingBrain::with_sleeper(inner.clone(), RetryPolicy::default(), sleeper.clone());

        let err = brain.converse(&BrainRequest::prompt("hi")).await.unwrap_err();
        assert!(matches!(err, AgentError::LlmResponse(_)));
        assert_eq!(*inner.calls.lock().unwrap(), 1);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }
}
