use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use crate::config::{RetryConfig, parse_duration};
use crate::error::{EngineError, ProviderError};

/// What to do after a failed provider attempt.
#[derive(Debug)]
pub enum Decision {
    Retry(Duration),
    Surface(EngineError),
}

/// Bounded retry for provider calls: one retry by default, fixed backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        Ok(Self {
            max_attempts: config.max_attempts.max(1),
            backoff: parse_duration("retry backoff", &config.backoff)?,
        })
    }

    /// `attempt` is 1-based and counts the attempt that just failed.
    pub fn decide(&self, provider: &str, attempt: u32, err: ProviderError) -> Decision {
        match err {
            ProviderError::NotConfigured(_) => Decision::Surface(EngineError::ProviderNotConfigured(provider.to_string())),
            ProviderError::Auth { message, .. } => Decision::Surface(EngineError::Auth {
                provider: provider.to_string(),
                message,
            }),
            err if err.is_retryable() && attempt < self.max_attempts => {
                warn!(provider, attempt, error = %err, backoff = ?self.backoff, "provider call failed, retrying");
                Decision::Retry(self.backoff)
            }
            last => Decision::Surface(EngineError::ProviderFailed {
                provider: provider.to_string(),
                attempts: attempt,
                last,
            }),
        }
    }

    /// Run a non-streaming call under the policy. Dropping the returned future
    /// cancels the call or the backoff in progress.
    pub async fn run<T, F, Fut>(&self, provider: &str, mut call: F) -> Result<T, EngineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            let err = match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            match self.decide(provider, attempt, err) {
                Decision::Surface(err) => return Err(err),
                Decision::Retry(delay) => tokio::time::sleep(delay).await,
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::llm::testing::timeout;

    async fn run_script(
        policy: RetryPolicy,
        script: Vec<Result<&'static str, ProviderError>>,
    ) -> (Result<&'static str, EngineError>, u32) {
        let calls = AtomicU32::new(0);
        let script = Mutex::new(VecDeque::from(script));
        let result = policy
            .run("a", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                let next = script.lock().unwrap().pop_front().unwrap_or(Ok("late"));
                async move { next }
            })
            .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn fail_then_succeed_is_success() {
        let (result, calls) = run_script(RetryPolicy::default(), vec![Err(timeout("a")), Ok("done")]).await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_surface_provider_failed() {
        let (result, calls) = run_script(RetryPolicy::default(), vec![Err(timeout("a")), Err(timeout("a"))]).await;
        assert!(matches!(
            result,
            Err(EngineError::ProviderFailed { attempts: 2, last: ProviderError::Timeout { .. }, .. })
        ));
        assert_eq!(calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_errors_are_not_retried() {
        let auth = ProviderError::Auth {
            provider: "a".into(),
            message: "invalid key".into(),
        };
        let (result, calls) = run_script(RetryPolicy::default(), vec![Err(auth)]).await;
        assert!(matches!(result, Err(EngineError::Auth { .. })));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_requests_fail_after_one_attempt() {
        let rejected = ProviderError::Rejected {
            provider: "a".into(),
            status: 400,
            message: "unknown model".into(),
        };
        let (result, calls) = run_script(RetryPolicy::default(), vec![Err(rejected)]).await;
        assert!(matches!(result, Err(EngineError::ProviderFailed { attempts: 1, .. })));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_waited_between_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        };
        let started = tokio::time::Instant::now();
        let (result, calls) = run_script(policy, vec![Err(timeout("a")), Err(timeout("a")), Ok("third")]).await;
        assert_eq!(result.unwrap(), "third");
        assert_eq!(calls, 3);
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[test]
    fn policy_from_config() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 3,
            backoff: "250ms".into(),
        })
        .unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff, Duration::from_millis(250));
    }
}
