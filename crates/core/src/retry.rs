use crate::error::ServiceError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff for throttled service calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Runs `operation` until it succeeds, fails with a non-throttling error, or the
/// policy's attempt cap is reached.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    service: &str,
    mut operation: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let attempts = policy.max_attempts.max(1);

    for attempt in 0..attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_rate_limited() => {
                if attempt + 1 == attempts {
                    break;
                }
                let delay = policy.delay_for(attempt);
                warn!(service, attempt, delay_ms = delay.as_millis() as u64, "throttled, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }

    Err(ServiceError::RetriesExhausted {
        service: service.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
        }
    }

    fn throttled() -> ServiceError {
        ServiceError::RateLimited {
            service: "embedding".to_string(),
            details: "429".to_string(),
        }
    }

    #[test]
    fn delays_double_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn recovers_after_transient_throttling() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_with_backoff(&fast_policy(), "embedding", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(throttled())
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_cap() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = retry_with_backoff(&fast_policy(), "embedding", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(throttled())
        })
        .await;

        assert!(matches!(
            result,
            Err(ServiceError::RetriesExhausted { attempts: 4, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = retry_with_backoff(&fast_policy(), "embedding", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::Analyzer("boom".to_string()))
        })
        .await;

        assert!(matches!(result, Err(ServiceError::Analyzer(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
