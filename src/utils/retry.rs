use crate::utils::error::Result;
use std::future::Future;
use std::time::Duration;

/// 重試策略：`attempts` 是首次失敗後的重試次數，總共最多執行 attempts + 1 次
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    pub fn none() -> Self {
        Self {
            attempts: 0,
            delay: Duration::ZERO,
        }
    }
}

/// Runs `f`, retrying on retryable errors with a fixed delay. Non-retryable
/// errors are returned immediately.
pub async fn with_retries<T, F, Fut>(policy: RetryPolicy, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.attempts && e.is_retryable() => {
                attempt += 1;
                tracing::warn!(
                    "🔶 {} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation,
                    attempt,
                    policy.attempts,
                    policy.delay,
                    e
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::EtlError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn retryable() -> EtlError {
        EtlError::TimeoutError {
            operation: "fetch".to_string(),
            seconds: 1,
        }
    }

    fn fatal() -> EtlError {
        EtlError::ValidationError {
            message: "bad input".to_string(),
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));

        let result = with_retries(policy, "test op", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(retryable())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = with_retries(policy, "test op", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(retryable())
            }
        })
        .await;

        assert!(result.is_err());
        // 1 次原始嘗試 + 2 次重試
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = with_retries(policy, "test op", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(fatal())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_policy_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = with_retries(RetryPolicy::none(), "test op", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(retryable())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
