//! 重试策略：每次调用带超时，Retryable 按指数退避重试，预算耗尽后升级为 Fatal
//!
//! 超时与显式限流共用同一重试预算。

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use crate::config::ExecutorSection;
use crate::core::StageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 首次调用之外允许的重试次数
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// 单次调用超时；None 表示不限时（如等待人工反馈）
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            call_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(section: &ExecutorSection) -> Self {
        Self {
            max_retries: section.max_retries,
            base_backoff: Duration::from_millis(section.base_backoff_ms),
            max_backoff: Duration::from_millis(section.max_backoff_ms.max(section.base_backoff_ms)),
            call_timeout: (section.call_timeout_secs > 0)
                .then(|| Duration::from_secs(section.call_timeout_secs)),
        }
    }

    /// 不重试、不限时
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            call_timeout: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, call_timeout: Option<Duration>) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn without_timeout(&self) -> Self {
        self.clone().with_timeout(None)
    }

    /// 第 attempt 次失败后的等待时长：base * 2^(attempt-1)，封顶 max_backoff
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// 执行 op，最多 1 + max_retries 次；op 收到从 1 开始的尝试序号
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, StageError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let max_attempts = self.max_retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.call_timeout {
                Some(limit) => match timeout(limit, op(attempt)).await {
                    Ok(r) => r,
                    Err(_) => Err(StageError::Retryable(format!(
                        "call timed out after {}ms",
                        limit.as_millis()
                    ))),
                },
                None => op(attempt).await,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(StageError::Fatal(reason)) => return Err(StageError::Fatal(reason)),
                Err(err) if attempt >= max_attempts => return Err(err.escalate(attempt)),
                Err(err) => {
                    let wait = self.backoff(attempt);
                    tracing::warn!(
                        target: "scout::retry",
                        label,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "retryable failure, backing off"
                    );
                    sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            call_timeout: Some(Duration::from_secs(1)),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(350));
        assert_eq!(p.backoff(40), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_then_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = policy(2)
            .run("flaky", move |_| async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StageError::retryable("rate limited"))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_budget() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = policy(2)
            .run("slow", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.reason().contains("timed out"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = policy(5)
            .run("broken", move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StageError::fatal("malformed input"))
            })
            .await;
        assert_eq!(result, Err(StageError::Fatal("malformed input".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
