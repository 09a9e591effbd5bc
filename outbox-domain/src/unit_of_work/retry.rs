use crate::error::OutboxResult;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// 瞬时故障重试策略：仅对 `OutboxError::TransientStorage` 重放整个操作，
/// 重试间隔按指数退避增长并以 `max_delay_ms` 封顶。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryStrategy {
    /// 首次执行之外的最大重试次数
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryStrategy {
    /// 不做任何重试
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.min(16)).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// 执行操作，遇瞬时故障时按策略重放
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> OutboxResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OutboxResult<T>>,
    {
        let mut retry = 0;
        loop {
            match operation().await {
                Err(err) if err.is_transient() && retry < self.max_retries => {
                    let delay = self.delay_for_retry(retry);
                    retry += 1;
                    tracing::warn!(
                        retry,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient storage fault, retrying operation"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}
