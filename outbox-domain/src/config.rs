//! Outbox 运行配置
//!
//! 所有字段都有默认值，可直接由 `serde` 从配置文件或环境变量反序列化，
//! 未给出的字段回落到默认值。
//!
#[cfg(feature = "eventing")]
use crate::eventing::DispatcherConfig;
use crate::unit_of_work::RetryStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// 写路径的瞬时故障重试
    pub retry: RetryStrategy,
    /// 失败链认领租约（毫秒）
    pub claim_lease_ms: u64,
    /// 新建失败链时 `should_republish` 的初始值
    pub default_should_republish: bool,
    #[cfg(feature = "eventing")]
    pub dispatcher: DispatcherConfig,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            retry: RetryStrategy::default(),
            claim_lease_ms: 60_000,
            default_should_republish: false,
            #[cfg(feature = "eventing")]
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl OutboxConfig {
    pub fn claim_lease(&self) -> Duration {
        Duration::from_millis(self.claim_lease_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: OutboxConfig =
            serde_json::from_str(r#"{ "claim_lease_ms": 500, "retry": { "max_retries": 1 } }"#)
                .unwrap();
        assert_eq!(config.claim_lease(), Duration::from_millis(500));
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.base_delay_ms, RetryStrategy::default().base_delay_ms);
        assert!(!config.default_should_republish);
    }
}
