use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;

/// 一次投递失败的死信记录，归属且仅归属于一条失败链
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct FailedMessage {
    id: i64,
    chain_id: i64,
    creation_time: DateTime<Utc>,
    /// 失败时捕获的序列化载荷，与原信封的生命周期无关
    body: String,
    event_type_short_name: String,
    /// 重发时忽略该消息，但在链被消费前保留记录
    #[builder(default)]
    should_skip: bool,
    /// 错误消息链（外层在前，逐层 source，换行拼接）
    message: Option<String>,
    stack_trace: Option<String>,
}

impl FailedMessage {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn chain_id(&self) -> i64 {
        self.chain_id
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn event_type_short_name(&self) -> &str {
        &self.event_type_short_name
    }

    pub fn should_skip(&self) -> bool {
        self.should_skip
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }

    pub(crate) fn set_should_skip(&mut self, should_skip: bool) {
        self.should_skip = should_skip;
    }
}

/// 按实体分组的失败链，同一 `entity_id` 至多一条
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct FailedMessageChain {
    id: i64,
    entity_id: String,
    creation_time: DateTime<Utc>,
    /// 为 true 时分发器才会尝试排空该链
    should_republish: bool,
    /// 两阶段重发的租约标记
    claimed_at: Option<DateTime<Utc>>,
    /// 按失败顺序排列
    #[builder(default)]
    failed_messages: Vec<FailedMessage>,
}

impl FailedMessageChain {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    pub fn should_republish(&self) -> bool {
        self.should_republish
    }

    pub fn claimed_at(&self) -> Option<DateTime<Utc>> {
        self.claimed_at
    }

    pub fn failed_messages(&self) -> &[FailedMessage] {
        &self.failed_messages
    }

    pub fn into_failed_messages(self) -> Vec<FailedMessage> {
        self.failed_messages
    }

    /// 租约仍有效（已认领且未过期）
    pub fn is_claimed(&self, lease_expired_before: DateTime<Utc>) -> bool {
        self.claimed_at
            .is_some_and(|claimed_at| claimed_at > lease_expired_before)
    }

    pub(crate) fn set_should_republish(&mut self, should_republish: bool) {
        self.should_republish = should_republish;
    }

    pub(crate) fn set_claimed_at(&mut self, claimed_at: Option<DateTime<Utc>>) {
        self.claimed_at = claimed_at;
    }

    pub(crate) fn with_failed_messages(mut self, failed_messages: Vec<FailedMessage>) -> Self {
        self.failed_messages = failed_messages;
        self
    }
}

/// 一次认领所读到的链与消息；确认重发时只删除这些消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainClaim {
    pub chain_id: i64,
    pub message_ids: Vec<i64>,
}

impl ChainClaim {
    pub fn of(chain: &FailedMessageChain) -> Self {
        Self {
            chain_id: chain.id,
            message_ids: chain.failed_messages.iter().map(FailedMessage::id).collect(),
        }
    }
}

/// 失败诊断信息：错误消息链与（可选的）调用栈
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureDetails {
    message: String,
    stack_trace: Option<String>,
}

impl FailureDetails {
    pub fn new(message: impl Into<String>, stack_trace: Option<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace,
        }
    }

    /// 外层错误消息在前，依次拼接每一层 `source()`
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let mut parts = vec![err.to_string()];
        let mut source = err.source();
        while let Some(inner) = source {
            parts.push(inner.to_string());
            source = inner.source();
        }

        Self {
            message: parts.join("\n"),
            stack_trace: None,
        }
    }

    /// 与 `from_error` 相同的消息链，并在捕获到 backtrace 时记录调用栈
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let message = err
            .chain()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n");

        let backtrace = err.backtrace();
        let stack_trace = match backtrace.status() {
            std::backtrace::BacktraceStatus::Captured => Some(backtrace.to_string()),
            _ => None,
        };

        Self {
            message,
            stack_trace,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("socket closed")]
    struct SocketClosed;

    #[derive(Debug, Error)]
    #[error("broker unreachable")]
    struct BrokerUnreachable(#[source] SocketClosed);

    #[derive(Debug, Error)]
    #[error("timeout")]
    struct Timeout(#[source] BrokerUnreachable);

    #[test]
    fn message_chain_is_outer_to_inner() {
        let err = Timeout(BrokerUnreachable(SocketClosed));
        let details = FailureDetails::from_error(&err);
        assert_eq!(
            details.message(),
            "timeout\nbroker unreachable\nsocket closed"
        );
        assert_eq!(details.stack_trace(), None);
    }

    #[test]
    fn anyhow_context_is_part_of_the_chain() {
        let err = anyhow::Error::new(SocketClosed).context("publish failed");
        let details = FailureDetails::from_anyhow(&err);
        assert_eq!(details.message(), "publish failed\nsocket closed");
    }

    #[test]
    fn claim_respects_lease() {
        let now = Utc::now();
        let chain = FailedMessageChain::builder()
            .id(1)
            .entity_id("e".into())
            .creation_time(now)
            .should_republish(true)
            .claimed_at(now)
            .build();
        assert!(chain.is_claimed(now - chrono::Duration::seconds(30)));
        assert!(!chain.is_claimed(now + chrono::Duration::seconds(1)));
    }
}
