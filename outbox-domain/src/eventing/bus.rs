//! 事件总线（EventBus）协议与出站消息
//!
//! 分发器将还原后的事件转换为 `OutboundMessage` 发布到总线；
//! 订阅返回 'static 生命周期事件流，便于在 tokio::spawn 中消费。
//!
use crate::{error::OutboxResult as Result, integration_event::DynIntegrationEvent};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// 发布到总线上的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub event_id: Uuid,
    /// 短类型名，与死信链记录的标签一致
    pub event_type: String,
    pub entity_id: Option<String>,
    pub body: String,
}

impl OutboundMessage {
    pub fn from_event(event: &dyn DynIntegrationEvent) -> Result<Self> {
        Ok(Self {
            event_id: event.event_id(),
            event_type: event.event_short_name().to_string(),
            entity_id: event.event_entity_id().map(str::to_string),
            body: event.to_json()?,
        })
    }
}

/// 事件总线：负责分发事件与订阅事件流
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, message: &OutboundMessage) -> Result<()>;

    async fn subscribe(&self) -> BoxStream<'static, Result<OutboundMessage>>;
}

#[async_trait]
impl<T> EventBus for Arc<T>
where
    T: EventBus + ?Sized,
{
    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        (**self).publish(message).await
    }

    async fn subscribe(&self) -> BoxStream<'static, Result<OutboundMessage>> {
        (**self).subscribe().await
    }
}
