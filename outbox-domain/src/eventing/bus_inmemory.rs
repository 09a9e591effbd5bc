//! 进程内出站总线（InMemoryEventBus）
//!
//! 分发器把 `OutboundMessage` 交给总线即视为发布成功；本实现不持久化，
//! 没有订阅者时消息直接丢弃，交付保证完全由事件日志与失败链承担。
//! 订阅方落后超过缓冲区容量时，流中出现一次 `EventBus` 错误，随后从最新消息继续。

use super::{EventBus, OutboundMessage};
use crate::error::{OutboxError, OutboxResult as Result};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

#[derive(Clone)]
pub struct InMemoryEventBus {
    outbound: broadcast::Sender<OutboundMessage>,
}

impl InMemoryEventBus {
    /// `capacity` 为每个订阅方可积压的消息数
    pub fn new(capacity: usize) -> Self {
        let (outbound, _) = broadcast::channel(capacity.max(1));
        Self { outbound }
    }

    pub fn subscriber_count(&self) -> usize {
        self.outbound.receiver_count()
    }
}

/// 目前唯一的接收错误是订阅方落后
fn lagged(err: BroadcastStreamRecvError) -> OutboxError {
    OutboxError::event_bus(format!("outbound subscriber dropped messages: {err}"))
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        match self.outbound.send(message.clone()) {
            Ok(receivers) => tracing::trace!(
                event_id = %message.event_id,
                receivers,
                "outbound message broadcast"
            ),
            Err(_) => tracing::trace!(
                event_id = %message.event_id,
                "no subscribers, outbound message dropped"
            ),
        }
        Ok(())
    }

    async fn subscribe(&self) -> BoxStream<'static, Result<OutboundMessage>> {
        BroadcastStream::new(self.outbound.subscribe())
            .map(|received| received.map_err(lagged))
            .boxed()
    }
}
