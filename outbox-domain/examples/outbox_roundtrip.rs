/// Outbox 闭环示例（内存版）
/// 实体与事件原子写入 -> 分发器投递 -> 投递失败进入失败链 -> 人工开启后重发
use anyhow::Result as AnyResult;
use chrono::Utc;
use outbox_domain::error::{OutboxError, OutboxResult};
use outbox_domain::eventing::{EventBus, InMemoryEventBus, OutboundMessage, OutboxDispatcher};
use outbox_domain::integration_event::EventTypeRegistry;
use outbox_domain::memory::{InMemoryEntityStore, InMemoryEventLogStore, InMemoryStorage};
use outbox_domain::service::IntegrationEventService;
use outbox_macros::{entity, integration_event};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[entity(id = i64)]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Customer {
    email: String,
}

#[integration_event]
struct CustomerRegistered {
    email: String,
}

// 可切换的“故障”总线
struct SwitchableBus {
    inner: InMemoryEventBus,
    down: AtomicBool,
}

#[async_trait::async_trait]
impl EventBus for SwitchableBus {
    async fn publish(&self, message: &OutboundMessage) -> OutboxResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(OutboxError::event_bus("broker unreachable"));
        }
        println!(
            "📨 published {} for entity {:?}",
            message.event_type, message.entity_id
        );
        self.inner.publish(message).await
    }

    async fn subscribe(
        &self,
    ) -> futures_core::stream::BoxStream<'static, OutboxResult<OutboundMessage>> {
        self.inner.subscribe().await
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> AnyResult<()> {
    println!("=== Outbox 闭环示例（内存版） ===\n");

    let storage = InMemoryStorage::new();
    let service = Arc::new(
        IntegrationEventService::builder()
            .storage(Arc::new(storage.clone()))
            .event_log(Arc::new(InMemoryEventLogStore::new(storage.clone())))
            .registry(Arc::new(
                EventTypeRegistry::new().with::<CustomerRegistered>(),
            ))
            .build(),
    );
    let bus = Arc::new(SwitchableBus {
        inner: InMemoryEventBus::new(16),
        down: AtomicBool::new(true),
    });
    let dispatcher = OutboxDispatcher::builder()
        .service(service.clone())
        .event_bus(bus.clone())
        .build();

    let customers = InMemoryEntityStore::<Customer>::new(storage.clone(), "customers")
        .with_id_generator(|c, seq| c.id = seq);
    let cancel = CancellationToken::new();
    for email in ["ada@example.com", "alan@example.com"] {
        let event = CustomerRegistered {
            id: Uuid::now_v7(),
            entity_id: None,
            creation_date: Utc::now(),
            email: email.into(),
        };
        let customer = Customer {
            id: 0,
            email: email.into(),
        };
        let event = service.add(&customers, customer, event, &cancel).await?;
        println!("✅ 写入实体与事件: entity={:?}", event.entity_id);
    }

    let report = dispatcher.dispatch_pending_once().await?;
    println!(
        "\n⚠️  总线不可用: published={}, failed={}",
        report.published, report.failed
    );
    println!(
        "   失败链数量: {}, 失败消息数量: {}",
        storage.chain_count()?,
        storage.failed_message_count()?
    );

    bus.down.store(false, Ordering::SeqCst);
    for entity_id in ["1", "2"] {
        service.set_should_republish(entity_id, true).await?;
    }
    let report = dispatcher.republish_failed_once().await?;
    println!(
        "\n🔁 开启重发后: published={}, failed={}",
        report.published, report.failed
    );
    println!("   剩余失败链: {}", storage.chain_count()?);

    Ok(())
}
