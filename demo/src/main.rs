use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::Utc;
use config::{Config, Environment, File};
use futures_core::stream::BoxStream;
use outbox_domain::config::OutboxConfig;
use outbox_domain::error::{OutboxError, OutboxResult};
use outbox_domain::eventing::{EventBus, InMemoryEventBus, OutboundMessage, OutboxDispatcher};
use outbox_domain::integration_event::EventTypeRegistry;
use outbox_domain::memory::{
    InMemoryEntityStore, InMemoryEventLogStore, InMemoryFailedMessageChainStore, InMemoryStorage,
};
use outbox_domain::service::IntegrationEventService;
use outbox_macros::{entity, integration_event};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[entity(id = i64)]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    customer: String,
    total_cents: u64,
}

#[integration_event]
struct OrderPlaced {
    customer: String,
    total_cents: u64,
}

#[integration_event]
struct OrderCancelled {
    reason: String,
}

/// 可模拟中断的消息代理
struct Broker {
    bus: InMemoryEventBus,
    offline: AtomicBool,
}

#[async_trait]
impl EventBus for Broker {
    async fn publish(&self, message: &OutboundMessage) -> OutboxResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(OutboxError::event_bus("broker offline"));
        }
        tracing::info!(
            event_id = %message.event_id,
            event_type = %message.event_type,
            entity_id = ?message.entity_id,
            "broker accepted message"
        );
        self.bus.publish(message).await
    }

    async fn subscribe(&self) -> BoxStream<'static, OutboxResult<OutboundMessage>> {
        self.bus.subscribe().await
    }
}

fn load_config() -> AnyResult<OutboxConfig> {
    let settings = Config::builder()
        // config/outbox.toml
        .add_source(File::with_name("config/outbox").required(false))
        // OUTBOX__DISPATCHER__CHAIN_BATCH_SIZE=20
        .add_source(
            Environment::with_prefix("OUTBOX")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(settings.try_deserialize()?)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = load_config()?;
    tracing::info!(?config, "outbox demo starting");

    let storage = InMemoryStorage::new();
    let chains = InMemoryFailedMessageChainStore::new(storage.clone())
        .with_default_should_republish(config.default_should_republish);
    let event_log = InMemoryEventLogStore::new(storage.clone()).with_chain_store(chains);
    let registry = EventTypeRegistry::new()
        .with::<OrderPlaced>()
        .with::<OrderCancelled>();

    let service = Arc::new(
        IntegrationEventService::builder()
            .storage(Arc::new(storage.clone()))
            .event_log(Arc::new(event_log))
            .registry(Arc::new(registry))
            .retry_strategy(config.retry)
            .claim_lease(config.claim_lease())
            .build(),
    );
    let broker = Arc::new(Broker {
        bus: InMemoryEventBus::new(64),
        offline: AtomicBool::new(true),
    });
    let dispatcher = Arc::new(
        OutboxDispatcher::builder()
            .service(service.clone())
            .event_bus(broker.clone())
            .config(config.dispatcher)
            .build(),
    );
    let handle = dispatcher.start();

    let orders = InMemoryEntityStore::<Order>::new(storage.clone(), "orders")
        .with_id_generator(|order, seq| order.id = seq);
    let cancel = CancellationToken::new();

    // 代理离线期间写入的订单事件会进入失败链
    let mut placed = Vec::new();
    for (customer, total_cents) in [("ada", 1_250), ("grace", 4_990)] {
        let order = Order {
            id: 0,
            customer: customer.into(),
            total_cents,
        };
        let event = OrderPlaced {
            id: Uuid::now_v7(),
            entity_id: None,
            creation_date: Utc::now(),
            customer: customer.into(),
            total_cents,
        };
        let event = service.add(&orders, order, event, &cancel).await?;
        tracing::info!(event_id = %event.id, entity_id = ?event.entity_id, "order placed");
        placed.push(event);
    }

    tokio::time::sleep(config.dispatcher.deliver_interval() * 3).await;
    tracing::info!(
        chains = storage.chain_count()?,
        messages = storage.failed_message_count()?,
        "broker outage recorded in failed message chains"
    );

    broker.offline.store(false, Ordering::SeqCst);

    // 代理恢复后的新订单直接投递，随后取消
    let order = Order {
        id: 0,
        customer: "linus".into(),
        total_cents: 990,
    };
    let event = OrderPlaced {
        id: Uuid::now_v7(),
        entity_id: None,
        creation_date: Utc::now(),
        customer: order.customer.clone(),
        total_cents: order.total_cents,
    };
    let event = service.add(&orders, order, event, &cancel).await?;
    let order_id = event.entity_id.as_deref().and_then(|id| id.parse::<i64>().ok());
    if let Some(order) = order_id.map(|id| orders.find(&id)).transpose()?.flatten() {
        let event = OrderCancelled {
            id: Uuid::now_v7(),
            entity_id: None,
            creation_date: Utc::now(),
            reason: "customer request".into(),
        };
        service.remove(&orders, order, event, &cancel).await?;
    }

    // 运维确认后开启重发
    for event in &placed {
        if let Some(entity_id) = event.entity_id.as_deref() {
            service.set_should_republish(entity_id, true).await?;
        }
    }

    tokio::time::sleep(config.dispatcher.republish_interval() * 3).await;
    tracing::info!(
        chains = storage.chain_count()?,
        messages = storage.failed_message_count()?,
        "failed message chains after republish"
    );

    handle.shutdown();
    handle.join().await;
    tracing::info!("outbox demo finished");
    Ok(())
}
