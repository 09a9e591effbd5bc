use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::Utc;
use outbox_domain::error::{OutboxError, OutboxResult};
use outbox_domain::event_log::{EventState, IntegrationEventLogEntry, IntegrationEventLogStore};
use outbox_domain::failed_chain::FailedMessageChainStore;
use outbox_domain::integration_event::{DynIntegrationEvent, EventTypeRegistry};
use outbox_domain::memory::{
    InMemoryEntityStore, InMemoryEventLogStore, InMemoryStorage, MemoryTransaction,
};
use outbox_domain::service::IntegrationEventService;
use outbox_domain::unit_of_work::{RetryStrategy, TransactionalStorage};
use outbox_macros::{entity, integration_event};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[entity(id = i64)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Product {
    name: String,
    price: u64,
}

#[integration_event]
#[derive(PartialEq)]
struct ProductPriceChanged {
    new_price: u64,
}

#[integration_event]
struct ProductRemoved {}

fn product(name: &str, price: u64) -> Product {
    Product {
        id: 0,
        name: name.into(),
        price,
    }
}

fn price_changed(new_price: u64) -> ProductPriceChanged {
    ProductPriceChanged {
        id: Uuid::now_v7(),
        entity_id: None,
        creation_date: Utc::now(),
        new_price,
    }
}

fn registry() -> Arc<EventTypeRegistry> {
    Arc::new(
        EventTypeRegistry::new()
            .with::<ProductPriceChanged>()
            .with::<ProductRemoved>(),
    )
}

fn products(storage: &InMemoryStorage) -> InMemoryEntityStore<Product> {
    InMemoryEntityStore::new(storage.clone(), "products").with_id_generator(|p, seq| p.id = seq)
}

struct Fixture {
    storage: InMemoryStorage,
    event_log: Arc<InMemoryEventLogStore>,
    service: IntegrationEventService<InMemoryStorage, InMemoryEventLogStore>,
}

fn fixture() -> Fixture {
    let storage = InMemoryStorage::new();
    let event_log = Arc::new(InMemoryEventLogStore::new(storage.clone()));
    let service = IntegrationEventService::builder()
        .storage(Arc::new(storage.clone()))
        .event_log(event_log.clone())
        .registry(registry())
        .retry_strategy(RetryStrategy::none())
        .build();
    Fixture {
        storage,
        event_log,
        service,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn add_commits_entity_and_event_together() -> AnyResult<()> {
    let fx = fixture();
    let repo = products(&fx.storage);
    let cancel = CancellationToken::new();

    let event = fx
        .service
        .add(&repo, product("lamp", 10), price_changed(10), &cancel)
        .await?;

    // 事件的 entity_id 来自写入后的实体标识
    assert_eq!(event.entity_id.as_deref(), Some("1"));
    assert_eq!(repo.find(&1)?.map(|p| p.name), Some("lamp".to_string()));

    let entry = fx.event_log.find_event_log(event.id).await?.unwrap();
    assert_eq!(entry.state(), EventState::NotPublished);
    assert_eq!(entry.times_sent(), 0);
    assert_eq!(entry.entity_id(), "1");
    assert_eq!(entry.event_type_short_name(), "ProductPriceChanged");
    assert_eq!(entry.creation_time(), event.creation_date);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_scenario_moves_event_to_published() -> AnyResult<()> {
    let fx = fixture();
    let repo = products(&fx.storage);
    let cancel = CancellationToken::new();

    let event = fx
        .service
        .add(&repo, product("desk", 100), price_changed(100), &cancel)
        .await?;

    let pending = fx.service.get_pending_events(10).await?;
    assert_eq!(pending.len(), 1);
    let restored = pending[0].downcast_ref::<ProductPriceChanged>().unwrap();
    assert_eq!(restored, &event);

    fx.service.mark_event_as_in_progress(event.id).await?;
    fx.service.mark_event_as_published(event.id).await?;

    assert!(fx.service.get_pending_events(10).await?.is_empty());
    let entry = fx.event_log.find_event_log(event.id).await?.unwrap();
    assert_eq!(entry.state(), EventState::Published);
    assert_eq!(entry.times_sent(), 1);

    let err = fx.service.mark_event_as_failed(event.id).await.unwrap_err();
    assert!(matches!(err, OutboxError::InvalidTransition { .. }));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn update_and_remove_record_events_for_existing_entity() -> AnyResult<()> {
    let fx = fixture();
    let repo = products(&fx.storage);
    let cancel = CancellationToken::new();

    let event = fx
        .service
        .add(&repo, product("chair", 5), price_changed(5), &cancel)
        .await?;
    let mut stored = repo.find(&1)?.unwrap();
    stored.price = 7;
    fx.service
        .update(&repo, stored.clone(), price_changed(7), &cancel)
        .await?;
    let removed = ProductRemoved {
        id: Uuid::now_v7(),
        entity_id: None,
        creation_date: Utc::now(),
    };
    let removed = fx.service.remove(&repo, stored, removed, &cancel).await?;

    assert_eq!(repo.count()?, 0);
    assert_eq!(removed.entity_id.as_deref(), Some("1"));

    let pending = fx.service.get_pending_events(10).await?;
    let kinds: Vec<_> = pending.iter().map(|e| e.event_short_name()).collect();
    assert_eq!(
        kinds,
        ["ProductPriceChanged", "ProductPriceChanged", "ProductRemoved"]
    );
    assert_eq!(pending[0].event_id(), event.id);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_entity_write_leaves_no_event() -> AnyResult<()> {
    let fx = fixture();
    let repo = products(&fx.storage);
    let cancel = CancellationToken::new();

    let mut missing = product("ghost", 1);
    missing.id = 404;
    let err = fx
        .service
        .update(&repo, missing, price_changed(1), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::NotFound { .. }));
    assert_eq!(fx.storage.event_log_count()?, 0);
    Ok(())
}

/// 插入信封时强制失败，模拟实体已写入、事件写入失败的事务中途故障
#[derive(Clone)]
struct FailingEventLog {
    inner: InMemoryEventLogStore,
}

#[async_trait]
impl IntegrationEventLogStore for FailingEventLog {
    type Transaction = MemoryTransaction;

    async fn retrieve_pending_event_logs(
        &self,
        batch_size: usize,
    ) -> OutboxResult<Vec<IntegrationEventLogEntry>> {
        self.inner.retrieve_pending_event_logs(batch_size).await
    }

    async fn insert_entry(
        &self,
        _tx: &mut Self::Transaction,
        _entry: IntegrationEventLogEntry,
    ) -> OutboxResult<IntegrationEventLogEntry> {
        Err(OutboxError::storage("disk full"))
    }

    async fn update_event_state(&self, event_id: Uuid, state: EventState) -> OutboxResult<()> {
        self.inner.update_event_state(event_id, state).await
    }

    async fn find_event_log(
        &self,
        event_id: Uuid,
    ) -> OutboxResult<Option<IntegrationEventLogEntry>> {
        self.inner.find_event_log(event_id).await
    }

    fn failed_message_chains(&self) -> &dyn FailedMessageChainStore {
        self.inner.failed_message_chains()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn mid_transaction_failure_rolls_back_entity_write() -> AnyResult<()> {
    let storage = InMemoryStorage::new();
    let service = IntegrationEventService::builder()
        .storage(Arc::new(storage.clone()))
        .event_log(Arc::new(FailingEventLog {
            inner: InMemoryEventLogStore::new(storage.clone()),
        }))
        .registry(registry())
        .retry_strategy(RetryStrategy::none())
        .build();
    let repo = products(&storage);

    let err = service
        .add(&repo, product("lamp", 1), price_changed(1), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::Storage { .. }));
    assert_eq!(repo.count()?, 0);
    assert_eq!(storage.event_log_count()?, 0);
    Ok(())
}

/// 前 N 次提交以瞬时故障失败的存储
struct FlakyCommitStorage {
    inner: InMemoryStorage,
    failures_left: AtomicU32,
    commits: AtomicU32,
}

#[async_trait]
impl TransactionalStorage for FlakyCommitStorage {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> OutboxResult<Self::Transaction> {
        self.inner.begin().await
    }

    async fn commit(&self, tx: Self::Transaction) -> OutboxResult<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            self.inner.rollback(tx).await?;
            return Err(OutboxError::transient("could not serialize access"));
        }
        self.inner.commit(tx).await
    }

    async fn rollback(&self, tx: Self::Transaction) -> OutboxResult<()> {
        self.inner.rollback(tx).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_commit_failure_is_retried_once_applied() -> AnyResult<()> {
    let storage = InMemoryStorage::new();
    let flaky = Arc::new(FlakyCommitStorage {
        inner: storage.clone(),
        failures_left: AtomicU32::new(2),
        commits: AtomicU32::new(0),
    });
    let service = IntegrationEventService::builder()
        .storage(flaky.clone())
        .event_log(Arc::new(InMemoryEventLogStore::new(storage.clone())))
        .registry(registry())
        .retry_strategy(RetryStrategy {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        })
        .build();
    let repo = products(&storage);

    service
        .add(&repo, product("lamp", 1), price_changed(1), &CancellationToken::new())
        .await?;

    assert_eq!(flaky.commits.load(Ordering::SeqCst), 3);
    assert_eq!(repo.count()?, 1);
    assert_eq!(storage.event_log_count()?, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_beyond_budget_surface() -> AnyResult<()> {
    let storage = InMemoryStorage::new();
    let flaky = Arc::new(FlakyCommitStorage {
        inner: storage.clone(),
        failures_left: AtomicU32::new(10),
        commits: AtomicU32::new(0),
    });
    let service = IntegrationEventService::builder()
        .storage(flaky.clone())
        .event_log(Arc::new(InMemoryEventLogStore::new(storage.clone())))
        .registry(registry())
        .retry_strategy(RetryStrategy {
            max_retries: 1,
            base_delay_ms: 1,
            max_delay_ms: 1,
        })
        .build();
    let repo = products(&storage);

    let err = service
        .add(&repo, product("lamp", 1), price_changed(1), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(flaky.commits.load(Ordering::SeqCst), 2);
    assert_eq!(storage.event_log_count()?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_write_rolls_back() -> AnyResult<()> {
    let fx = fixture();
    let repo = products(&fx.storage);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = fx
        .service
        .add(&repo, product("lamp", 1), price_changed(1), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::Cancelled));
    assert_eq!(repo.count()?, 0);
    assert_eq!(fx.storage.event_log_count()?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_events_are_capped_ordered_and_unique() -> AnyResult<()> {
    let fx = fixture();
    let repo = products(&fx.storage);
    let cancel = CancellationToken::new();

    let mut ids = Vec::new();
    for price in 1..=5 {
        let mut event = price_changed(price);
        event.creation_date = Utc::now() + chrono::Duration::seconds(10 - price as i64);
        ids.push(
            fx.service
                .add(&repo, product("item", price), event, &cancel)
                .await?
                .id,
        );
    }

    let pending = fx.service.get_pending_events(3).await?;
    let pending_ids: Vec<_> = pending.iter().map(|e| e.event_id()).collect();
    // 创建时间倒序写入，读取按创建时间升序
    assert_eq!(pending_ids, [ids[4], ids[3], ids[2]]);

    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 5);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unregistered_event_type_is_a_resolution_error() -> AnyResult<()> {
    let storage = InMemoryStorage::new();
    let event_log = Arc::new(InMemoryEventLogStore::new(storage.clone()));
    let full = IntegrationEventService::builder()
        .storage(Arc::new(storage.clone()))
        .event_log(event_log.clone())
        .registry(registry())
        .build();
    let partial = IntegrationEventService::builder()
        .storage(Arc::new(storage.clone()))
        .event_log(event_log)
        .registry(Arc::new(EventTypeRegistry::new().with::<ProductRemoved>()))
        .build();

    let repo = products(&storage);
    full.add(&repo, product("lamp", 1), price_changed(1), &CancellationToken::new())
        .await?;

    let err = partial.get_pending_events(10).await.unwrap_err();
    assert!(matches!(err, OutboxError::TypeResolution { matches: 0, .. }));
    Ok(())
}
