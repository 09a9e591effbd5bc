use crate::{
    entity::{Entity, EntityStore},
    error::{OutboxError, OutboxResult as Result},
    event_log::{IntegrationEventLogEntry, IntegrationEventLogStore},
    failed_chain::{ChainClaim, FailedMessageChain, FailedMessageChainStore, FailureDetails},
    integration_event::{BoxedIntegrationEvent, EventTypeRegistry, IntegrationEvent},
    unit_of_work::{RetryStrategy, TransactionalStorage, UnitOfWork},
};
use bon::Builder;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 一条被认领的失败链及其还原后的事件（已剔除 `should_skip` 消息），按失败顺序排列
#[derive(Debug)]
pub struct RepublishChain {
    pub chain_id: i64,
    pub entity_id: String,
    pub events: Vec<BoxedIntegrationEvent>,
    /// 认领时读到的全部消息（含被跳过的），确认时只删除这些
    pub message_ids: Vec<i64>,
}

impl RepublishChain {
    pub fn claim(&self) -> ChainClaim {
        ChainClaim {
            chain_id: self.chain_id,
            message_ids: self.message_ids.clone(),
        }
    }
}

/// 待投递信封与其还原结果；还原失败不影响同批其他信封
#[derive(Debug)]
pub struct PendingEvent {
    pub entry: IntegrationEventLogEntry,
    pub event: Result<BoxedIntegrationEvent>,
}

#[derive(Debug, Clone, Copy)]
enum EntityOperation {
    Insert,
    Update,
    Delete,
}

impl EntityOperation {
    fn as_str(&self) -> &'static str {
        match self {
            EntityOperation::Insert => "insert",
            EntityOperation::Update => "update",
            EntityOperation::Delete => "delete",
        }
    }
}

/// 集成事件服务：
/// - `add/update/remove` 在同一事务内写入实体与事件信封，瞬时故障时整体重放；
/// - 读取待投递事件并按类型注册表还原载荷；
/// - 以认领 → 还原 → 确认/释放的两阶段流程消费死信链。
#[derive(Builder)]
pub struct IntegrationEventService<S, L>
where
    S: TransactionalStorage,
    L: IntegrationEventLogStore<Transaction = S::Transaction>,
{
    storage: Arc<S>,
    event_log: Arc<L>,
    registry: Arc<EventTypeRegistry>,
    #[builder(default)]
    retry_strategy: RetryStrategy,
    /// 认领的租约时长，超过后其他消费者可再次认领
    #[builder(default = Duration::from_secs(60))]
    claim_lease: Duration,
}

impl<S, L> IntegrationEventService<S, L>
where
    S: TransactionalStorage,
    L: IntegrationEventLogStore<Transaction = S::Transaction>,
{
    pub fn event_log(&self) -> &Arc<L> {
        &self.event_log
    }

    pub fn registry(&self) -> &EventTypeRegistry {
        &self.registry
    }

    pub fn retry_strategy(&self) -> &RetryStrategy {
        &self.retry_strategy
    }

    pub fn claim_lease(&self) -> Duration {
        self.claim_lease
    }

    pub fn failed_message_chains(&self) -> &dyn FailedMessageChainStore {
        self.event_log.failed_message_chains()
    }

    /// 插入实体并记录事件；返回已回填 `entity_id` 的事件
    pub async fn add<E, Ev, R>(
        &self,
        repo: &R,
        entity: E,
        event: Ev,
        cancel: &CancellationToken,
    ) -> Result<Ev>
    where
        E: Entity + Clone + 'static,
        Ev: IntegrationEvent,
        R: EntityStore<E, Transaction = S::Transaction> + ?Sized,
    {
        self.persist_with_event(EntityOperation::Insert, repo, entity, event, cancel)
            .await
    }

    /// 更新实体并记录事件
    pub async fn update<E, Ev, R>(
        &self,
        repo: &R,
        entity: E,
        event: Ev,
        cancel: &CancellationToken,
    ) -> Result<Ev>
    where
        E: Entity + Clone + 'static,
        Ev: IntegrationEvent,
        R: EntityStore<E, Transaction = S::Transaction> + ?Sized,
    {
        self.persist_with_event(EntityOperation::Update, repo, entity, event, cancel)
            .await
    }

    /// 删除实体并记录事件
    pub async fn remove<E, Ev, R>(
        &self,
        repo: &R,
        entity: E,
        event: Ev,
        cancel: &CancellationToken,
    ) -> Result<Ev>
    where
        E: Entity + Clone + 'static,
        Ev: IntegrationEvent,
        R: EntityStore<E, Transaction = S::Transaction> + ?Sized,
    {
        self.persist_with_event(EntityOperation::Delete, repo, entity, event, cancel)
            .await
    }

    async fn persist_with_event<E, Ev, R>(
        &self,
        operation: EntityOperation,
        repo: &R,
        entity: E,
        event: Ev,
        cancel: &CancellationToken,
    ) -> Result<Ev>
    where
        E: Entity + Clone + 'static,
        Ev: IntegrationEvent,
        R: EntityStore<E, Transaction = S::Transaction> + ?Sized,
    {
        let uow = UnitOfWork::new(self.storage.clone(), self.retry_strategy);

        uow.execute_with_retry_strategy(|| {
            let uow = &uow;
            let entity = entity.clone();
            let event = event.clone();
            async move {
                let written = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(OutboxError::Cancelled),
                    result = async {
                        uow.begin_transaction().await?;
                        self.write_in_transaction(uow, operation, repo, entity, event).await
                    } => result,
                };

                match written {
                    Ok(event) => {
                        uow.commit_transaction().await?;
                        tracing::debug!(
                            operation = operation.as_str(),
                            event_id = %event.id(),
                            event_type = Ev::TYPE_NAME,
                            "entity and event committed"
                        );
                        Ok(event)
                    }
                    Err(err) => {
                        if let Err(rollback_err) = uow.rollback_transaction().await {
                            tracing::warn!(error = %rollback_err, "rollback failed");
                        }
                        Err(err)
                    }
                }
            }
        })
        .await
    }

    async fn write_in_transaction<E, Ev, R>(
        &self,
        uow: &UnitOfWork<S>,
        operation: EntityOperation,
        repo: &R,
        entity: E,
        mut event: Ev,
    ) -> Result<Ev>
    where
        E: Entity + Clone + 'static,
        Ev: IntegrationEvent,
        R: EntityStore<E, Transaction = S::Transaction> + ?Sized,
    {
        let mut tx = uow.transaction().await?;
        let entity = match operation {
            EntityOperation::Insert => repo.insert(&mut *tx, entity).await?,
            EntityOperation::Update => repo.update(&mut *tx, entity).await?,
            EntityOperation::Delete => repo.delete(&mut *tx, entity).await?,
        };

        // 实体标识可能由存储生成，须在写入后回填
        event.set_entity_id(entity.id().to_string());
        self.event_log.save_event(&mut *tx, &event).await?;
        Ok(event)
    }

    /// 待投递事件（创建时间升序），按类型注册表还原
    pub async fn get_pending_events(&self, batch_size: usize) -> Result<Vec<BoxedIntegrationEvent>> {
        let entries = self
            .event_log
            .retrieve_pending_event_logs(batch_size)
            .await?;
        entries.iter().map(|entry| self.decode_entry(entry)).collect()
    }

    /// 与 `get_pending_events` 相同的批次，但逐条给出还原结果
    pub async fn get_pending_entries(&self, batch_size: usize) -> Result<Vec<PendingEvent>> {
        let entries = self
            .event_log
            .retrieve_pending_event_logs(batch_size)
            .await?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let event = self.decode_entry(&entry);
                PendingEvent { entry, event }
            })
            .collect())
    }

    fn decode_entry(&self, entry: &IntegrationEventLogEntry) -> Result<BoxedIntegrationEvent> {
        self.registry
            .decode(entry.event_type_short_name(), entry.content())
    }

    fn decode_chain(&self, chain: &FailedMessageChain) -> Result<Vec<BoxedIntegrationEvent>> {
        let mut events = Vec::with_capacity(chain.failed_messages().len());
        for message in chain.failed_messages() {
            if message.should_skip() {
                tracing::info!(
                    chain_id = chain.id(),
                    entity_id = chain.entity_id(),
                    message_id = message.id(),
                    event_type = message.event_type_short_name(),
                    "skipping failed message marked should_skip"
                );
                continue;
            }
            events.push(
                self.registry
                    .decode(message.event_type_short_name(), message.body())?,
            );
        }
        Ok(events)
    }

    /// 认领待重发的链并还原事件；还原失败时释放本批全部认领后返回错误
    pub async fn claim_failed_events_to_republish(
        &self,
        chain_batch_size: usize,
    ) -> Result<Vec<RepublishChain>> {
        let chains = self
            .failed_message_chains()
            .claim_chains_to_republish(chain_batch_size, self.claim_lease)
            .await?;

        let mut claimed = Vec::with_capacity(chains.len());
        for chain in &chains {
            match self.decode_chain(chain) {
                Ok(events) => claimed.push(RepublishChain {
                    chain_id: chain.id(),
                    entity_id: chain.entity_id().to_string(),
                    events,
                    message_ids: ChainClaim::of(chain).message_ids,
                }),
                Err(err) => {
                    tracing::error!(
                        chain_id = chain.id(),
                        entity_id = chain.entity_id(),
                        error = %err,
                        "failed to decode failed message chain, releasing claimed chains"
                    );
                    for chain in &chains {
                        if let Err(release_err) = self.release_republish(chain.id()).await {
                            tracing::warn!(chain_id = chain.id(), error = %release_err, "release failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(claimed)
    }

    /// 确认重发成功：删除认领时读到的消息；认领期间新追加的消息留在链上等待下一轮
    pub async fn complete_republish(&self, chain: &RepublishChain) -> Result<()> {
        self.failed_message_chains()
            .complete_republish(&[chain.claim()])
            .await
    }

    /// 重发未成功：释放认领，链等待重新开启 `should_republish`
    pub async fn release_republish(&self, chain_id: i64) -> Result<()> {
        self.failed_message_chains().release_chain(chain_id).await
    }

    /// 读取并消费至多 `chain_batch_size` 条链，按链、再按消息顺序展开
    pub async fn retrieve_failed_events_to_republish(
        &self,
        chain_batch_size: usize,
    ) -> Result<Vec<BoxedIntegrationEvent>> {
        let chains = self
            .claim_failed_events_to_republish(chain_batch_size)
            .await?;

        if chains.is_empty() {
            return Ok(Vec::new());
        }

        // 整批一次确认；失败时释放认领，消息原样保留
        let claims: Vec<ChainClaim> = chains.iter().map(RepublishChain::claim).collect();
        if let Err(err) = self
            .failed_message_chains()
            .complete_republish(&claims)
            .await
        {
            tracing::error!(error = %err, "failed to consume claimed chains, releasing them");
            for chain in &chains {
                if let Err(release_err) = self.release_republish(chain.chain_id).await {
                    tracing::warn!(chain_id = chain.chain_id, error = %release_err, "release failed");
                }
            }
            return Err(err);
        }
        Ok(chains.into_iter().flat_map(|chain| chain.events).collect())
    }

    pub async fn mark_event_as_in_progress(&self, event_id: Uuid) -> Result<()> {
        self.event_log.mark_event_as_in_progress(event_id).await
    }

    pub async fn mark_event_as_published(&self, event_id: Uuid) -> Result<()> {
        self.event_log.mark_event_as_published(event_id).await
    }

    pub async fn mark_event_as_failed(&self, event_id: Uuid) -> Result<()> {
        self.event_log.mark_event_as_failed(event_id).await
    }

    pub async fn failed_message_chain_exists(&self, entity_id: Option<&str>) -> Result<bool> {
        self.event_log.failed_message_chain_exists(entity_id).await
    }

    pub async fn add_in_failed_message_chain(
        &self,
        entity_id: Option<&str>,
        event_type_short_name: &str,
        body: &str,
        failure: Option<&FailureDetails>,
    ) -> Result<()> {
        self.event_log
            .add_in_failed_message_chain(entity_id, event_type_short_name, body, failure)
            .await
    }

    /// 人工开启/关闭某实体失败链的重发
    pub async fn set_should_republish(&self, entity_id: &str, should_republish: bool) -> Result<()> {
        self.failed_message_chains()
            .set_should_republish(entity_id, should_republish)
            .await
    }

    pub async fn set_should_skip(&self, message_id: i64, should_skip: bool) -> Result<()> {
        self.failed_message_chains()
            .set_should_skip(message_id, should_skip)
            .await
    }
}
