//! 事件日志仓储协议（IntegrationEventLogStore）
//!
//! - 信封写入发生在调用方的环境事务内，与实体写入原子提交；
//! - 状态流转为单行、独立提交的小事务，不参与业务事务；
//! - 死信相关操作委托给失败链仓储，仅为接口便利而并置于此。
//!
use super::{EventState, IntegrationEventLogEntry};
use crate::{
    error::OutboxResult as Result,
    failed_chain::{FailedMessageChainStore, FailureDetails},
    integration_event::IntegrationEvent,
};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait IntegrationEventLogStore: Send + Sync {
    /// 存储后端的事务类型，与 `TransactionalStorage::Transaction` 一致
    type Transaction: Send;

    /// 状态为 NotPublished 的信封，按创建时间升序，至多 `batch_size` 条；只读
    async fn retrieve_pending_event_logs(
        &self,
        batch_size: usize,
    ) -> Result<Vec<IntegrationEventLogEntry>>;

    /// 在给定事务内插入信封
    async fn insert_entry(
        &self,
        tx: &mut Self::Transaction,
        entry: IntegrationEventLogEntry,
    ) -> Result<IntegrationEventLogEntry>;

    /// 单行状态流转；未知 `event_id` 返回 NotFound，非法流转返回 InvalidTransition
    async fn update_event_state(&self, event_id: Uuid, state: EventState) -> Result<()>;

    async fn find_event_log(&self, event_id: Uuid) -> Result<Option<IntegrationEventLogEntry>>;

    /// 并置的失败链仓储
    fn failed_message_chains(&self) -> &dyn FailedMessageChainStore;

    /// 由事件构造信封并在调用方事务内持久化
    async fn save_event<E: IntegrationEvent>(
        &self,
        tx: &mut Self::Transaction,
        event: &E,
    ) -> Result<IntegrationEventLogEntry> {
        let entry = IntegrationEventLogEntry::from_event(event)?;
        self.insert_entry(tx, entry).await
    }

    async fn mark_event_as_in_progress(&self, event_id: Uuid) -> Result<()> {
        self.update_event_state(event_id, EventState::InProgress)
            .await
    }

    async fn mark_event_as_published(&self, event_id: Uuid) -> Result<()> {
        self.update_event_state(event_id, EventState::Published).await
    }

    async fn mark_event_as_failed(&self, event_id: Uuid) -> Result<()> {
        self.update_event_state(event_id, EventState::PublishedFailed)
            .await
    }

    async fn failed_message_chain_exists(&self, entity_id: Option<&str>) -> Result<bool> {
        self.failed_message_chains().exists(entity_id).await
    }

    async fn add_in_failed_message_chain(
        &self,
        entity_id: Option<&str>,
        event_type_short_name: &str,
        body: &str,
        failure: Option<&FailureDetails>,
    ) -> Result<()> {
        self.failed_message_chains()
            .append(entity_id, event_type_short_name, body, failure)
            .await
    }
}

#[async_trait]
impl<T> IntegrationEventLogStore for Arc<T>
where
    T: IntegrationEventLogStore + ?Sized,
{
    type Transaction = T::Transaction;

    async fn retrieve_pending_event_logs(
        &self,
        batch_size: usize,
    ) -> Result<Vec<IntegrationEventLogEntry>> {
        (**self).retrieve_pending_event_logs(batch_size).await
    }

    async fn insert_entry(
        &self,
        tx: &mut Self::Transaction,
        entry: IntegrationEventLogEntry,
    ) -> Result<IntegrationEventLogEntry> {
        (**self).insert_entry(tx, entry).await
    }

    async fn update_event_state(&self, event_id: Uuid, state: EventState) -> Result<()> {
        (**self).update_event_state(event_id, state).await
    }

    async fn find_event_log(&self, event_id: Uuid) -> Result<Option<IntegrationEventLogEntry>> {
        (**self).find_event_log(event_id).await
    }

    fn failed_message_chains(&self) -> &dyn FailedMessageChainStore {
        (**self).failed_message_chains()
    }
}
