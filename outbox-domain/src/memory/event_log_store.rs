use super::{InMemoryFailedMessageChainStore, InMemoryStorage, MemoryTransaction, PendingWrite};
use crate::{
    error::{OutboxError, OutboxResult as Result},
    event_log::{EventState, IntegrationEventLogEntry, IntegrationEventLogStore},
    failed_chain::FailedMessageChainStore,
};
use async_trait::async_trait;
use uuid::Uuid;

/// 基于 `InMemoryStorage` 的事件日志仓储，并置一个共享同一存储的失败链仓储
#[derive(Clone)]
pub struct InMemoryEventLogStore {
    storage: InMemoryStorage,
    chains: InMemoryFailedMessageChainStore,
}

impl InMemoryEventLogStore {
    pub fn new(storage: InMemoryStorage) -> Self {
        let chains = InMemoryFailedMessageChainStore::new(storage.clone());
        Self { storage, chains }
    }

    /// 使用自定义配置的失败链仓储（须共享同一 `InMemoryStorage`）
    pub fn with_chain_store(mut self, chains: InMemoryFailedMessageChainStore) -> Self {
        self.chains = chains;
        self
    }

    pub fn chain_store(&self) -> &InMemoryFailedMessageChainStore {
        &self.chains
    }

    /// 已提交的全部信封，按写入顺序
    pub fn entries(&self) -> Result<Vec<IntegrationEventLogEntry>> {
        Ok(self.storage.lock()?.event_logs.clone())
    }
}

#[async_trait]
impl IntegrationEventLogStore for InMemoryEventLogStore {
    type Transaction = MemoryTransaction;

    async fn retrieve_pending_event_logs(
        &self,
        batch_size: usize,
    ) -> Result<Vec<IntegrationEventLogEntry>> {
        let state = self.storage.lock()?;
        let mut pending: Vec<IntegrationEventLogEntry> = state
            .event_logs
            .iter()
            .filter(|e| e.state() == EventState::NotPublished)
            .cloned()
            .collect();
        pending.sort_by_key(|e| (e.creation_time(), e.event_id()));
        pending.truncate(batch_size);
        Ok(pending)
    }

    async fn insert_entry(
        &self,
        tx: &mut Self::Transaction,
        entry: IntegrationEventLogEntry,
    ) -> Result<IntegrationEventLogEntry> {
        tx.push(PendingWrite::InsertEventLog(entry.clone()));
        Ok(entry)
    }

    async fn update_event_state(&self, event_id: Uuid, state: EventState) -> Result<()> {
        let mut guard = self.storage.lock()?;
        let entry = guard
            .event_logs
            .iter_mut()
            .find(|e| e.event_id() == event_id)
            .ok_or_else(|| OutboxError::not_found(format!("event log: event_id={event_id}")))?;

        if !entry.state().can_transition_to(state) {
            return Err(OutboxError::InvalidTransition {
                event_id,
                from: entry.state(),
                to: state,
            });
        }
        entry.apply_state(state);
        Ok(())
    }

    async fn find_event_log(&self, event_id: Uuid) -> Result<Option<IntegrationEventLogEntry>> {
        let state = self.storage.lock()?;
        Ok(state
            .event_logs
            .iter()
            .find(|e| e.event_id() == event_id)
            .cloned())
    }

    fn failed_message_chains(&self) -> &dyn FailedMessageChainStore {
        &self.chains
    }
}
