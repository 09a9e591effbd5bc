//! 内存存储后端（InMemoryStorage）
//!
//! 满足 outbox 对存储引擎的全部约定，用于测试、示例与本地开发：
//! - 事务：写入先缓存在 `MemoryTransaction`，提交时整体校验并原子应用，回滚即丢弃；
//! - 写冲突：先提交者胜出，事务开始后已被他人提交改动的实体行在提交时报
//!   `TransientStorage`，由工作单元的重试策略整体重放；
//! - 失败链 `entity_id` 唯一、删除链时先删消息再删链；
//! - 单行状态流转与死信追加在存储锁内独立提交。
//!
//! 注意：实体主键冲突、更新/删除不存在的行在提交时以 `CommitFailed` 报告。
//! 读取看到的是最新已提交状态而非事务开始时的快照。

mod chain_store;
mod entity_store;
mod event_log_store;

pub use chain_store::InMemoryFailedMessageChainStore;
pub use entity_store::InMemoryEntityStore;
pub use event_log_store::InMemoryEventLogStore;

use crate::{
    error::{OutboxError, OutboxResult as Result},
    event_log::IntegrationEventLogEntry,
    failed_chain::{FailedMessage, FailedMessageChain},
    unit_of_work::TransactionalStorage,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryState {
    pub(crate) event_logs: Vec<IntegrationEventLogEntry>,
    pub(crate) chains: BTreeMap<i64, FailedMessageChain>,
    pub(crate) chain_by_entity: HashMap<String, i64>,
    /// 失败消息按主键有序，主键即追加顺序
    pub(crate) messages: BTreeMap<i64, FailedMessage>,
    pub(crate) next_chain_id: i64,
    pub(crate) next_message_id: i64,
    pub(crate) entities: HashMap<String, BTreeMap<String, Value>>,
    /// 每次事务提交递增
    commit_seq: u64,
    /// (表, 主键) -> 最后一次改动该行的提交序号
    row_versions: HashMap<(String, String), u64>,
}

impl MemoryState {
    pub(crate) fn entity_exists(&self, table: &str, key: &str) -> bool {
        self.entities
            .get(table)
            .is_some_and(|rows| rows.contains_key(key))
    }

    /// 事务开始后已被其他提交改动的实体行
    fn conflicting_row<'a>(
        &self,
        writes: &'a [PendingWrite],
        snapshot: u64,
    ) -> Option<&'a PendingWrite> {
        writes.iter().find(|write| {
            write.entity_row().is_some_and(|(table, key)| {
                self.row_versions
                    .get(&(table.to_string(), key.to_string()))
                    .is_some_and(|version| *version > snapshot)
            })
        })
    }

    fn apply(&mut self, write: PendingWrite) -> Result<()> {
        match write {
            PendingWrite::InsertEntity { table, key, row } => {
                let rows = self.entities.entry(table.clone()).or_default();
                if rows.contains_key(&key) {
                    return Err(commit_failed(format!(
                        "duplicate key: table={table}, key={key}"
                    )));
                }
                rows.insert(key, row);
            }
            PendingWrite::UpdateEntity { table, key, row } => {
                match self.entities.get_mut(&table).and_then(|rows| rows.get_mut(&key)) {
                    Some(existing) => *existing = row,
                    None => {
                        return Err(commit_failed(format!(
                            "row not found: table={table}, key={key}"
                        )));
                    }
                }
            }
            PendingWrite::DeleteEntity { table, key } => {
                let removed = self
                    .entities
                    .get_mut(&table)
                    .and_then(|rows| rows.remove(&key));
                if removed.is_none() {
                    return Err(commit_failed(format!(
                        "row not found: table={table}, key={key}"
                    )));
                }
            }
            PendingWrite::InsertEventLog(entry) => {
                if self
                    .event_logs
                    .iter()
                    .any(|e| e.event_id() == entry.event_id())
                {
                    return Err(commit_failed(format!(
                        "duplicate event id: {}",
                        entry.event_id()
                    )));
                }
                self.event_logs.push(entry);
            }
        }
        Ok(())
    }
}

fn commit_failed(reason: String) -> OutboxError {
    OutboxError::CommitFailed { reason }
}

#[derive(Debug, Clone)]
pub(crate) enum PendingWrite {
    InsertEntity {
        table: String,
        key: String,
        row: Value,
    },
    UpdateEntity {
        table: String,
        key: String,
        row: Value,
    },
    DeleteEntity {
        table: String,
        key: String,
    },
    InsertEventLog(IntegrationEventLogEntry),
}

impl PendingWrite {
    fn entity_row(&self) -> Option<(&str, &str)> {
        match self {
            PendingWrite::InsertEntity { table, key, .. }
            | PendingWrite::UpdateEntity { table, key, .. }
            | PendingWrite::DeleteEntity { table, key } => Some((table, key)),
            PendingWrite::InsertEventLog(_) => None,
        }
    }
}

/// 内存事务：按顺序缓存写入，提交时原子应用
#[derive(Debug, Default)]
pub struct MemoryTransaction {
    writes: Vec<PendingWrite>,
    /// 开始时的提交序号
    snapshot: u64,
}

impl MemoryTransaction {
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    pub(crate) fn push(&mut self, write: PendingWrite) {
        self.writes.push(write);
    }

    /// 本事务内是否已写入（且未删除）该实体
    pub(crate) fn has_pending_entity(&self, table: &str, key: &str) -> Option<bool> {
        self.writes.iter().rev().find_map(|w| match w {
            PendingWrite::InsertEntity { table: t, key: k, .. }
            | PendingWrite::UpdateEntity { table: t, key: k, .. }
                if t == table && k == key =>
            {
                Some(true)
            }
            PendingWrite::DeleteEntity { table: t, key: k } if t == table && k == key => {
                Some(false)
            }
            _ => None,
        })
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<MemoryState>>,
    entity_sequence: Arc<AtomicI64>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| OutboxError::storage("in-memory storage lock poisoned"))
    }

    /// 类似数据库序列：取号后不随事务回滚归还
    pub fn next_entity_sequence(&self) -> i64 {
        self.entity_sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 已提交的事件信封数量
    pub fn event_log_count(&self) -> Result<usize> {
        Ok(self.lock()?.event_logs.len())
    }

    /// 已提交的失败链数量
    pub fn chain_count(&self) -> Result<usize> {
        Ok(self.lock()?.chains.len())
    }

    /// 已提交的失败消息数量
    pub fn failed_message_count(&self) -> Result<usize> {
        Ok(self.lock()?.messages.len())
    }

    fn commit_writes(&self, writes: Vec<PendingWrite>, snapshot: u64) -> Result<()> {
        let mut state = self.lock()?;
        if let Some((table, key)) = state
            .conflicting_row(&writes, snapshot)
            .and_then(PendingWrite::entity_row)
        {
            return Err(OutboxError::transient(format!(
                "write conflict: table={table}, key={key}"
            )));
        }

        let mut next = state.clone();
        next.commit_seq += 1;
        let version = next.commit_seq;
        for write in writes {
            if let Some((table, key)) = write.entity_row() {
                next.row_versions
                    .insert((table.to_string(), key.to_string()), version);
            }
            next.apply(write)?;
        }
        *state = next;
        Ok(())
    }
}

#[async_trait]
impl TransactionalStorage for InMemoryStorage {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction> {
        Ok(MemoryTransaction {
            writes: Vec::new(),
            snapshot: self.lock()?.commit_seq,
        })
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<()> {
        self.commit_writes(tx.writes, tx.snapshot)
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<()> {
        tracing::debug!(discarded = tx.writes.len(), "in-memory transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(table: &str, key: &str, row: Value) -> PendingWrite {
        PendingWrite::UpdateEntity {
            table: table.into(),
            key: key.into(),
            row,
        }
    }

    async fn seed(storage: &InMemoryStorage) {
        let mut tx = storage.begin().await.unwrap();
        tx.push(PendingWrite::InsertEntity {
            table: "orders".into(),
            key: "1".into(),
            row: json!({ "total": 1 }),
        });
        storage.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn first_committer_wins_on_the_same_row() {
        let storage = InMemoryStorage::new();
        seed(&storage).await;

        let mut first = storage.begin().await.unwrap();
        let mut second = storage.begin().await.unwrap();
        first.push(update("orders", "1", json!({ "total": 2 })));
        second.push(update("orders", "1", json!({ "total": 3 })));

        storage.commit(first).await.unwrap();
        let err = storage.commit(second).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(storage.lock().unwrap().entities["orders"]["1"], json!({ "total": 2 }));

        // 重新开始的事务基于新的提交序号，可以成功
        let mut retry = storage.begin().await.unwrap();
        retry.push(update("orders", "1", json!({ "total": 3 })));
        storage.commit(retry).await.unwrap();
        assert_eq!(storage.lock().unwrap().entities["orders"]["1"], json!({ "total": 3 }));
    }

    #[tokio::test]
    async fn disjoint_rows_commit_concurrently() {
        let storage = InMemoryStorage::new();
        seed(&storage).await;

        let mut first = storage.begin().await.unwrap();
        let mut second = storage.begin().await.unwrap();
        first.push(update("orders", "1", json!({ "total": 2 })));
        second.push(PendingWrite::InsertEntity {
            table: "orders".into(),
            key: "2".into(),
            row: json!({ "total": 5 }),
        });

        storage.commit(first).await.unwrap();
        storage.commit(second).await.unwrap();
        assert_eq!(storage.lock().unwrap().entities["orders"].len(), 2);
    }
}
