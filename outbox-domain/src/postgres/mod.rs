//! Postgres 存储后端（需启用 `infra-sqlx` 特性）
//!
//! - `PgStorage`：基于连接池的事务能力，事务类型为 `sqlx::Transaction<'static, Postgres>`；
//! - `PgEventLogStore` / `PgFailedMessageChainStore`：两张 outbox 表与死信表的仓储实现；
//! - `schema`：建表 DDL 与迁移入口。
//!
//! 业务实体仓储由调用方基于同一事务类型实现 `EntityStore`。
//!
mod chain_store;
mod event_log_store;
pub mod schema;

pub use chain_store::PgFailedMessageChainStore;
pub use event_log_store::PgEventLogStore;

use crate::{
    error::{OutboxError, OutboxResult as Result},
    unit_of_work::TransactionalStorage,
};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres};

pub type PgTransaction = sqlx::Transaction<'static, Postgres>;

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionalStorage for PgStorage {
    type Transaction = PgTransaction;

    async fn begin(&self) -> Result<Self::Transaction> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<()> {
        tx.commit().await.map_err(commit_error)
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<()> {
        Ok(tx.rollback().await?)
    }
}

/// 提交阶段的错误：瞬时故障保持可重试，其余归为 CommitFailed
pub(crate) fn commit_error(err: sqlx::Error) -> OutboxError {
    match OutboxError::from(err) {
        transient @ OutboxError::TransientStorage { .. } => transient,
        other => OutboxError::CommitFailed {
            reason: other.to_string(),
        },
    }
}

pub(crate) fn limit(batch_size: usize) -> i64 {
    i64::try_from(batch_size).unwrap_or(i64::MAX)
}
