//! 工作单元（Unit of Work）与事务协调
//!
//! `TransactionalStorage` 抽象存储引擎的事务能力；`UnitOfWork` 在其上提供
//! begin/commit/rollback 与瞬时故障重试。每个实例同一时刻至多一个活动事务，
//! 不支持嵌套；实例被丢弃时未提交的事务随之释放（不会提交）。
//!
mod retry;

pub use retry::RetryStrategy;

use crate::error::{OutboxError, OutboxResult as Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

/// 存储引擎的事务能力
#[async_trait]
pub trait TransactionalStorage: Send + Sync {
    type Transaction: Send;

    async fn begin(&self) -> Result<Self::Transaction>;

    async fn commit(&self, tx: Self::Transaction) -> Result<()>;

    async fn rollback(&self, tx: Self::Transaction) -> Result<()>;
}

#[async_trait]
impl<T> TransactionalStorage for Arc<T>
where
    T: TransactionalStorage + ?Sized,
{
    type Transaction = T::Transaction;

    async fn begin(&self) -> Result<Self::Transaction> {
        (**self).begin().await
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<()> {
        (**self).commit(tx).await
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<()> {
        (**self).rollback(tx).await
    }
}

pub struct UnitOfWork<S>
where
    S: TransactionalStorage,
{
    storage: Arc<S>,
    transaction: Mutex<Option<S::Transaction>>,
    retry_strategy: RetryStrategy,
}

impl<S> UnitOfWork<S>
where
    S: TransactionalStorage,
{
    pub fn new(storage: Arc<S>, retry_strategy: RetryStrategy) -> Self {
        Self {
            storage,
            transaction: Mutex::new(None),
            retry_strategy,
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn retry_strategy(&self) -> &RetryStrategy {
        &self.retry_strategy
    }

    pub async fn is_active(&self) -> bool {
        self.transaction.lock().await.is_some()
    }

    /// 开启事务；已有活动事务时返回 InvalidState
    pub async fn begin_transaction(&self) -> Result<()> {
        let mut slot = self.transaction.lock().await;
        if slot.is_some() {
            return Err(OutboxError::invalid_state(
                "a transaction is already active on this unit of work",
            ));
        }
        *slot = Some(self.storage.begin().await?);
        Ok(())
    }

    /// 提交活动事务；没有活动事务时返回 InvalidState
    pub async fn commit_transaction(&self) -> Result<()> {
        let tx = self.transaction.lock().await.take().ok_or_else(|| {
            OutboxError::invalid_state("no active transaction to commit")
        })?;
        self.storage.commit(tx).await
    }

    /// 回滚活动事务；没有活动事务时为空操作
    pub async fn rollback_transaction(&self) -> Result<()> {
        let tx = self.transaction.lock().await.take();
        match tx {
            Some(tx) => self.storage.rollback(tx).await,
            None => Ok(()),
        }
    }

    /// 借出活动事务供仓储在其中读写；守卫须在提交/回滚前释放
    pub async fn transaction(&self) -> Result<MappedMutexGuard<'_, S::Transaction>> {
        let guard = self.transaction.lock().await;
        MutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| OutboxError::invalid_state("no active transaction"))
    }

    /// 在重试策略下执行操作；操作须自行 begin/commit/rollback，
    /// 发生瞬时故障时整个操作（含事务边界）被重放
    pub async fn execute_with_retry_strategy<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry_strategy.execute(operation).await
    }
}
