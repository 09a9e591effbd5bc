//! 实体（Entity）与实体仓储抽象
//!
//! outbox 不关心具体业务实体结构，只需要：
//! - 实体写入完成后可读取的标识（可能由数据库生成），用于回填事件的 `entity_id`；
//! - 能在给定事务内执行增、改、删的实体仓储（`EntityStore`）。
//!
use crate::error::OutboxResult as Result;
use async_trait::async_trait;
use std::fmt::Display;
use std::sync::Arc;

/// 具备唯一标识的业务实体
pub trait Entity: Send + Sync {
    /// 实体标识类型，要求可显示与可克隆
    type Id: Clone + Display + Send + Sync;

    /// 获取实体标识
    fn id(&self) -> &Self::Id;
}

/// 在调用方事务内写入实体；返回写入后的实体（含生成的标识）
#[async_trait]
pub trait EntityStore<E>: Send + Sync
where
    E: Entity + 'static,
{
    type Transaction: Send;

    async fn insert(&self, tx: &mut Self::Transaction, entity: E) -> Result<E>;

    async fn update(&self, tx: &mut Self::Transaction, entity: E) -> Result<E>;

    async fn delete(&self, tx: &mut Self::Transaction, entity: E) -> Result<E>;
}

#[async_trait]
impl<E, T> EntityStore<E> for Arc<T>
where
    E: Entity + 'static,
    T: EntityStore<E> + ?Sized,
{
    type Transaction = T::Transaction;

    async fn insert(&self, tx: &mut Self::Transaction, entity: E) -> Result<E> {
        (**self).insert(tx, entity).await
    }

    async fn update(&self, tx: &mut Self::Transaction, entity: E) -> Result<E> {
        (**self).update(tx, entity).await
    }

    async fn delete(&self, tx: &mut Self::Transaction, entity: E) -> Result<E> {
        (**self).delete(tx, entity).await
    }
}
