use super::{InMemoryStorage, MemoryTransaction, PendingWrite};
use crate::{
    entity::{Entity, EntityStore},
    error::{OutboxError, OutboxResult as Result},
};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;

/// 以 JSON 行保存实体的内存仓储；每个实例对应存储中的一张“表”
pub struct InMemoryEntityStore<E> {
    storage: InMemoryStorage,
    table: String,
    id_generator: Option<fn(&mut E, i64)>,
    _marker: PhantomData<fn() -> E>,
}

impl<E> InMemoryEntityStore<E>
where
    E: Entity + Serialize + DeserializeOwned + 'static,
{
    pub fn new(storage: InMemoryStorage, table: impl Into<String>) -> Self {
        Self {
            storage,
            table: table.into(),
            id_generator: None,
            _marker: PhantomData,
        }
    }

    /// 插入前以存储序列号为实体分配标识，模拟数据库生成的主键
    pub fn with_id_generator(mut self, generator: fn(&mut E, i64)) -> Self {
        self.id_generator = Some(generator);
        self
    }

    /// 按标识读取已提交的实体
    pub fn find(&self, id: &E::Id) -> Result<Option<E>> {
        let state = self.storage.lock()?;
        let row = state
            .entities
            .get(&self.table)
            .and_then(|rows| rows.get(&id.to_string()))
            .cloned();
        drop(state);

        row.map(|value| serde_json::from_value(value).map_err(OutboxError::from))
            .transpose()
    }

    /// 已提交的行数
    pub fn count(&self) -> Result<usize> {
        let state = self.storage.lock()?;
        Ok(state.entities.get(&self.table).map_or(0, |rows| rows.len()))
    }

    /// 行在事务视图中是否存在：事务内写入优先，其次是已提交数据
    fn visible(&self, tx: &MemoryTransaction, key: &str) -> Result<bool> {
        match tx.has_pending_entity(&self.table, key) {
            Some(present) => Ok(present),
            None => Ok(self.storage.lock()?.entity_exists(&self.table, key)),
        }
    }

    fn require_visible(&self, tx: &MemoryTransaction, key: &str) -> Result<()> {
        if self.visible(tx, key)? {
            Ok(())
        } else {
            Err(OutboxError::not_found(format!(
                "entity: table={}, id={key}",
                self.table
            )))
        }
    }
}

#[async_trait]
impl<E> EntityStore<E> for InMemoryEntityStore<E>
where
    E: Entity + Serialize + DeserializeOwned + 'static,
{
    type Transaction = MemoryTransaction;

    async fn insert(&self, tx: &mut Self::Transaction, mut entity: E) -> Result<E> {
        if let Some(generate) = self.id_generator {
            generate(&mut entity, self.storage.next_entity_sequence());
        }
        tx.push(PendingWrite::InsertEntity {
            table: self.table.clone(),
            key: entity.id().to_string(),
            row: serde_json::to_value(&entity)?,
        });
        Ok(entity)
    }

    async fn update(&self, tx: &mut Self::Transaction, entity: E) -> Result<E> {
        let key = entity.id().to_string();
        self.require_visible(tx, &key)?;
        tx.push(PendingWrite::UpdateEntity {
            table: self.table.clone(),
            key,
            row: serde_json::to_value(&entity)?,
        });
        Ok(entity)
    }

    async fn delete(&self, tx: &mut Self::Transaction, entity: E) -> Result<E> {
        let key = entity.id().to_string();
        self.require_visible(tx, &key)?;
        tx.push(PendingWrite::DeleteEntity {
            table: self.table.clone(),
            key,
        });
        Ok(entity)
    }
}
