use super::{InMemoryStorage, MemoryState};
use crate::{
    error::{OutboxError, OutboxResult as Result},
    event_log::normalize_entity_id,
    failed_chain::{
        ChainClaim, FailedMessage, FailedMessageChain, FailedMessageChainStore, FailureDetails,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// 基于 `InMemoryStorage` 的失败链仓储；每次写入都在存储锁内独立提交
#[derive(Clone)]
pub struct InMemoryFailedMessageChainStore {
    storage: InMemoryStorage,
    default_should_republish: bool,
}

impl InMemoryFailedMessageChainStore {
    pub fn new(storage: InMemoryStorage) -> Self {
        Self {
            storage,
            default_should_republish: false,
        }
    }

    /// 新建链时 `should_republish` 的初始值
    pub fn with_default_should_republish(mut self, should_republish: bool) -> Self {
        self.default_should_republish = should_republish;
        self
    }

    pub fn storage(&self) -> &InMemoryStorage {
        &self.storage
    }
}

fn lease_cutoff(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_sub_signed(lease))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl MemoryState {
    /// 链及其消息（按消息主键有序）
    fn load_chain(&self, chain_id: i64) -> Option<FailedMessageChain> {
        let chain = self.chains.get(&chain_id)?;
        let messages = self
            .messages
            .values()
            .filter(|m| m.chain_id() == chain_id)
            .cloned()
            .collect();
        Some(chain.clone().with_failed_messages(messages))
    }

    /// 最早优先选取可重发的链
    fn select_republishable(
        &self,
        limit: usize,
        lease_expired_before: DateTime<Utc>,
    ) -> Vec<i64> {
        let mut candidates: Vec<&FailedMessageChain> = self
            .chains
            .values()
            .filter(|c| c.should_republish() && !c.is_claimed(lease_expired_before))
            .collect();
        candidates.sort_by_key(|c| (c.creation_time(), c.id()));
        candidates.into_iter().take(limit).map(|c| c.id()).collect()
    }

    /// 先删消息再删链
    fn delete_chain(&mut self, chain_id: i64) -> bool {
        self.messages.retain(|_, m| m.chain_id() != chain_id);
        match self.chains.remove(&chain_id) {
            Some(chain) => {
                self.chain_by_entity.remove(chain.entity_id());
                true
            }
            None => false,
        }
    }

    fn chain_mut(&mut self, chain_id: i64) -> Result<&mut FailedMessageChain> {
        self.chains
            .get_mut(&chain_id)
            .ok_or_else(|| OutboxError::not_found(format!("failed message chain: id={chain_id}")))
    }
}

#[async_trait]
impl FailedMessageChainStore for InMemoryFailedMessageChainStore {
    async fn exists(&self, entity_id: Option<&str>) -> Result<bool> {
        let key = normalize_entity_id(entity_id);
        Ok(self.storage.lock()?.chain_by_entity.contains_key(key))
    }

    async fn append(
        &self,
        entity_id: Option<&str>,
        event_type_short_name: &str,
        body: &str,
        failure: Option<&FailureDetails>,
    ) -> Result<()> {
        let key = normalize_entity_id(entity_id);
        let now = Utc::now();
        let mut state = self.storage.lock()?;

        // 查找与创建在同一把锁内完成，并发追加只会得到一条链
        let existing = state.chain_by_entity.get(key).copied();
        let chain_id = match existing {
            Some(id) => id,
            None => {
                state.next_chain_id += 1;
                let id = state.next_chain_id;
                let chain = FailedMessageChain::builder()
                    .id(id)
                    .entity_id(key.to_string())
                    .creation_time(now)
                    .should_republish(self.default_should_republish)
                    .build();
                state.chains.insert(id, chain);
                state.chain_by_entity.insert(key.to_string(), id);
                id
            }
        };

        state.next_message_id += 1;
        let message_id = state.next_message_id;
        let message = FailedMessage::builder()
            .id(message_id)
            .chain_id(chain_id)
            .creation_time(now)
            .body(body.to_string())
            .event_type_short_name(event_type_short_name.to_string())
            .maybe_message(failure.map(|f| f.message().to_string()))
            .maybe_stack_trace(failure.and_then(|f| f.stack_trace().map(str::to_string)))
            .build();
        state.messages.insert(message_id, message);

        tracing::debug!(
            entity_id = key,
            chain_id,
            message_id,
            event_type = event_type_short_name,
            "appended to failed message chain"
        );
        Ok(())
    }

    async fn retrieve_chains_to_republish(
        &self,
        chain_batch_size: usize,
    ) -> Result<Vec<FailedMessageChain>> {
        let mut state = self.storage.lock()?;
        // 已被认领的链无论租约是否过期都不参与破坏性读取
        let ids = state.select_republishable(chain_batch_size, DateTime::<Utc>::MIN_UTC);

        let mut chains = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(chain) = state.load_chain(id) {
                chains.push(chain);
            }
            state.delete_chain(id);
        }
        Ok(chains)
    }

    async fn claim_chains_to_republish(
        &self,
        chain_batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<FailedMessageChain>> {
        let now = Utc::now();
        let mut state = self.storage.lock()?;
        let ids = state.select_republishable(chain_batch_size, lease_cutoff(now, lease));

        let mut chains = Vec::with_capacity(ids.len());
        for id in ids {
            state.chain_mut(id)?.set_claimed_at(Some(now));
            if let Some(chain) = state.load_chain(id) {
                chains.push(chain);
            }
        }
        Ok(chains)
    }

    async fn complete_republish(&self, claims: &[ChainClaim]) -> Result<()> {
        let mut state = self.storage.lock()?;
        // 先整体校验，缺一条链则整批不动
        if let Some(missing) = claims.iter().find(|c| !state.chains.contains_key(&c.chain_id)) {
            return Err(OutboxError::not_found(format!(
                "failed message chain: id={}",
                missing.chain_id
            )));
        }

        for claim in claims {
            let chain_id = claim.chain_id;
            state
                .messages
                .retain(|id, m| m.chain_id() != chain_id || !claim.message_ids.contains(id));
            let remaining = state.messages.values().any(|m| m.chain_id() == chain_id);
            if remaining {
                tracing::debug!(chain_id, "chain gained messages while claimed; kept for republish");
                state.chain_mut(chain_id)?.set_claimed_at(None);
            } else {
                state.delete_chain(chain_id);
            }
        }
        Ok(())
    }

    async fn release_chain(&self, chain_id: i64) -> Result<()> {
        let mut state = self.storage.lock()?;
        let chain = state.chain_mut(chain_id)?;
        chain.set_claimed_at(None);
        chain.set_should_republish(false);
        Ok(())
    }

    async fn set_should_republish(&self, entity_id: &str, should_republish: bool) -> Result<()> {
        let mut state = self.storage.lock()?;
        let chain_id = *state.chain_by_entity.get(entity_id).ok_or_else(|| {
            OutboxError::not_found(format!("failed message chain: entity_id={entity_id}"))
        })?;
        state.chain_mut(chain_id)?.set_should_republish(should_republish);
        Ok(())
    }

    async fn set_should_skip(&self, message_id: i64, should_skip: bool) -> Result<()> {
        let mut state = self.storage.lock()?;
        let message = state.messages.get_mut(&message_id).ok_or_else(|| {
            OutboxError::not_found(format!("failed message: id={message_id}"))
        })?;
        message.set_should_skip(should_skip);
        Ok(())
    }

    async fn find_chain(&self, entity_id: &str) -> Result<Option<FailedMessageChain>> {
        let state = self.storage.lock()?;
        Ok(state
            .chain_by_entity
            .get(entity_id)
            .and_then(|id| state.load_chain(*id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::NO_ENTITY;

    fn store() -> InMemoryFailedMessageChainStore {
        InMemoryFailedMessageChainStore::new(InMemoryStorage::new())
    }

    #[tokio::test]
    async fn append_groups_by_entity_in_order() {
        let store = store();
        store.append(Some("42"), "A", "{1}", None).await.unwrap();
        store
            .append(Some("42"), "B", "{2}", Some(&FailureDetails::new("boom", None)))
            .await
            .unwrap();
        store.append(Some("7"), "A", "{3}", None).await.unwrap();

        let chain = store.find_chain("42").await.unwrap().unwrap();
        assert!(!chain.should_republish());
        let bodies: Vec<_> = chain.failed_messages().iter().map(|m| m.body()).collect();
        assert_eq!(bodies, ["{1}", "{2}"]);
        assert_eq!(chain.failed_messages()[1].message(), Some("boom"));
        assert_eq!(store.storage().chain_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn missing_entity_goes_to_sentinel_chain() {
        let store = store();
        store.append(None, "A", "{}", None).await.unwrap();
        assert!(store.exists(None).await.unwrap());
        assert!(store.exists(Some(NO_ENTITY)).await.unwrap());
        assert!(store.find_chain(NO_ENTITY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn destructive_retrieval_removes_chain_and_messages() {
        let store = store().with_default_should_republish(true);
        store.append(Some("a"), "A", "{}", None).await.unwrap();
        store.append(Some("a"), "A", "{}", None).await.unwrap();

        let chains = store.retrieve_chains_to_republish(10).await.unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].failed_messages().len(), 2);
        assert!(!store.exists(Some("a")).await.unwrap());
        assert_eq!(store.storage().failed_message_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn claimed_chain_is_not_claimed_twice_within_lease() {
        let store = store().with_default_should_republish(true);
        store.append(Some("a"), "A", "{}", None).await.unwrap();

        let lease = Duration::from_secs(60);
        assert_eq!(store.claim_chains_to_republish(5, lease).await.unwrap().len(), 1);
        assert!(store.claim_chains_to_republish(5, lease).await.unwrap().is_empty());
        assert!(store.retrieve_chains_to_republish(5).await.unwrap().is_empty());

        // 租约为零时认领立即过期
        assert_eq!(
            store
                .claim_chains_to_republish(5, Duration::ZERO)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn release_disarms_chain_and_keeps_messages() {
        let store = store().with_default_should_republish(true);
        store.append(Some("a"), "A", "{}", None).await.unwrap();
        let chain = store
            .claim_chains_to_republish(1, Duration::from_secs(60))
            .await
            .unwrap()
            .remove(0);

        store.release_chain(chain.id()).await.unwrap();
        let chain = store.find_chain("a").await.unwrap().unwrap();
        assert!(!chain.should_republish());
        assert_eq!(chain.claimed_at(), None);
        assert_eq!(chain.failed_messages().len(), 1);
    }

    #[tokio::test]
    async fn completion_keeps_messages_appended_after_claim() {
        let store = store().with_default_should_republish(true);
        store.append(Some("a"), "A", "{1}", None).await.unwrap();
        let chain = store
            .claim_chains_to_republish(1, Duration::from_secs(60))
            .await
            .unwrap()
            .remove(0);
        store.append(Some("a"), "A", "{2}", None).await.unwrap();

        store.complete_republish(&[ChainClaim::of(&chain)]).await.unwrap();
        let chain = store.find_chain("a").await.unwrap().unwrap();
        let bodies: Vec<_> = chain.failed_messages().iter().map(|m| m.body()).collect();
        assert_eq!(bodies, ["{2}"]);
        assert_eq!(chain.claimed_at(), None);
        assert!(chain.should_republish());
    }

    #[tokio::test]
    async fn batch_completion_is_all_or_nothing() {
        let store = store().with_default_should_republish(true);
        store.append(Some("a"), "A", "{}", None).await.unwrap();
        let chain = store
            .claim_chains_to_republish(1, Duration::from_secs(60))
            .await
            .unwrap()
            .remove(0);

        let claims = [
            ChainClaim::of(&chain),
            ChainClaim {
                chain_id: 99,
                message_ids: vec![],
            },
        ];
        assert!(matches!(
            store.complete_republish(&claims).await,
            Err(OutboxError::NotFound { .. })
        ));
        assert_eq!(store.storage().failed_message_count().unwrap(), 1);

        store.complete_republish(&claims[..1]).await.unwrap();
        assert!(!store.exists(Some("a")).await.unwrap());
        assert_eq!(store.storage().failed_message_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = store();
        assert!(matches!(
            store
                .complete_republish(&[ChainClaim {
                    chain_id: 99,
                    message_ids: vec![],
                }])
                .await,
            Err(OutboxError::NotFound { .. })
        ));
        assert!(matches!(
            store.set_should_republish("nope", true).await,
            Err(OutboxError::NotFound { .. })
        ));
        assert!(matches!(
            store.set_should_skip(99, true).await,
            Err(OutboxError::NotFound { .. })
        ));
    }
}
