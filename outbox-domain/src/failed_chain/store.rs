//! 失败链仓储协议（FailedMessageChainStore）
//!
//! 死信按实体分组持久化；所有写入各自独立提交，不参与业务事务。
//!
use super::{ChainClaim, FailedMessageChain, FailureDetails};
use crate::error::OutboxResult as Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait FailedMessageChainStore: Send + Sync {
    /// 实体是否已有失败链；缺失的实体标识归一化为 `NoEntity`
    async fn exists(&self, entity_id: Option<&str>) -> Result<bool>;

    /// 追加一条失败记录：已有链则追加，否则以默认 `should_republish` 新建
    async fn append(
        &self,
        entity_id: Option<&str>,
        event_type_short_name: &str,
        body: &str,
        failure: Option<&FailureDetails>,
    ) -> Result<()>;

    /// 选取待重发的链（最早优先，至多 `chain_batch_size` 条，含完整消息），
    /// 并在同一调用内删除。调用方确认重发前数据即已消失，优先使用两阶段接口。
    async fn retrieve_chains_to_republish(
        &self,
        chain_batch_size: usize,
    ) -> Result<Vec<FailedMessageChain>>;

    /// 两阶段重发第一步：认领待重发的链（写入租约，不删除）。
    /// 仍在租约内的链不会被再次选中；超过 `lease` 的认领视为过期。
    async fn claim_chains_to_republish(
        &self,
        chain_batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<FailedMessageChain>>;

    /// 两阶段重发第二步：在同一事务内确认一批认领。
    /// 只删除认领时读到的消息；认领之后追加的消息保留，所在链清除认领继续等待重发，
    /// 消息已清空的链随之删除。任一链不存在时整体返回 NotFound，不做任何删除。
    async fn complete_republish(&self, claims: &[ChainClaim]) -> Result<()>;

    /// 重发未成功：释放认领并关闭 `should_republish`，等待人工重新开启
    async fn release_chain(&self, chain_id: i64) -> Result<()>;

    async fn set_should_republish(&self, entity_id: &str, should_republish: bool) -> Result<()>;

    async fn set_should_skip(&self, message_id: i64, should_skip: bool) -> Result<()>;

    async fn find_chain(&self, entity_id: &str) -> Result<Option<FailedMessageChain>>;
}

#[async_trait]
impl<T> FailedMessageChainStore for Arc<T>
where
    T: FailedMessageChainStore + ?Sized,
{
    async fn exists(&self, entity_id: Option<&str>) -> Result<bool> {
        (**self).exists(entity_id).await
    }

    async fn append(
        &self,
        entity_id: Option<&str>,
        event_type_short_name: &str,
        body: &str,
        failure: Option<&FailureDetails>,
    ) -> Result<()> {
        (**self)
            .append(entity_id, event_type_short_name, body, failure)
            .await
    }

    async fn retrieve_chains_to_republish(
        &self,
        chain_batch_size: usize,
    ) -> Result<Vec<FailedMessageChain>> {
        (**self).retrieve_chains_to_republish(chain_batch_size).await
    }

    async fn claim_chains_to_republish(
        &self,
        chain_batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<FailedMessageChain>> {
        (**self)
            .claim_chains_to_republish(chain_batch_size, lease)
            .await
    }

    async fn complete_republish(&self, claims: &[ChainClaim]) -> Result<()> {
        (**self).complete_republish(claims).await
    }

    async fn release_chain(&self, chain_id: i64) -> Result<()> {
        (**self).release_chain(chain_id).await
    }

    async fn set_should_republish(&self, entity_id: &str, should_republish: bool) -> Result<()> {
        (**self).set_should_republish(entity_id, should_republish).await
    }

    async fn set_should_skip(&self, message_id: i64, should_skip: bool) -> Result<()> {
        (**self).set_should_skip(message_id, should_skip).await
    }

    async fn find_chain(&self, entity_id: &str) -> Result<Option<FailedMessageChain>> {
        (**self).find_chain(entity_id).await
    }
}
