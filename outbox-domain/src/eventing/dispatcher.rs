//! Outbox 分发器（OutboxDispatcher）
//!
//! 编排两条长驻任务：
//! - 周期读取待投递信封，标记 InProgress 后发布到总线，成功标记 Published，
//!   失败标记 PublishedFailed 并追加到实体的失败链；无法还原的信封同样进入失败链；
//! - 周期认领可重发的失败链，按序重发，全部成功则删除链，首个失败即释放链。
//!
//! 提供关闭与等待的 `DispatcherHandle`。
//!
use super::{EventBus, OutboundMessage};
use crate::{
    error::{OutboxError, OutboxResult as Result},
    event_log::{IntegrationEventLogEntry, IntegrationEventLogStore},
    failed_chain::FailureDetails,
    integration_event::DynIntegrationEvent,
    service::{IntegrationEventService, PendingEvent},
    unit_of_work::TransactionalStorage,
};
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// 分发器配置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 待投递信封的轮询间隔（毫秒）
    pub deliver_interval_ms: u64,
    /// 失败链重发的轮询间隔（毫秒）
    pub republish_interval_ms: u64,
    pub pending_batch_size: usize,
    pub chain_batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            deliver_interval_ms: 1_000,
            republish_interval_ms: 30_000,
            pending_batch_size: 100,
            chain_batch_size: 10,
        }
    }
}

impl DispatcherConfig {
    pub fn deliver_interval(&self) -> Duration {
        Duration::from_millis(self.deliver_interval_ms.max(1))
    }

    pub fn republish_interval(&self) -> Duration {
        Duration::from_millis(self.republish_interval_ms.max(1))
    }
}

/// 单轮分发结果（按事件计数）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub published: usize,
    pub failed: usize,
}

#[derive(Builder)]
pub struct OutboxDispatcher<S, L>
where
    S: TransactionalStorage + 'static,
    L: IntegrationEventLogStore<Transaction = S::Transaction> + 'static,
{
    service: Arc<IntegrationEventService<S, L>>,
    event_bus: Arc<dyn EventBus>,
    #[builder(default)]
    config: DispatcherConfig,
}

impl<S, L> OutboxDispatcher<S, L>
where
    S: TransactionalStorage + 'static,
    L: IntegrationEventLogStore<Transaction = S::Transaction> + 'static,
{
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// 投递一批待发布事件
    pub async fn dispatch_pending_once(&self) -> Result<DispatchReport> {
        let pending = self
            .service
            .get_pending_entries(self.config.pending_batch_size)
            .await?;

        let mut report = DispatchReport::default();
        for PendingEvent { entry, event } in pending {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    self.dead_letter_undecodable(&entry, &err).await?;
                    report.failed += 1;
                    continue;
                }
            };
            let message = OutboundMessage::from_event(event.as_ref())?;
            self.service
                .mark_event_as_in_progress(message.event_id)
                .await?;

            match self.event_bus.publish(&message).await {
                Ok(()) => {
                    self.service
                        .mark_event_as_published(message.event_id)
                        .await?;
                    report.published += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        event_id = %message.event_id,
                        event_type = %message.event_type,
                        error = %err,
                        "publish failed, moving event to failed message chain"
                    );
                    self.service.mark_event_as_failed(message.event_id).await?;
                    let failure = FailureDetails::from_error(&err);
                    self.service
                        .add_in_failed_message_chain(
                            event.event_entity_id(),
                            &message.event_type,
                            &message.body,
                            Some(&failure),
                        )
                        .await?;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// 无法还原的信封直接进入终态，原文连同还原错误写入失败链，后续信封照常投递
    async fn dead_letter_undecodable(
        &self,
        entry: &IntegrationEventLogEntry,
        err: &OutboxError,
    ) -> Result<()> {
        tracing::warn!(
            event_id = %entry.event_id(),
            event_type = entry.event_type_short_name(),
            error = %err,
            "pending event cannot be decoded, moving it to failed message chain"
        );
        self.service.mark_event_as_in_progress(entry.event_id()).await?;
        self.service.mark_event_as_failed(entry.event_id()).await?;
        self.service
            .add_in_failed_message_chain(
                Some(entry.entity_id()),
                entry.event_type_short_name(),
                entry.content(),
                Some(&FailureDetails::from_error(err)),
            )
            .await
    }

    /// 重发一批已开启 `should_republish` 的失败链
    pub async fn republish_failed_once(&self) -> Result<DispatchReport> {
        let chains = self
            .service
            .claim_failed_events_to_republish(self.config.chain_batch_size)
            .await?;

        let mut report = DispatchReport::default();
        for chain in chains {
            let mut published = 0;
            let mut failure = None;
            for event in &chain.events {
                match self.publish_event(event.as_ref()).await {
                    Ok(()) => published += 1,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            report.published += published;

            match failure {
                None => self.service.complete_republish(&chain).await?,
                Some(err) => {
                    tracing::warn!(
                        chain_id = chain.chain_id,
                        entity_id = %chain.entity_id,
                        published,
                        error = %err,
                        "republish failed, releasing chain"
                    );
                    self.service.release_republish(chain.chain_id).await?;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn publish_event(&self, event: &dyn DynIntegrationEvent) -> Result<()> {
        let message = OutboundMessage::from_event(event)?;
        self.event_bus.publish(&message).await
    }

    /// 启动分发器，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> DispatcherHandle {
        let token = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(2);

        {
            let dispatcher = self.clone();
            tasks.push(spawn_periodic(
                token.clone(),
                self.config.deliver_interval(),
                move || {
                    let dispatcher = dispatcher.clone();
                    async move {
                        match dispatcher.dispatch_pending_once().await {
                            Ok(report) if report != DispatchReport::default() => {
                                tracing::info!(
                                    published = report.published,
                                    failed = report.failed,
                                    "dispatched pending events"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => tracing::error!(error = %err, "pending dispatch failed"),
                        }
                    }
                },
            ));
        }

        {
            let dispatcher = self.clone();
            tasks.push(spawn_periodic(
                token.clone(),
                self.config.republish_interval(),
                move || {
                    let dispatcher = dispatcher.clone();
                    async move {
                        match dispatcher.republish_failed_once().await {
                            Ok(report) if report != DispatchReport::default() => {
                                tracing::info!(
                                    published = report.published,
                                    failed = report.failed,
                                    "republished failed message chains"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => tracing::error!(error = %err, "republish failed"),
                        }
                    }
                },
            ));
        }

        DispatcherHandle { token, tasks }
    }
}

fn spawn_periodic<F, Fut>(token: CancellationToken, interval: Duration, mut f: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => f().await,
            }
        }
    })
}

/// 分发器运行句柄：用于优雅关闭与等待任务结束
pub struct DispatcherHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
