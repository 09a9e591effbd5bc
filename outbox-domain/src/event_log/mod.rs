//! 事件日志（Event Log / Outbox）
//!
//! 定义事件信封的持久化形态（`IntegrationEventLogEntry`）、投递状态机（`EventState`）
//! 以及待投递批次读取与状态流转的仓储协议（`IntegrationEventLogStore`）。

mod event_state;
mod log_entry;
mod store;

pub use event_state::EventState;
pub use log_entry::{IntegrationEventLogEntry, NO_ENTITY, normalize_entity_id};
pub use store::IntegrationEventLogStore;
