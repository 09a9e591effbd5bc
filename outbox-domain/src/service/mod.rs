//! 集成事件服务（IntegrationEventService）
//!
//! 编排业务实体写入与事件信封写入的原子提交，并提供待投递事件读取、
//! 死信链认领与重发确认等面向分发器的操作。
//!
mod integration_event_service;

pub use integration_event_service::{IntegrationEventService, PendingEvent, RepublishChain};
