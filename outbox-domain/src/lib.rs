//! 事务型 Outbox 与失败链死信库（outbox-domain）
//!
//! 在与业务实体写入相同的事务中记录集成事件，保证“状态变更”与“待发布事件”
//! 要么同时提交、要么同时回滚；随后由分发器把事件推送到总线。发布失败的事件
//! 按实体归组为失败链，供有界、有序地重发。
//!
//! - 集成事件与类型注册表（`integration_event`）
//! - 事件信封、投递状态机与仓储协议（`event_log`）
//! - 失败链死信模型与仓储协议（`failed_chain`）
//! - 工作单元与瞬时故障重试（`unit_of_work`）
//! - 编排原子写入与死信消费的服务（`service`）
//! - 总线与分发器（`eventing`，默认启用）
//! - 内存后端（`memory`）与 Postgres 后端（`postgres`，特性 `infra-sqlx`）
//!
//! 典型用法：
//! 1. 用 `#[integration_event]` 定义事件并注册到 `EventTypeRegistry`；
//! 2. 选择存储后端，构建 `IntegrationEventService`；
//! 3. 业务操作通过 `add/update/remove` 写入实体与事件；
//! 4. 启动 `OutboxDispatcher` 投递待发布事件与重发失败链。
//!
pub mod config;
pub mod entity;
pub mod error;
pub mod event_log;
#[cfg(feature = "eventing")]
pub mod eventing;
pub mod failed_chain;
pub mod integration_event;
pub mod memory;
#[cfg(feature = "infra-sqlx")]
pub mod postgres;
pub mod service;
pub mod unit_of_work;

// 过程宏生成的代码通过 ::outbox_domain::chrono / ::outbox_domain::uuid 引用字段类型
pub use chrono;
pub use uuid;

// 允许在本 crate 内部通过 ::outbox_domain 进行自引用，
// 以便过程宏在本 crate 的单元测试中也能解析到 ::outbox_domain 路径。
extern crate self as outbox_domain;
