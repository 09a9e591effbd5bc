//! 事件分发子系统（eventing）
//!
//! - `EventBus`：统一发布/订阅接口与出站消息 `OutboundMessage`；
//! - `InMemoryEventBus`：基于 broadcast 的内存实现；
//! - `OutboxDispatcher`：投递待发布信封、重发失败链的长驻任务。
//!
//! 不绑定具体传输实现，可对接任意消息系统。
//!
pub mod bus;
pub mod bus_inmemory;
pub mod dispatcher;

pub use bus::{EventBus, OutboundMessage};
pub use bus_inmemory::InMemoryEventBus;
pub use dispatcher::{DispatchReport, DispatcherConfig, DispatcherHandle, OutboxDispatcher};
