//! 集成事件（Integration Event）与事件类型注册表
//!
//! 定义事件载荷需要实现的最小接口（`IntegrationEvent`）、用于异构集合的类型擦除视图
//! （`DynIntegrationEvent`），以及按短类型标签还原载荷的 `EventTypeRegistry`。

mod integration_event_trait;
mod registry;

pub use integration_event_trait::{
    BoxedIntegrationEvent, DynIntegrationEvent, IntegrationEvent, short_type_name,
};
pub use registry::{EventTypeRegistration, EventTypeRegistry};
