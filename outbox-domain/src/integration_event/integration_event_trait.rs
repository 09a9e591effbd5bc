use crate::error::OutboxResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::fmt;
use uuid::Uuid;

/// 集成事件载荷需要满足的通用能力边界
///
/// 通常通过 `#[integration_event]` 宏生成实现。
pub trait IntegrationEvent:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// 完全限定类型名（形如 `shop::events::OrderPlaced`），最后一段即短类型标签
    const TYPE_NAME: &'static str;

    /// 事件实例唯一标识，构造时分配
    fn id(&self) -> Uuid;

    /// 事件创建时间
    fn creation_date(&self) -> DateTime<Utc>;

    /// 事件所关联的业务实体标识（实体写入后才可得）
    fn entity_id(&self) -> Option<&str>;

    fn set_entity_id(&mut self, entity_id: String);

    fn short_type_name() -> &'static str {
        short_type_name(Self::TYPE_NAME)
    }
}

/// 取完全限定类型名的最后一段（同时识别 `::` 与 `.` 分隔符）
pub fn short_type_name(type_name: &str) -> &str {
    type_name.rsplit([':', '.']).next().unwrap_or(type_name)
}

/// `IntegrationEvent` 的类型擦除视图，用于承载还原后的异构事件序列
pub trait DynIntegrationEvent: fmt::Debug + Send + Sync {
    fn event_id(&self) -> Uuid;

    fn event_type_name(&self) -> &'static str;

    fn event_short_name(&self) -> &'static str;

    fn event_entity_id(&self) -> Option<&str>;

    fn event_creation_date(&self) -> DateTime<Utc>;

    /// 以紧凑 JSON 形式序列化事件
    fn to_json(&self) -> OutboxResult<String>;

    fn as_any(&self) -> &dyn Any;
}

impl<E> DynIntegrationEvent for E
where
    E: IntegrationEvent,
{
    fn event_id(&self) -> Uuid {
        self.id()
    }

    fn event_type_name(&self) -> &'static str {
        E::TYPE_NAME
    }

    fn event_short_name(&self) -> &'static str {
        E::short_type_name()
    }

    fn event_entity_id(&self) -> Option<&str> {
        self.entity_id()
    }

    fn event_creation_date(&self) -> DateTime<Utc> {
        self.creation_date()
    }

    fn to_json(&self) -> OutboxResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn DynIntegrationEvent {
    /// 还原为具体事件类型
    pub fn downcast_ref<E: IntegrationEvent>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    pub fn is<E: IntegrationEvent>(&self) -> bool {
        self.as_any().is::<E>()
    }
}

pub type BoxedIntegrationEvent = Box<dyn DynIntegrationEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_type_name_takes_last_segment() {
        assert_eq!(short_type_name("shop::events::OrderPlaced"), "OrderPlaced");
        assert_eq!(short_type_name("Shop.Events.OrderPlaced"), "OrderPlaced");
        assert_eq!(short_type_name("OrderPlaced"), "OrderPlaced");
    }
}
