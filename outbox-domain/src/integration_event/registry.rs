//! 事件类型注册表（EventTypeRegistry）
//!
//! 启动时显式登记所有已知事件类型，建立「短类型标签 → 类型化解码函数」的映射，
//! 读取路径据此把持久化的 JSON 内容还原为具体事件。标签须在注册集合内唯一，
//! 解析时仅做单一匹配断言：零个或多个匹配均返回 `TypeResolution`。
//!
use super::integration_event_trait::{BoxedIntegrationEvent, IntegrationEvent, short_type_name};
use crate::error::{OutboxError, OutboxResult};
use std::collections::HashMap;

type DecodeFn = fn(&str) -> OutboxResult<BoxedIntegrationEvent>;

/// 单个事件类型的登记信息
#[derive(Clone, Copy)]
pub struct EventTypeRegistration {
    type_name: &'static str,
    short_name: &'static str,
    decode: DecodeFn,
}

impl EventTypeRegistration {
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn short_name(&self) -> &'static str {
        self.short_name
    }

    /// 将序列化内容解码为本类型的事件
    pub fn decode(&self, content: &str) -> OutboxResult<BoxedIntegrationEvent> {
        (self.decode)(content)
    }
}

impl std::fmt::Debug for EventTypeRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTypeRegistration")
            .field("type_name", &self.type_name)
            .field("short_name", &self.short_name)
            .finish()
    }
}

fn decode_as<E: IntegrationEvent>(content: &str) -> OutboxResult<BoxedIntegrationEvent> {
    serde_json::from_str::<E>(content)
        .map(|event| Box::new(event) as BoxedIntegrationEvent)
        .map_err(|source| OutboxError::Deserialization {
            type_name: E::TYPE_NAME.to_string(),
            source,
        })
}

#[derive(Debug, Clone, Default)]
pub struct EventTypeRegistry {
    by_short_name: HashMap<&'static str, Vec<EventTypeRegistration>>,
}

impl EventTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记事件类型；同一完全限定类型名重复登记时忽略
    pub fn register<E: IntegrationEvent>(&mut self) -> &mut Self {
        let registration = EventTypeRegistration {
            type_name: E::TYPE_NAME,
            short_name: short_type_name(E::TYPE_NAME),
            decode: decode_as::<E>,
        };

        let list = self.by_short_name.entry(registration.short_name).or_default();
        if !list.iter().any(|r| r.type_name == registration.type_name) {
            list.push(registration);
        }
        self
    }

    /// 链式登记，便于在装配阶段一次性构建
    pub fn with<E: IntegrationEvent>(mut self) -> Self {
        self.register::<E>();
        self
    }

    /// 按短类型标签解析唯一的登记项
    pub fn resolve(&self, tag: &str) -> OutboxResult<&EventTypeRegistration> {
        match self.by_short_name.get(tag).map(Vec::as_slice) {
            Some([single]) => Ok(single),
            Some(many) => Err(OutboxError::TypeResolution {
                tag: tag.to_string(),
                matches: many.len(),
            }),
            None => Err(OutboxError::TypeResolution {
                tag: tag.to_string(),
                matches: 0,
            }),
        }
    }

    /// 解析标签并反序列化内容
    pub fn decode(&self, tag: &str, content: &str) -> OutboxResult<BoxedIntegrationEvent> {
        self.resolve(tag)?.decode(content)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.by_short_name.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.by_short_name.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_short_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    macro_rules! test_event {
        ($name:ident, $type_name:expr) => {
            #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
            struct $name {
                id: Uuid,
                entity_id: Option<String>,
                creation_date: DateTime<Utc>,
                amount: i64,
            }

            impl IntegrationEvent for $name {
                const TYPE_NAME: &'static str = $type_name;
                fn id(&self) -> Uuid {
                    self.id
                }
                fn creation_date(&self) -> DateTime<Utc> {
                    self.creation_date
                }
                fn entity_id(&self) -> Option<&str> {
                    self.entity_id.as_deref()
                }
                fn set_entity_id(&mut self, entity_id: String) {
                    self.entity_id = Some(entity_id);
                }
            }
        };
    }

    test_event!(OrderPlaced, "shop::orders::OrderPlaced");
    test_event!(OrderShipped, "shop::orders::OrderShipped");
    test_event!(LegacyOrderPlaced, "legacy::OrderPlaced");

    fn placed() -> OrderPlaced {
        OrderPlaced {
            id: Uuid::now_v7(),
            entity_id: Some("42".into()),
            creation_date: Utc::now(),
            amount: 7,
        }
    }

    #[test]
    fn decode_roundtrip_restores_original_payload() {
        let registry = EventTypeRegistry::new()
            .with::<OrderPlaced>()
            .with::<OrderShipped>();

        let original = placed();
        let content = serde_json::to_string(&original).unwrap();
        let decoded = registry.decode("OrderPlaced", &content).unwrap();

        assert_eq!(decoded.downcast_ref::<OrderPlaced>(), Some(&original));
        assert!(!decoded.is::<OrderShipped>());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unknown_tag_is_a_resolution_error() {
        let registry = EventTypeRegistry::new().with::<OrderPlaced>();
        match registry.resolve("Nope").unwrap_err() {
            OutboxError::TypeResolution { tag, matches } => {
                assert_eq!(tag, "Nope");
                assert_eq!(matches, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ambiguous_tag_is_a_resolution_error() {
        let registry = EventTypeRegistry::new()
            .with::<OrderPlaced>()
            .with::<LegacyOrderPlaced>();
        match registry.resolve("OrderPlaced").unwrap_err() {
            OutboxError::TypeResolution { matches, .. } => assert_eq!(matches, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn registering_same_type_twice_is_idempotent() {
        let mut registry = EventTypeRegistry::new();
        registry.register::<OrderPlaced>().register::<OrderPlaced>();
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve("OrderPlaced").is_ok());
    }

    #[test]
    fn bad_content_is_a_deserialization_error() {
        let registry = EventTypeRegistry::new().with::<OrderPlaced>();
        match registry.decode("OrderPlaced", r#"{"amount":"x"}"#).unwrap_err() {
            OutboxError::Deserialization { type_name, .. } => {
                assert_eq!(type_name, "shop::orders::OrderPlaced")
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
