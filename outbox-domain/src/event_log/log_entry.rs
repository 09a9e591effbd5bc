//! 事件信封持久化模型（IntegrationEventLogEntry）
//!
//! 事件在 outbox 表中的标准形态：序列化内容 + 投递状态元数据。内容在创建时
//! 一次性序列化，此后不可变；`content` 与 `event_type_name` 足以还原原始载荷。
//!
use super::EventState;
use crate::{
    error::OutboxResult,
    integration_event::{IntegrationEvent, short_type_name},
};
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 无实体事件使用的占位实体标识
pub const NO_ENTITY: &str = "NoEntity";

/// 归一化实体标识：缺失时落到 `NO_ENTITY`
pub fn normalize_entity_id(entity_id: Option<&str>) -> &str {
    entity_id.unwrap_or(NO_ENTITY)
}

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct IntegrationEventLogEntry {
    /// 事件唯一标识（主键）
    event_id: Uuid,
    /// 完全限定事件类型名
    event_type_name: String,
    /// 事件关联的业务实体标识
    entity_id: String,
    /// 创建时序列化的事件内容
    content: String,
    state: EventState,
    /// 进入 InProgress 的次数
    times_sent: i32,
    creation_time: DateTime<Utc>,
}

impl IntegrationEventLogEntry {
    /// 由事件构造待投递信封
    pub fn from_event<E: IntegrationEvent>(event: &E) -> OutboxResult<Self> {
        Ok(Self {
            event_id: event.id(),
            event_type_name: E::TYPE_NAME.to_string(),
            entity_id: normalize_entity_id(event.entity_id()).to_string(),
            content: serde_json::to_string_pretty(event)?,
            state: EventState::NotPublished,
            times_sent: 0,
            creation_time: event.creation_date(),
        })
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type_name(&self) -> &str {
        &self.event_type_name
    }

    pub fn event_type_short_name(&self) -> &str {
        short_type_name(&self.event_type_name)
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn state(&self) -> EventState {
        self.state
    }

    pub fn times_sent(&self) -> i32 {
        self.times_sent
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    /// 应用状态流转；进入 InProgress 时累加发送次数。
    /// 调用方负责先以 `EventState::can_transition_to` 校验。
    pub(crate) fn apply_state(&mut self, state: EventState) {
        if state == EventState::InProgress {
            self.times_sent += 1;
        }
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pinged {
        id: Uuid,
        entity_id: Option<String>,
        creation_date: DateTime<Utc>,
        x: i32,
    }

    impl IntegrationEvent for Pinged {
        const TYPE_NAME: &'static str = "net::Pinged";
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

    fn pinged(entity_id: Option<&str>) -> Pinged {
        Pinged {
            id: Uuid::now_v7(),
            entity_id: entity_id.map(str::to_string),
            creation_date: Utc::now(),
            x: 1,
        }
    }

    #[test]
    fn from_event_stamps_envelope_fields() {
        let event = pinged(Some("e-1"));
        let entry = IntegrationEventLogEntry::from_event(&event).unwrap();

        assert_eq!(entry.event_id(), event.id);
        assert_eq!(entry.event_type_name(), "net::Pinged");
        assert_eq!(entry.event_type_short_name(), "Pinged");
        assert_eq!(entry.entity_id(), "e-1");
        assert_eq!(entry.state(), EventState::NotPublished);
        assert_eq!(entry.times_sent(), 0);
        assert_eq!(entry.creation_time(), event.creation_date);

        let restored: Pinged = serde_json::from_str(entry.content()).unwrap();
        assert_eq!(restored, event);
    }

    #[test]
    fn missing_entity_id_falls_back_to_sentinel() {
        let entry = IntegrationEventLogEntry::from_event(&pinged(None)).unwrap();
        assert_eq!(entry.entity_id(), NO_ENTITY);
    }

    #[test]
    fn in_progress_increments_times_sent() {
        let mut entry = IntegrationEventLogEntry::from_event(&pinged(Some("e"))).unwrap();
        entry.apply_state(EventState::InProgress);
        entry.apply_state(EventState::InProgress);
        entry.apply_state(EventState::Published);
        assert_eq!(entry.times_sent(), 2);
        assert_eq!(entry.state(), EventState::Published);
    }
}
