use serde::{Deserialize, Serialize};

/// 事件信封的投递状态
///
/// `NotPublished → InProgress → Published | PublishedFailed`，任何路径都不会回到
/// `NotPublished`；失败事件只通过死信链重发，不会重置此状态机。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum EventState {
    NotPublished = 0,
    InProgress = 1,
    Published = 2,
    PublishedFailed = 3,
}

impl EventState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventState::Published | EventState::PublishedFailed)
    }

    /// NotPublished 只能进入 InProgress；InProgress 可重入（重投计数）或进入终态
    pub fn can_transition_to(&self, next: EventState) -> bool {
        use EventState::*;
        matches!(
            (self, next),
            (NotPublished, InProgress) | (InProgress, InProgress | Published | PublishedFailed)
        )
    }

    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(EventState::NotPublished),
            1 => Some(EventState::InProgress),
            2 => Some(EventState::Published),
            3 => Some(EventState::PublishedFailed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EventState::*;
    use super::*;

    #[test]
    fn terminal_states_accept_nothing() {
        for next in [NotPublished, InProgress, Published, PublishedFailed] {
            assert!(!Published.can_transition_to(next));
            assert!(!PublishedFailed.can_transition_to(next));
        }
    }

    #[test]
    fn nothing_reenters_not_published() {
        assert!(!NotPublished.can_transition_to(NotPublished));
        assert!(!InProgress.can_transition_to(NotPublished));
        assert!(NotPublished.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Published));
        assert!(InProgress.can_transition_to(PublishedFailed));
    }

    #[test]
    fn pending_must_pass_through_in_progress() {
        assert!(!NotPublished.can_transition_to(Published));
        assert!(!NotPublished.can_transition_to(PublishedFailed));
    }

    #[test]
    fn persisted_codes_are_stable() {
        for state in [NotPublished, InProgress, Published, PublishedFailed] {
            assert_eq!(EventState::from_i16(state.as_i16()), Some(state));
        }
        assert_eq!(EventState::from_i16(9), None);
    }
}
