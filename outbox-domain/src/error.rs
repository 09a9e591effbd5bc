//! Outbox 统一错误定义
//!
//! 覆盖存储（瞬时/非瞬时故障、提交失败）、载荷还原（类型解析与反序列化）、
//! 状态流转与事件总线等最小必要集合，各实现层统一转换为 `OutboxError`。
//!
use thiserror::Error;
use uuid::Uuid;

use crate::event_log::EventState;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum OutboxError {
    // --- 存储 ---
    /// 可重试的存储故障（序列化冲突、连接抖动等），由工作单元的重试策略自动重放
    #[error("transient storage fault: {reason}")]
    TransientStorage { reason: String },
    #[error("commit failed: {reason}")]
    CommitFailed { reason: String },
    #[error("storage error: {reason}")]
    Storage { reason: String },
    #[error("not found: {reason}")]
    NotFound { reason: String },

    // --- 事务与状态 ---
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },
    #[error("invalid transition: event={event_id}, from={from:?}, to={to:?}")]
    InvalidTransition {
        event_id: Uuid,
        from: EventState,
        to: EventState,
    },
    #[error("operation cancelled")]
    Cancelled,

    // --- 载荷还原 ---
    #[error("type resolution failed: tag={tag}, matches={matches}")]
    TypeResolution { tag: String, matches: usize },
    #[error("deserialization failed: type={type_name}, reason={source}")]
    Deserialization {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    // --- 事件分发 ---
    #[error("event bus error: {reason}")]
    EventBus { reason: String },
}

impl OutboxError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientStorage {
            reason: reason.into(),
        }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound {
            reason: reason.into(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    pub fn event_bus(reason: impl Into<String>) -> Self {
        Self::EventBus {
            reason: reason.into(),
        }
    }

    /// 是否为可由重试策略透明处理的瞬时故障
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStorage { .. })
    }
}

/// 统一 Result 类型别名
pub type OutboxResult<T> = Result<T, OutboxError>;

// ---- Cross-crate conversions for infrastructure convenience ----
// 基础设施层可直接使用 `?` 将 sqlx 错误转换为 OutboxError，并区分瞬时故障

#[cfg(feature = "infra-sqlx")]
impl From<sqlx::Error> for OutboxError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => OutboxError::not_found("row not found"),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => OutboxError::transient(err.to_string()),
            sqlx::Error::Database(ref db) if is_transient_sqlstate(db.code().as_deref()) => {
                OutboxError::transient(err.to_string())
            }
            other => OutboxError::storage(other.to_string()),
        }
    }
}

// 40001 serialization_failure / 40P01 deadlock_detected
#[cfg(feature = "infra-sqlx")]
fn is_transient_sqlstate(code: Option<&str>) -> bool {
    matches!(code, Some("40001") | Some("40P01"))
}
