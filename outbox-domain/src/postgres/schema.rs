//! Outbox 表结构
//!
//! - `integration_event_logs`：事件信封，主键 `event_id`；
//! - `failed_message_chains`：按实体分组的失败链，`entity_id` 唯一；
//! - `failed_messages`：死信消息，外键 `chain_id` 级联删除。
//!
use crate::error::OutboxResult;
use sqlx::PgPool;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS integration_event_logs (
    event_id        UUID PRIMARY KEY,
    event_type_name TEXT        NOT NULL,
    entity_id       TEXT        NOT NULL,
    content         TEXT        NOT NULL,
    state           SMALLINT    NOT NULL DEFAULT 0,
    times_sent      INTEGER     NOT NULL DEFAULT 0,
    creation_time   TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS ix_integration_event_logs_pending
    ON integration_event_logs (creation_time, event_id)
    WHERE state = 0;

CREATE TABLE IF NOT EXISTS failed_message_chains (
    id               BIGSERIAL PRIMARY KEY,
    entity_id        TEXT        NOT NULL UNIQUE,
    creation_time    TIMESTAMPTZ NOT NULL,
    should_republish BOOLEAN     NOT NULL DEFAULT FALSE,
    claimed_at       TIMESTAMPTZ NULL
);

CREATE TABLE IF NOT EXISTS failed_messages (
    id                    BIGSERIAL PRIMARY KEY,
    chain_id              BIGINT      NOT NULL REFERENCES failed_message_chains (id) ON DELETE CASCADE,
    creation_time         TIMESTAMPTZ NOT NULL,
    body                  TEXT        NOT NULL,
    event_type_short_name TEXT        NOT NULL,
    should_skip           BOOLEAN     NOT NULL DEFAULT FALSE,
    message               TEXT        NULL,
    stack_trace           TEXT        NULL
);

CREATE INDEX IF NOT EXISTS ix_failed_messages_chain_id ON failed_messages (chain_id, id);
"#;

/// 幂等建表
pub async fn migrate(pool: &PgPool) -> OutboxResult<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    tracing::info!("outbox schema is up to date");
    Ok(())
}
