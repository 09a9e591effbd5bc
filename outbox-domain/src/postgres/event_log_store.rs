use super::{PgFailedMessageChainStore, PgTransaction, limit};
use crate::{
    error::{OutboxError, OutboxResult as Result},
    event_log::{EventState, IntegrationEventLogEntry, IntegrationEventLogStore},
    failed_chain::FailedMessageChainStore,
};
use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

const SELECT_COLUMNS: &str =
    "event_id, event_type_name, entity_id, content, state, times_sent, creation_time";

#[derive(Clone)]
pub struct PgEventLogStore {
    pool: PgPool,
    chains: PgFailedMessageChainStore,
}

impl PgEventLogStore {
    pub fn new(pool: PgPool) -> Self {
        let chains = PgFailedMessageChainStore::new(pool.clone());
        Self { pool, chains }
    }

    pub fn with_chain_store(mut self, chains: PgFailedMessageChainStore) -> Self {
        self.chains = chains;
        self
    }
}

fn state_from_code(code: i16) -> Result<EventState> {
    EventState::from_i16(code)
        .ok_or_else(|| OutboxError::storage(format!("unknown event state code: {code}")))
}

fn entry_from_row(row: &PgRow) -> Result<IntegrationEventLogEntry> {
    Ok(IntegrationEventLogEntry::builder()
        .event_id(row.try_get("event_id")?)
        .event_type_name(row.try_get("event_type_name")?)
        .entity_id(row.try_get("entity_id")?)
        .content(row.try_get("content")?)
        .state(state_from_code(row.try_get("state")?)?)
        .times_sent(row.try_get("times_sent")?)
        .creation_time(row.try_get("creation_time")?)
        .build())
}

#[async_trait]
impl IntegrationEventLogStore for PgEventLogStore {
    type Transaction = PgTransaction;

    async fn retrieve_pending_event_logs(
        &self,
        batch_size: usize,
    ) -> Result<Vec<IntegrationEventLogEntry>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM integration_event_logs \
             WHERE state = $1 ORDER BY creation_time, event_id LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(EventState::NotPublished.as_i16())
            .bind(limit(batch_size))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn insert_entry(
        &self,
        tx: &mut Self::Transaction,
        entry: IntegrationEventLogEntry,
    ) -> Result<IntegrationEventLogEntry> {
        sqlx::query(
            r#"
            INSERT INTO integration_event_logs
                (event_id, event_type_name, entity_id, content, state, times_sent, creation_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.event_id())
        .bind(entry.event_type_name())
        .bind(entry.entity_id())
        .bind(entry.content())
        .bind(entry.state().as_i16())
        .bind(entry.times_sent())
        .bind(entry.creation_time())
        .execute(&mut **tx)
        .await?;
        Ok(entry)
    }

    async fn update_event_state(&self, event_id: Uuid, state: EventState) -> Result<()> {
        // 与 EventState::can_transition_to 一致：NotPublished 只能进入 InProgress，
        // 终态不再流转，任何状态都不能回到 NotPublished
        let result = sqlx::query(
            r#"
            UPDATE integration_event_logs
            SET state = $2,
                times_sent = times_sent + CASE WHEN $2 = $3 THEN 1 ELSE 0 END
            WHERE event_id = $1
              AND state NOT IN ($4, $5)
              AND $2 <> $6
              AND (state <> $6 OR $2 = $3)
            "#,
        )
        .bind(event_id)
        .bind(state.as_i16())
        .bind(EventState::InProgress.as_i16())
        .bind(EventState::Published.as_i16())
        .bind(EventState::PublishedFailed.as_i16())
        .bind(EventState::NotPublished.as_i16())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let current: Option<i16> =
            sqlx::query_scalar("SELECT state FROM integration_event_logs WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        match current {
            None => Err(OutboxError::not_found(format!(
                "event log: event_id={event_id}"
            ))),
            Some(code) => Err(OutboxError::InvalidTransition {
                event_id,
                from: state_from_code(code)?,
                to: state,
            }),
        }
    }

    async fn find_event_log(&self, event_id: Uuid) -> Result<Option<IntegrationEventLogEntry>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM integration_event_logs WHERE event_id = $1");
        let row = sqlx::query(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    fn failed_message_chains(&self) -> &dyn FailedMessageChainStore {
        &self.chains
    }
}
