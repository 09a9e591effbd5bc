use super::{commit_error, limit};
use crate::{
    error::{OutboxError, OutboxResult as Result},
    event_log::normalize_entity_id,
    failed_chain::{
        ChainClaim, FailedMessage, FailedMessageChain, FailedMessageChainStore, FailureDetails,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use std::time::Duration;

const CHAIN_COLUMNS: &str = "id, entity_id, creation_time, should_republish, claimed_at";
const MESSAGE_COLUMNS: &str =
    "id, chain_id, creation_time, body, event_type_short_name, should_skip, message, stack_trace";

#[derive(Clone)]
pub struct PgFailedMessageChainStore {
    pool: PgPool,
    default_should_republish: bool,
}

impl PgFailedMessageChainStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            default_should_republish: false,
        }
    }

    pub fn with_default_should_republish(mut self, should_republish: bool) -> Self {
        self.default_should_republish = should_republish;
        self
    }
}

fn chain_from_row(row: &PgRow) -> Result<FailedMessageChain> {
    Ok(FailedMessageChain::builder()
        .id(row.try_get("id")?)
        .entity_id(row.try_get("entity_id")?)
        .creation_time(row.try_get("creation_time")?)
        .should_republish(row.try_get("should_republish")?)
        .maybe_claimed_at(row.try_get("claimed_at")?)
        .build())
}

fn message_from_row(row: &PgRow) -> Result<FailedMessage> {
    Ok(FailedMessage::builder()
        .id(row.try_get("id")?)
        .chain_id(row.try_get("chain_id")?)
        .creation_time(row.try_get("creation_time")?)
        .body(row.try_get("body")?)
        .event_type_short_name(row.try_get("event_type_short_name")?)
        .should_skip(row.try_get("should_skip")?)
        .maybe_message(row.try_get("message")?)
        .maybe_stack_trace(row.try_get("stack_trace")?)
        .build())
}

/// 为一组链装载消息（按消息主键升序），保持链的原有顺序
async fn attach_messages(
    conn: &mut PgConnection,
    chains: Vec<FailedMessageChain>,
) -> Result<Vec<FailedMessageChain>> {
    if chains.is_empty() {
        return Ok(chains);
    }

    let ids: Vec<i64> = chains.iter().map(FailedMessageChain::id).collect();
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM failed_messages WHERE chain_id = ANY($1) ORDER BY id"
    );
    let rows = sqlx::query(&sql).bind(&ids).fetch_all(&mut *conn).await?;
    let mut messages = rows
        .iter()
        .map(message_from_row)
        .collect::<Result<Vec<_>>>()?;

    Ok(chains
        .into_iter()
        .map(|chain| {
            let (own, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut messages)
                .into_iter()
                .partition(|m| m.chain_id() == chain.id());
            messages = rest;
            chain.with_failed_messages(own)
        })
        .collect())
}

/// 先删消息再删链；返回被删除的链数
async fn delete_chains(conn: &mut PgConnection, ids: &[i64]) -> Result<u64> {
    sqlx::query("DELETE FROM failed_messages WHERE chain_id = ANY($1)")
        .bind(ids)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM failed_message_chains WHERE id = ANY($1)")
        .bind(ids)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

fn sort_oldest_first(chains: &mut [FailedMessageChain]) {
    chains.sort_by_key(|c| (c.creation_time(), c.id()));
}

fn not_found_chain(chain_id: i64) -> OutboxError {
    OutboxError::not_found(format!("failed message chain: id={chain_id}"))
}

#[async_trait]
impl FailedMessageChainStore for PgFailedMessageChainStore {
    async fn exists(&self, entity_id: Option<&str>) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM failed_message_chains WHERE entity_id = $1)",
        )
        .bind(normalize_entity_id(entity_id))
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn append(
        &self,
        entity_id: Option<&str>,
        event_type_short_name: &str,
        body: &str,
        failure: Option<&FailureDetails>,
    ) -> Result<()> {
        let key = normalize_entity_id(entity_id);
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // 唯一约束保证并发追加只产生一条链
        let chain_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO failed_message_chains (entity_id, creation_time, should_republish)
            VALUES ($1, $2, $3)
            ON CONFLICT (entity_id) DO UPDATE SET entity_id = EXCLUDED.entity_id
            RETURNING id
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(self.default_should_republish)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO failed_messages
                (chain_id, creation_time, body, event_type_short_name, should_skip, message, stack_trace)
            VALUES ($1, $2, $3, $4, FALSE, $5, $6)
            "#,
        )
        .bind(chain_id)
        .bind(now)
        .bind(body)
        .bind(event_type_short_name)
        .bind(failure.map(FailureDetails::message))
        .bind(failure.and_then(FailureDetails::stack_trace))
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(commit_error)?;
        tracing::debug!(
            entity_id = key,
            chain_id,
            event_type = event_type_short_name,
            "appended to failed message chain"
        );
        Ok(())
    }

    async fn retrieve_chains_to_republish(
        &self,
        chain_batch_size: usize,
    ) -> Result<Vec<FailedMessageChain>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {CHAIN_COLUMNS} FROM failed_message_chains \
             WHERE should_republish AND claimed_at IS NULL \
             ORDER BY creation_time, id LIMIT $1 FOR UPDATE SKIP LOCKED"
        );
        let rows = sqlx::query(&sql)
            .bind(limit(chain_batch_size))
            .fetch_all(&mut *tx)
            .await?;
        let chains = rows
            .iter()
            .map(chain_from_row)
            .collect::<Result<Vec<_>>>()?;
        let chains = attach_messages(&mut tx, chains).await?;

        let ids: Vec<i64> = chains.iter().map(FailedMessageChain::id).collect();
        if !ids.is_empty() {
            delete_chains(&mut tx, &ids).await?;
        }
        tx.commit().await.map_err(commit_error)?;
        Ok(chains)
    }

    async fn claim_chains_to_republish(
        &self,
        chain_batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<FailedMessageChain>> {
        let now = Utc::now();
        let expired_before = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "UPDATE failed_message_chains SET claimed_at = $2 \
             WHERE id IN ( \
                 SELECT id FROM failed_message_chains \
                 WHERE should_republish AND (claimed_at IS NULL OR claimed_at <= $3) \
                 ORDER BY creation_time, id LIMIT $1 FOR UPDATE SKIP LOCKED \
             ) RETURNING {CHAIN_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(limit(chain_batch_size))
            .bind(now)
            .bind(expired_before)
            .fetch_all(&mut *tx)
            .await?;
        let mut chains = rows
            .iter()
            .map(chain_from_row)
            .collect::<Result<Vec<_>>>()?;
        sort_oldest_first(&mut chains);
        let chains = attach_messages(&mut tx, chains).await?;

        tx.commit().await.map_err(commit_error)?;
        Ok(chains)
    }

    async fn complete_republish(&self, claims: &[ChainClaim]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for claim in claims {
            // 锁住链行，与 append 的 upsert 串行
            let locked: Option<i64> =
                sqlx::query_scalar("SELECT id FROM failed_message_chains WHERE id = $1 FOR UPDATE")
                    .bind(claim.chain_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if locked.is_none() {
                return Err(not_found_chain(claim.chain_id));
            }

            sqlx::query("DELETE FROM failed_messages WHERE chain_id = $1 AND id = ANY($2)")
                .bind(claim.chain_id)
                .bind(claim.message_ids.as_slice())
                .execute(&mut *tx)
                .await?;
            let deleted = sqlx::query(
                "DELETE FROM failed_message_chains WHERE id = $1 \
                 AND NOT EXISTS (SELECT 1 FROM failed_messages WHERE chain_id = $1)",
            )
            .bind(claim.chain_id)
            .execute(&mut *tx)
            .await?;
            if deleted.rows_affected() == 0 {
                tracing::debug!(
                    chain_id = claim.chain_id,
                    "chain gained messages while claimed; kept for republish"
                );
                sqlx::query("UPDATE failed_message_chains SET claimed_at = NULL WHERE id = $1")
                    .bind(claim.chain_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await.map_err(commit_error)
    }

    async fn release_chain(&self, chain_id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE failed_message_chains SET claimed_at = NULL, should_republish = FALSE WHERE id = $1",
        )
        .bind(chain_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(not_found_chain(chain_id));
        }
        Ok(())
    }

    async fn set_should_republish(&self, entity_id: &str, should_republish: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE failed_message_chains SET should_republish = $2 WHERE entity_id = $1",
        )
        .bind(entity_id)
        .bind(should_republish)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::not_found(format!(
                "failed message chain: entity_id={entity_id}"
            )));
        }
        Ok(())
    }

    async fn set_should_skip(&self, message_id: i64, should_skip: bool) -> Result<()> {
        let result = sqlx::query("UPDATE failed_messages SET should_skip = $2 WHERE id = $1")
            .bind(message_id)
            .bind(should_skip)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::not_found(format!(
                "failed message: id={message_id}"
            )));
        }
        Ok(())
    }

    async fn find_chain(&self, entity_id: &str) -> Result<Option<FailedMessageChain>> {
        let mut conn = self.pool.acquire().await?;
        let sql = format!("SELECT {CHAIN_COLUMNS} FROM failed_message_chains WHERE entity_id = $1");
        let row = sqlx::query(&sql)
            .bind(entity_id)
            .fetch_optional(&mut *conn)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let chain = chain_from_row(&row)?;
        let mut chains = attach_messages(&mut conn, vec![chain]).await?;
        Ok(chains.pop())
    }
}
