use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use super::item::{OutboxItem, OutboxItemMetadata};
use super::queue::OutboxQueue;
use crate::error::OutboxError;

// ============================================================================
// PostgreSQL Outbox Queue
// ============================================================================
//
// Rows live in `outbox_items`, ordered by a BIGSERIAL sequence. Dequeue is a
// claim-and-delete inside the dispatcher's transaction:
//
//   DELETE ... WHERE seq IN (SELECT ... FOR UPDATE SKIP LOCKED) RETURNING ...
//
// Concurrent dispatchers skip rows another transaction holds; a rollback (or
// a crashed process whose connection drops) makes the rows pending again.
//
// ============================================================================

pub const CREATE_OUTBOX_TABLE: &str = "CREATE TABLE IF NOT EXISTS outbox_items (
    seq BIGSERIAL PRIMARY KEY,
    id UUID NOT NULL UNIQUE,
    content BYTEA NOT NULL,
    message_type TEXT NOT NULL,
    type_identity TEXT NOT NULL,
    session_id TEXT NULL,
    created_on TIMESTAMPTZ NOT NULL,
    enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

const INSERT_ITEM: &str = "INSERT INTO outbox_items (
    id, content, message_type, type_identity, session_id, created_on
) VALUES ($1, $2, $3, $4, $5, $6)";

const CLAIM_PENDING: &str = "DELETE FROM outbox_items
    WHERE seq IN (
        SELECT seq FROM outbox_items
        ORDER BY seq ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    )
    RETURNING seq, id, content, message_type, type_identity, session_id, created_on";

const COUNT_PENDING: &str = "SELECT COUNT(*) FROM outbox_items";

pub struct PgOutboxQueue {
    pool: PgPool,
    /// `None` claims everything pending.
    dequeue_limit: Option<i64>,
}

impl PgOutboxQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            dequeue_limit: None,
        }
    }

    pub fn with_dequeue_limit(mut self, limit: i64) -> Self {
        self.dequeue_limit = Some(limit);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), OutboxError> {
        sqlx::query(CREATE_OUTBOX_TABLE).execute(&self.pool).await?;
        tracing::info!("✅ Outbox table ready");
        Ok(())
    }
}

fn item_from_row(row: &PgRow) -> Result<(i64, OutboxItem), sqlx::Error> {
    let sequence: i64 = row.try_get("seq")?;
    let item = OutboxItem {
        id: row.try_get::<Uuid, _>("id")?,
        content: row.try_get::<Vec<u8>, _>("content")?,
        metadata: OutboxItemMetadata {
            message_type: row.try_get("message_type")?,
            session_id: row.try_get("session_id")?,
            created_on: row.try_get::<DateTime<Utc>, _>("created_on")?,
            type_identity: row.try_get("type_identity")?,
        },
    };
    Ok((sequence, item))
}

#[async_trait]
impl OutboxQueue for PgOutboxQueue {
    type Transaction = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Transaction, OutboxError> {
        Ok(self.pool.begin().await?)
    }

    async fn enqueue(&self, tx: &mut Self::Transaction, items: Vec<OutboxItem>) -> Result<(), OutboxError> {
        for item in &items {
            sqlx::query(INSERT_ITEM)
                .bind(item.id)
                .bind(&item.content)
                .bind(&item.metadata.message_type)
                .bind(&item.metadata.type_identity)
                .bind(&item.metadata.session_id)
                .bind(item.metadata.created_on)
                .execute(&mut **tx)
                .await?;
        }

        tracing::debug!(count = items.len(), "Staged outbox items");
        Ok(())
    }

    async fn dequeue(&self, tx: &mut Self::Transaction) -> Result<Vec<OutboxItem>, OutboxError> {
        let rows = sqlx::query(CLAIM_PENDING)
            .bind(self.dequeue_limit)
            .fetch_all(&mut **tx)
            .await?;

        // RETURNING does not guarantee order
        let mut claimed = rows
            .iter()
            .map(item_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|(sequence, _)| *sequence);

        Ok(claimed.into_iter().map(|(_, item)| item).collect())
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), OutboxError> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), OutboxError> {
        tx.rollback().await?;
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64, OutboxError> {
        let row = sqlx::query(COUNT_PENDING).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }
}
