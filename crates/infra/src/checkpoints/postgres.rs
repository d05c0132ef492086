//! Postgres-backed ledger.
//!
//! Uniqueness of (event_id, rsvp_id, checkpoint_type) is enforced by the
//! table constraint; `INSERT ... ON CONFLICT DO NOTHING` turns a duplicate
//! scan into zero affected rows instead of an error.
//!
//! ## Error Mapping
//!
//! | SQLx Error | LedgerError |
//! |------------|-------------|
//! | Database (any code) | `Storage` |
//! | PoolClosed | `Storage` |
//! | Other | `Storage` |
//!
//! Missing events and RSVPs are detected by explicit lookups, never by
//! interpreting database errors.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use eventdesk_checkpoints::{
    CheckpointScan, CheckpointStats, CheckpointType, EventRecord, HistoryPage, HistoryQuery,
    RecordOutcome, Rsvp,
};
use eventdesk_core::{EventId, OperatorId, RsvpId};

use super::{CheckpointLedger, LedgerError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id       UUID PRIMARY KEY,
        capacity INTEGER NOT NULL DEFAULT 0 CHECK (capacity >= 0)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rsvps (
        id            UUID PRIMARY KEY,
        event_id      UUID NOT NULL REFERENCES events (id) ON DELETE CASCADE,
        checked_in    BOOLEAN NOT NULL DEFAULT FALSE,
        checked_in_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS checkpoint_scans (
        id              BIGSERIAL PRIMARY KEY,
        event_id        UUID NOT NULL,
        rsvp_id         UUID NOT NULL REFERENCES rsvps (id) ON DELETE CASCADE,
        checkpoint_type TEXT NOT NULL CHECK (checkpoint_type IN ('entry', 'refreshment', 'swag')),
        scanned_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        scanned_by      TEXT NOT NULL,
        UNIQUE (event_id, rsvp_id, checkpoint_type)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS checkpoint_scans_event_recent
        ON checkpoint_scans (event_id, scanned_at DESC, id DESC)
    "#,
];

#[derive(Debug, Clone)]
pub struct PostgresCheckpointLedger {
    pool: Arc<PgPool>,
}

impl PostgresCheckpointLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    pub async fn upsert_event(&self, event: EventRecord) -> Result<(), LedgerError> {
        let capacity = i32::try_from(event.capacity)
            .map_err(|_| LedgerError::Storage(format!("capacity {} out of range", event.capacity)))?;
        sqlx::query(
            r#"
            INSERT INTO events (id, capacity) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET capacity = EXCLUDED.capacity
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(capacity)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_event", e))?;
        Ok(())
    }

    pub async fn upsert_rsvp(&self, rsvp: Rsvp) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO rsvps (id, event_id, checked_in, checked_in_at) VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET event_id = EXCLUDED.event_id,
                checked_in = EXCLUDED.checked_in,
                checked_in_at = EXCLUDED.checked_in_at
            "#,
        )
        .bind(rsvp.id.as_uuid())
        .bind(rsvp.event_id.as_uuid())
        .bind(rsvp.checked_in)
        .bind(rsvp.checked_in_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_rsvp", e))?;
        Ok(())
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'_, Postgres>, LedgerError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }

    async fn require_event(&self, event_id: EventId) -> Result<u32, LedgerError> {
        let row = sqlx::query("SELECT capacity FROM events WHERE id = $1")
            .bind(event_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("require_event", e))?
            .ok_or(LedgerError::EventNotFound(event_id))?;
        let capacity: i32 = row
            .try_get("capacity")
            .map_err(|e| map_sqlx_error("require_event", e))?;
        Ok(u32::try_from(capacity).unwrap_or(0))
    }
}

#[async_trait]
impl CheckpointLedger for PostgresCheckpointLedger {
    #[instrument(
        skip(self, operator),
        fields(event_id = %event_id, rsvp_id = %rsvp_id, checkpoint = checkpoint_type.as_str()),
        err
    )]
    async fn record_scan(
        &self,
        event_id: EventId,
        rsvp_id: RsvpId,
        checkpoint_type: CheckpointType,
        operator: &OperatorId,
    ) -> Result<RecordOutcome, LedgerError> {
        let now = Utc::now();
        let mut tx = self.begin("record_scan").await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO checkpoint_scans (event_id, rsvp_id, checkpoint_type, scanned_at, scanned_by)
            SELECT r.event_id, r.id, $3, $4, $5
            FROM rsvps r
            WHERE r.id = $2 AND r.event_id = $1
            ON CONFLICT (event_id, rsvp_id, checkpoint_type) DO NOTHING
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(rsvp_id.as_uuid())
        .bind(checkpoint_type.as_str())
        .bind(now)
        .bind(operator.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("record_scan", e))?
        .rows_affected();

        if inserted == 0 {
            let exists = sqlx::query("SELECT 1 FROM rsvps WHERE id = $1 AND event_id = $2")
                .bind(rsvp_id.as_uuid())
                .bind(event_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("record_scan", e))?
                .is_some();
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("record_scan", e))?;
            if !exists {
                return Err(LedgerError::RsvpNotFound { event_id, rsvp_id });
            }
            return Ok(RecordOutcome { created: false });
        }

        if checkpoint_type == CheckpointType::Entry {
            sqlx::query(
                r#"
                UPDATE rsvps
                SET checked_in = TRUE, checked_in_at = COALESCE(checked_in_at, $2)
                WHERE id = $1
                "#,
            )
            .bind(rsvp_id.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("record_scan", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("record_scan", e))?;
        Ok(RecordOutcome { created: true })
    }

    #[instrument(
        skip(self),
        fields(event_id = %event_id, rsvp_id = %rsvp_id, checkpoint = checkpoint_type.as_str()),
        err
    )]
    async fn delete_scan(
        &self,
        rsvp_id: RsvpId,
        event_id: EventId,
        checkpoint_type: CheckpointType,
    ) -> Result<bool, LedgerError> {
        let mut tx = self.begin("delete_scan").await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM checkpoint_scans
            WHERE event_id = $1 AND rsvp_id = $2 AND checkpoint_type = $3
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(rsvp_id.as_uuid())
        .bind(checkpoint_type.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete_scan", e))?
        .rows_affected();

        if checkpoint_type == CheckpointType::Entry {
            sqlx::query(
                r#"
                UPDATE rsvps SET checked_in = FALSE, checked_in_at = NULL
                WHERE id = $1 AND event_id = $2
                "#,
            )
            .bind(rsvp_id.as_uuid())
            .bind(event_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_scan", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("delete_scan", e))?;
        Ok(deleted > 0)
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn stats(&self, event_id: EventId) -> Result<CheckpointStats, LedgerError> {
        let capacity = self.require_event(event_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT checkpoint_type, COUNT(*) AS count
            FROM checkpoint_scans
            WHERE event_id = $1
            GROUP BY checkpoint_type
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("checkpoint_type").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("stats", e))?;
            let kind: CheckpointType = kind
                .parse()
                .map_err(|e| LedgerError::Storage(format!("unknown checkpoint type in store: {e}")))?;
            counts.push((kind, u64::try_from(count).unwrap_or(0)));
        }

        Ok(CheckpointStats::from_counts(capacity, counts))
    }

    #[instrument(skip(self, query), fields(event_id = %event_id, limit = query.limit, offset = query.offset), err)]
    async fn history(
        &self,
        event_id: EventId,
        query: &HistoryQuery,
    ) -> Result<HistoryPage, LedgerError> {
        self.require_event(event_id).await?;
        let kind = query.checkpoint_type.map(|t| t.as_str());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM checkpoint_scans
            WHERE event_id = $1 AND ($2::text IS NULL OR checkpoint_type = $2)
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(kind)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("history", e))?;

        let rows = sqlx::query(
            r#"
            SELECT event_id, rsvp_id, checkpoint_type, scanned_at, scanned_by
            FROM checkpoint_scans
            WHERE event_id = $1 AND ($2::text IS NULL OR checkpoint_type = $2)
            ORDER BY scanned_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(kind)
        .bind(i64::from(query.limit))
        .bind(i64::from(query.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("history", e))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let scan = ScanRow::from_row(row).map_err(|e| map_sqlx_error("history", e))?;
            items.push(scan.try_into()?);
        }

        Ok(HistoryPage::new(items, u64::try_from(total).unwrap_or(0), query))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            LedgerError::Storage(format!(
                "database error in {} ({}): {}",
                operation,
                code,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Storage(format!("connection pool closed in {}", operation))
        }
        other => LedgerError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}

#[derive(Debug)]
struct ScanRow {
    event_id: uuid::Uuid,
    rsvp_id: uuid::Uuid,
    checkpoint_type: String,
    scanned_at: DateTime<Utc>,
    scanned_by: String,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ScanRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ScanRow {
            event_id: row.try_get("event_id")?,
            rsvp_id: row.try_get("rsvp_id")?,
            checkpoint_type: row.try_get("checkpoint_type")?,
            scanned_at: row.try_get("scanned_at")?,
            scanned_by: row.try_get("scanned_by")?,
        })
    }
}

impl TryFrom<ScanRow> for CheckpointScan {
    type Error = LedgerError;

    fn try_from(row: ScanRow) -> Result<Self, Self::Error> {
        let checkpoint_type = row
            .checkpoint_type
            .parse()
            .map_err(|e| LedgerError::Storage(format!("unknown checkpoint type in store: {e}")))?;
        let scanned_by = OperatorId::new(row.scanned_by)
            .map_err(|e| LedgerError::Storage(format!("bad operator id in store: {e}")))?;
        Ok(CheckpointScan {
            event_id: EventId::from_uuid(row.event_id),
            rsvp_id: RsvpId::from_uuid(row.rsvp_id),
            checkpoint_type,
            scanned_at: row.scanned_at,
            scanned_by,
        })
    }
}
