//! Terminal job snapshots.
//!
//! The in-memory store forgets jobs after the retention window. When an
//! archive is configured the executor writes every terminal snapshot to it,
//! and `JobService::get_job_async` falls back to it on a registry miss.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::instrument;

use super::types::{Job, JobId};

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobArchiveError {
    #[error("archive storage error: {0}")]
    Storage(String),
    #[error("archived snapshot is corrupt: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait JobArchive: Send + Sync + std::fmt::Debug {
    /// Store (or replace) the snapshot of a finished job.
    async fn save(&self, job: &Job) -> Result<(), JobArchiveError>;

    async fn load(&self, job_id: JobId) -> Result<Option<Job>, JobArchiveError>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobArchive {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobArchive for InMemoryJobArchive {
    async fn save(&self, job: &Job) -> Result<(), JobArchiveError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Job>, JobArchiveError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }
}

/// Postgres archive: one jsonb row per job.
#[derive(Debug, Clone)]
pub struct PostgresJobArchive {
    pool: Arc<PgPool>,
}

impl PostgresJobArchive {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), JobArchiveError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_snapshots (
                job_id      UUID PRIMARY KEY,
                kind        TEXT NOT NULL,
                status      TEXT NOT NULL,
                snapshot    JSONB NOT NULL,
                finished_at TIMESTAMPTZ,
                archived_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobArchive for PostgresJobArchive {
    #[instrument(skip(self, job), fields(job_id = %job.id, status = job.status.as_str()), err)]
    async fn save(&self, job: &Job) -> Result<(), JobArchiveError> {
        let snapshot =
            serde_json::to_value(job).map_err(|e| JobArchiveError::Corrupt(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO job_snapshots (job_id, kind, status, snapshot, finished_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id) DO UPDATE
            SET status = EXCLUDED.status,
                snapshot = EXCLUDED.snapshot,
                finished_at = EXCLUDED.finished_at,
                archived_at = NOW()
            "#,
        )
        .bind(job.id.0)
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(snapshot)
        .bind(job.finished_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn load(&self, job_id: JobId) -> Result<Option<Job>, JobArchiveError> {
        let row = sqlx::query("SELECT snapshot FROM job_snapshots WHERE job_id = $1")
            .bind(job_id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let snapshot: serde_json::Value = row
            .try_get("snapshot")
            .map_err(|e| map_sqlx_error("load", e))?;
        let job = serde_json::from_value(snapshot)
            .map_err(|e| JobArchiveError::Corrupt(e.to_string()))?;
        Ok(Some(job))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobArchiveError {
    match err {
        sqlx::Error::Database(db_err) => JobArchiveError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobArchiveError::Storage(format!("connection pool closed in {}", operation))
        }
        other => JobArchiveError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}
