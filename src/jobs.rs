//! Job status store
//!
//! One record per export job, keyed by job id. Only the export worker writes;
//! callers poll through [`JobStatusStore::get`]. A job with no record yet is
//! still queued, so `get` reports it as not found rather than zero progress.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(JobStatus::Running),
            "complete" => Some(JobStatus::Complete),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

/// What a poller sees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(skip)]
    pub job_id: String,
    pub status: JobStatus,
    pub rows_processed: u64,
    pub presigned_url: Option<String>,
    /// Epoch seconds after which the record may be reclaimed
    #[serde(skip)]
    pub expire_at: Option<i64>,
}

impl JobRecord {
    fn running(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Running,
            rows_processed: 0,
            presigned_url: None,
            expire_at: None,
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }
}

#[async_trait]
pub trait JobStatusStore: Send + Sync {
    async fn mark_running(&self, job_id: &str) -> Result<()>;

    /// Raise `rows_processed` to `rows`; never lowers it
    async fn record_progress(&self, job_id: &str, rows: u64) -> Result<()>;

    async fn mark_complete(
        &self,
        job_id: &str,
        rows: u64,
        presigned_url: &str,
        expire_at: i64,
    ) -> Result<()>;

    async fn mark_failed(&self, job_id: &str, expire_at: i64) -> Result<()>;

    /// Fails with `JobNotFound` when no live record exists
    async fn get(&self, job_id: &str) -> Result<JobRecord>;

    /// Drop records whose expiry has passed, returning how many went
    async fn purge_expired(&self, now: i64) -> Result<u64>;
}

fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Status store held in process memory
#[derive(Debug, Default, Clone)]
pub struct MemoryJobStore {
    records: Arc<RwLock<HashMap<String, JobRecord>>>,
    history: Arc<RwLock<HashMap<String, Vec<u64>>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every progress value written for `job_id`, in order
    pub async fn progress_history(&self, job_id: &str) -> Vec<u64> {
        self.history
            .read()
            .await
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl JobStatusStore for MemoryJobStore {
    async fn mark_running(&self, job_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .entry(job_id.to_string())
            .or_insert_with(|| JobRecord::running(job_id));
        // redelivery may retry a failed export, never a completed one
        if record.status != JobStatus::Complete {
            record.status = JobStatus::Running;
            record.expire_at = None;
        }
        Ok(())
    }

    async fn record_progress(&self, job_id: &str, rows: u64) -> Result<()> {
        {
            let mut records = self.records.write().await;
            let record = records
                .entry(job_id.to_string())
                .or_insert_with(|| JobRecord::running(job_id));
            record.rows_processed = record.rows_processed.max(rows);
        }
        self.history
            .write()
            .await
            .entry(job_id.to_string())
            .or_default()
            .push(rows);
        Ok(())
    }

    async fn mark_complete(
        &self,
        job_id: &str,
        rows: u64,
        presigned_url: &str,
        expire_at: i64,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .entry(job_id.to_string())
            .or_insert_with(|| JobRecord::running(job_id));
        record.status = JobStatus::Complete;
        record.rows_processed = record.rows_processed.max(rows);
        record.presigned_url = Some(presigned_url.to_string());
        record.expire_at = Some(expire_at);
        Ok(())
    }

    async fn mark_failed(&self, job_id: &str, expire_at: i64) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .entry(job_id.to_string())
            .or_insert_with(|| JobRecord::running(job_id));
        // a completed export stays complete on redelivery
        if record.status != JobStatus::Complete {
            record.status = JobStatus::Failed;
            record.presigned_url = None;
            record.expire_at = Some(expire_at);
        }
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<JobRecord> {
        let now = now_epoch();
        self.records
            .read()
            .await
            .get(job_id)
            .filter(|r| !r.is_expired(now))
            .cloned()
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }

    async fn purge_expired(&self, now: i64) -> Result<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        self.history
            .write()
            .await
            .retain(|job_id, _| records.contains_key(job_id));
        Ok((before - records.len()) as u64)
    }
}

/// Status store backed by the `export_jobs` table
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS export_jobs (
    job_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    rows_processed BIGINT NOT NULL DEFAULT 0,
    presigned_url TEXT,
    expire_at BIGINT,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        debug!("export_jobs table ready");
        Ok(())
    }
}

fn to_db_rows(rows: u64) -> i64 {
    i64::try_from(rows).unwrap_or(i64::MAX)
}

#[async_trait]
impl JobStatusStore for PgJobStore {
    async fn mark_running(&self, job_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO export_jobs (job_id, status) VALUES ($1, 'running')
             ON CONFLICT (job_id) DO UPDATE
             SET status = 'running', expire_at = NULL, updated_at = now()
             WHERE export_jobs.status <> 'complete'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_progress(&self, job_id: &str, rows: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO export_jobs (job_id, status, rows_processed) VALUES ($1, 'running', $2)
             ON CONFLICT (job_id) DO UPDATE
             SET rows_processed = GREATEST(export_jobs.rows_processed, EXCLUDED.rows_processed),
                 updated_at = now()",
        )
        .bind(job_id)
        .bind(to_db_rows(rows))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_complete(
        &self,
        job_id: &str,
        rows: u64,
        presigned_url: &str,
        expire_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO export_jobs (job_id, status, rows_processed, presigned_url, expire_at)
             VALUES ($1, 'complete', $2, $3, $4)
             ON CONFLICT (job_id) DO UPDATE
             SET status = 'complete',
                 rows_processed = GREATEST(export_jobs.rows_processed, EXCLUDED.rows_processed),
                 presigned_url = EXCLUDED.presigned_url,
                 expire_at = EXCLUDED.expire_at,
                 updated_at = now()",
        )
        .bind(job_id)
        .bind(to_db_rows(rows))
        .bind(presigned_url)
        .bind(expire_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, job_id: &str, expire_at: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO export_jobs (job_id, status, expire_at) VALUES ($1, 'failed', $2)
             ON CONFLICT (job_id) DO UPDATE
             SET status = 'failed', presigned_url = NULL, expire_at = EXCLUDED.expire_at,
                 updated_at = now()
             WHERE export_jobs.status <> 'complete'",
        )
        .bind(job_id)
        .bind(expire_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<JobRecord> {
        let row: Option<(String, i64, Option<String>, Option<i64>)> = sqlx::query_as(
            "SELECT status, rows_processed, presigned_url, expire_at FROM export_jobs
             WHERE job_id = $1 AND (expire_at IS NULL OR expire_at > $2)",
        )
        .bind(job_id)
        .bind(now_epoch())
        .fetch_optional(&self.pool)
        .await?;

        let (status, rows, presigned_url, expire_at) =
            row.ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        let status = JobStatus::parse(&status)
            .ok_or_else(|| Error::WorkerFailure(format!("unknown job status '{status}'")))?;
        Ok(JobRecord {
            job_id: job_id.to_string(),
            status,
            rows_processed: u64::try_from(rows).unwrap_or(0),
            presigned_url,
            expire_at,
        })
    }

    async fn purge_expired(&self, now: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM export_jobs WHERE expire_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
