use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use slipcheck_core::{FailureRecord, JobId, JobStatus, VerificationResult};
use slipcheck_queue::{ResultRow, ResultSink, SinkError};

use crate::StoreError;

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS slip_jobs (
            id TEXT PRIMARY KEY,
            file_key TEXT,
            status TEXT NOT NULL,
            extracted_text TEXT,
            confidence REAL,
            result_json TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_slip_jobs_status ON slip_jobs(status)")
        .execute(pool)
        .await?;

    Ok(())
}

/// One row of `slip_jobs` as seen by a status poller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub file_key: Option<String>,
    pub status: JobStatus,
    pub extracted_text: Option<String>,
    pub confidence: Option<f32>,
    pub result: Option<VerificationResult>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

type JobRow = (
    String,
    Option<String>,
    String,
    Option<String>,
    Option<f64>,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn parse_timestamp(id: &JobId, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt { id: id.clone(), reason: e.to_string() })
}

impl JobRecord {
    fn from_row(r: JobRow) -> Result<Self, StoreError> {
        let id = JobId::new(r.0);
        let status = JobStatus::from_str(&r.2)
            .map_err(|reason| StoreError::Corrupt { id: id.clone(), reason })?;
        let result = r
            .5
            .as_deref()
            .map(serde_json::from_str::<VerificationResult>)
            .transpose()
            .map_err(|e| StoreError::Corrupt { id: id.clone(), reason: e.to_string() })?;
        let created_at = parse_timestamp(&id, &r.7)?;
        let updated_at = parse_timestamp(&id, &r.8)?;
        Ok(Self {
            file_key: r.1,
            status,
            extracted_text: r.3,
            confidence: r.4.map(|c| c as f32),
            result,
            error_message: r.6,
            created_at,
            updated_at,
            id,
        })
    }
}

/// SQLite-backed job table. Every write is scoped to a single job id.
#[derive(Debug, Clone)]
pub struct SqliteResultStore {
    pool: DbPool,
}

impl SqliteResultStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self { pool: create_db(path).await? })
    }

    /// Insert the `queued` row a job is tracked under before it is enqueued.
    pub async fn reserve_job(&self, id: &JobId, file_key: Option<&str>) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let inserted = sqlx::query(
            "INSERT INTO slip_jobs (id, file_key, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.as_str())
        .bind(file_key)
        .bind(JobStatus::Queued.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::AlreadyReserved(id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT id, file_key, status, extracted_text, confidence, result_json, error_message, created_at, updated_at FROM slip_jobs WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRecord::from_row).transpose()
    }

    pub async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT id, file_key, status, extracted_text, confidence, result_json, error_message, created_at, updated_at FROM slip_jobs WHERE status = ? ORDER BY created_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRecord::from_row).collect()
    }

    fn check_updated(id: &JobId, rows_affected: u64) -> Result<(), SinkError> {
        if rows_affected == 0 {
            return Err(SinkError::UnknownJob(id.clone()));
        }
        Ok(())
    }
}

fn backend(e: sqlx::Error) -> SinkError {
    SinkError::Backend(e.to_string())
}

#[async_trait]
impl ResultSink for SqliteResultStore {
    async fn mark_processing(&self, id: &JobId) -> Result<(), SinkError> {
        let done = sqlx::query("UPDATE slip_jobs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(JobStatus::Processing.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Self::check_updated(id, done.rows_affected())
    }

    async fn record_result(&self, id: &JobId, row: ResultRow) -> Result<(), SinkError> {
        let done = sqlx::query(
            "UPDATE slip_jobs SET status = ?, extracted_text = ?, confidence = ?, result_json = ?, error_message = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(row.status.as_str())
        .bind(&row.extracted_text)
        .bind(f64::from(row.confidence))
        .bind(&row.result_json)
        .bind(row.timestamp.to_rfc3339())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Self::check_updated(id, done.rows_affected())
    }

    async fn record_failure(&self, id: &JobId, failure: FailureRecord) -> Result<(), SinkError> {
        let done = sqlx::query(
            "UPDATE slip_jobs SET status = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(&failure.error_message)
        .bind(failure.failed_at.to_rfc3339())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Self::check_updated(id, done.rows_affected())
    }
}
