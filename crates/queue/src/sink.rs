use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use slipcheck_core::{FailureRecord, JobId, JobStatus, VerificationResult};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("No row reserved for job {0}")]
    UnknownJob(JobId),
    #[error("Failed to serialize result: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// The row written for a job that made it through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub extracted_text: String,
    pub confidence: f32,
    pub result_json: String,
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
}

impl ResultRow {
    pub fn from_result(result: &VerificationResult, status: JobStatus) -> Result<Self, SinkError> {
        Ok(Self {
            extracted_text: result.extracted_text.clone(),
            confidence: result.confidence,
            result_json: serde_json::to_string(result)?,
            status,
            timestamp: Utc::now(),
        })
    }
}

/// Row-level persistence for job outcomes. Every call touches only the row
/// keyed by `id`.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn mark_processing(&self, id: &JobId) -> Result<(), SinkError>;
    async fn record_result(&self, id: &JobId, row: ResultRow) -> Result<(), SinkError>;
    async fn record_failure(&self, id: &JobId, failure: FailureRecord) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoredOutcome {
    InProgress,
    Completed(ResultRow),
    Failed(FailureRecord),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredJob {
    pub status: JobStatus,
    pub outcome: StoredOutcome,
}

/// In-process sink, handy for tests and for embedding without a database.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<HashMap<JobId, StoredJob>>,
    history: Mutex<Vec<(JobId, JobStatus)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &JobId) -> Option<StoredJob> {
        self.rows.lock().ok()?.get(id).cloned()
    }

    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        self.get(id).map(|j| j.status)
    }

    /// Every status write in the order it happened.
    pub fn history(&self) -> Vec<(JobId, JobStatus)> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    fn write(&self, id: &JobId, job: StoredJob) -> Result<(), SinkError> {
        let status = job.status;
        self.rows
            .lock()
            .map_err(|e| SinkError::Backend(e.to_string()))?
            .insert(id.clone(), job);
        self.history
            .lock()
            .map_err(|e| SinkError::Backend(e.to_string()))?
            .push((id.clone(), status));
        Ok(())
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn mark_processing(&self, id: &JobId) -> Result<(), SinkError> {
        self.write(id, StoredJob { status: JobStatus::Processing, outcome: StoredOutcome::InProgress })
    }

    async fn record_result(&self, id: &JobId, row: ResultRow) -> Result<(), SinkError> {
        self.write(id, StoredJob { status: row.status, outcome: StoredOutcome::Completed(row) })
    }

    async fn record_failure(&self, id: &JobId, failure: FailureRecord) -> Result<(), SinkError> {
        self.write(id, StoredJob { status: JobStatus::Failed, outcome: StoredOutcome::Failed(failure) })
    }
}
