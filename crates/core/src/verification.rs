use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::money::Money;

/// Outcome of running one slip through the verification pipeline.
///
/// `transaction_match` and `amount_match` are tri-state: `None` means the
/// caller gave nothing to compare against, which is distinct from a mismatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationResult {
    #[serde(rename = "match")]
    pub transaction_match: Option<bool>,
    /// The OCR engine's own confidence, 0–100.
    pub confidence: f32,
    pub extracted_text: String,
    /// Best windowed edit distance between the normalised expected id and the
    /// normalised text; `None` when no transaction id was expected. When
    /// `fold_confusables` is on (the default) both sides have OCR look-alikes
    /// folded first (O/Q→0, I/L→1, Z→2, S→5, B→8), so this is not the plain
    /// Levenshtein distance against `extracted_text`.
    pub distance: Option<usize>,
    pub detected_amount: Option<Money>,
    pub expected_amount: Option<Money>,
    pub amount_match: Option<bool>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Validated,
    Pending,
    Failed,
}

impl JobStatus {
    /// Success terminal for a completed result: validated when either the
    /// transaction id or the amount positively matched, pending otherwise.
    pub fn from_result(result: &VerificationResult) -> Self {
        if result.transaction_match == Some(true) || result.amount_match == Some(true) {
            JobStatus::Validated
        } else {
            JobStatus::Pending
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Validated | JobStatus::Pending | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Validated => "validated",
            JobStatus::Pending => "pending",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "validated" => Ok(JobStatus::Validated),
            "pending" => Ok(JobStatus::Pending),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("Unknown job status: '{other}'")),
        }
    }
}

/// Written in place of a result when the pipeline fails for a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub transaction_id: JobId,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(transaction_id: JobId, error_message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            error_message: error_message.into(),
            failed_at: Utc::now(),
        }
    }
}
