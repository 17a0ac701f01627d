use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Job id is missing")]
    MissingId,
    #[error("Unsupported file type: '{0}'")]
    UnsupportedMimeType(String),
}

/// Caller-reserved identifier of a verification job (typically the primary
/// key of the row inserted before the upload was enqueued).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        JobId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId::new(s)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        JobId(s)
    }
}

/// File types accepted at the upload boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MimeType {
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/webp")]
    Webp,
    #[serde(rename = "image/tiff")]
    Tiff,
    #[serde(rename = "image/bmp")]
    Bmp,
    #[serde(rename = "application/pdf")]
    Pdf,
}

impl MimeType {
    pub fn as_str(self) -> &'static str {
        match self {
            MimeType::Jpeg => "image/jpeg",
            MimeType::Png => "image/png",
            MimeType::Webp => "image/webp",
            MimeType::Tiff => "image/tiff",
            MimeType::Bmp => "image/bmp",
            MimeType::Pdf => "application/pdf",
        }
    }

    /// Multi-page document formats; only the first page is ever rendered.
    pub fn is_document(self) -> bool {
        matches!(self, MimeType::Pdf)
    }

    pub fn from_extension(ext: &str) -> Result<Self, JobError> {
        match ext.trim_start_matches('.').to_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(MimeType::Jpeg),
            "png" => Ok(MimeType::Png),
            "webp" => Ok(MimeType::Webp),
            "tif" | "tiff" => Ok(MimeType::Tiff),
            "bmp" => Ok(MimeType::Bmp),
            "pdf" => Ok(MimeType::Pdf),
            other => Err(JobError::UnsupportedMimeType(other.to_string())),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            MimeType::Jpeg => "jpg",
            MimeType::Png => "png",
            MimeType::Webp => "webp",
            MimeType::Tiff => "tiff",
            MimeType::Bmp => "bmp",
            MimeType::Pdf => "pdf",
        }
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MimeType {
    type Err = JobError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Parameters such as `; charset=binary` are ignored.
        let essence = s.split(';').next().unwrap_or("").trim().to_lowercase();
        match essence.as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Ok(MimeType::Jpeg),
            "image/png" => Ok(MimeType::Png),
            "image/webp" => Ok(MimeType::Webp),
            "image/tiff" => Ok(MimeType::Tiff),
            "image/bmp" | "image/x-ms-bmp" => Ok(MimeType::Bmp),
            "application/pdf" => Ok(MimeType::Pdf),
            _ => Err(JobError::UnsupportedMimeType(s.to_string())),
        }
    }
}

/// One slip submitted for verification. Immutable once built; the queue takes
/// ownership on enqueue and hands it to exactly one worker.
#[derive(Debug, Clone)]
pub struct VerificationJob {
    pub id: JobId,
    pub raw_bytes: Vec<u8>,
    pub mime_type: MimeType,
    pub expected_transaction_id: Option<String>,
    /// Kept as the caller sent it; parsed leniently during verification.
    pub expected_amount: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl VerificationJob {
    pub fn new(id: impl Into<JobId>, raw_bytes: Vec<u8>, mime_type: MimeType) -> Self {
        Self {
            id: id.into(),
            raw_bytes,
            mime_type,
            expected_transaction_id: None,
            expected_amount: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_expected_transaction_id(mut self, id: impl Into<String>) -> Self {
        self.expected_transaction_id = Some(id.into());
        self
    }

    pub fn with_expected_amount(mut self, amount: impl Into<String>) -> Self {
        self.expected_amount = Some(amount.into());
        self
    }

    /// Boundary validation run before a job may enter the queue.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.id.is_blank() {
            return Err(JobError::MissingId);
        }
        Ok(())
    }
}
