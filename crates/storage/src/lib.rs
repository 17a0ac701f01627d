pub mod db;
pub mod files;

use slipcheck_core::JobId;
use thiserror::Error;

pub use db::{create_db, DbPool, JobRecord, SqliteResultStore};
pub use files::{content_path, sha256_bytes, to_hex, ContentStore, FileStore, StoredFile};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("Job {0} is already reserved")]
    AlreadyReserved(JobId),
    #[error("Corrupt row for job {id}: {reason}")]
    Corrupt { id: JobId, reason: String },
}
