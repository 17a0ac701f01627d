pub mod config;
pub mod job;
pub mod money;
pub mod verification;

pub use config::{
    ConfigError, PreprocessSettings, QueueSettings, SlipcheckConfig, StorageSettings,
    VerifierSettings,
};
pub use job::{JobError, JobId, MimeType, VerificationJob};
pub use money::Money;
pub use verification::{FailureRecord, JobStatus, VerificationResult};
