use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration, loaded from a TOML file. Every field has a
/// default so partial files (or none at all) are valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SlipcheckConfig {
    pub verifier: VerifierSettings,
    pub preprocess: PreprocessSettings,
    pub queue: QueueSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifierSettings {
    /// Largest windowed edit distance still counted as a transaction id match.
    pub match_threshold: usize,
    /// Treat OCR look-alikes (O/0, I/1, S/5, ...) as equal when matching ids.
    pub fold_confusables: bool,
    /// Largest absolute difference still counted as an amount match.
    pub amount_tolerance: Decimal,
    /// Unlabelled numbers above this are ignored by the fallback amount pass.
    pub amount_ceiling: Decimal,
    pub ocr_timeout_ms: u64,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            match_threshold: 1,
            fold_confusables: true,
            amount_tolerance: Decimal::ONE,
            amount_ceiling: Decimal::from(10_000_000),
            ocr_timeout_ms: 60_000,
        }
    }
}

impl VerifierSettings {
    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_millis(self.ocr_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreprocessSettings {
    /// Images wider than this are scaled down (aspect preserved).
    pub max_width: u32,
    /// Render resolution for the first page of PDF uploads.
    pub pdf_dpi: u32,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self { max_width: 1800, pdf_dpi: 200 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueSettings {
    pub concurrency: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    /// Root for the database and stored uploads. Falls back to the platform
    /// data directory when unset.
    pub data_dir: Option<PathBuf>,
}

impl SlipcheckConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SlipcheckConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Like [`SlipcheckConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.concurrency == 0 {
            return Err(ConfigError::Invalid("queue.concurrency must be at least 1".into()));
        }
        if self.verifier.amount_tolerance.is_sign_negative() {
            return Err(ConfigError::Invalid("verifier.amount_tolerance must not be negative".into()));
        }
        if self.verifier.ocr_timeout_ms == 0 {
            return Err(ConfigError::Invalid("verifier.ocr_timeout_ms must be positive".into()));
        }
        if self.preprocess.max_width == 0 || self.preprocess.pdf_dpi == 0 {
            return Err(ConfigError::Invalid("preprocess sizes must be positive".into()));
        }
        Ok(())
    }
}
