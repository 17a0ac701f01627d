use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    /// `<sha256 hex>.<ext>`; identical bytes always produce the same key.
    pub key: String,
    pub url: String,
}

/// Durable home for raw slip bytes.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn save(&self, bytes: &[u8], suggested_name: &str) -> Result<StoredFile, StoreError>;
}

pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex, 64 chars.
pub fn to_hex(hash: &[u8; 32]) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

/// Layout: `<root>/<first 2 hex chars>/<full hex>.<ext>`
pub fn content_path(root: &Path, hash_hex: &str, ext: &str) -> PathBuf {
    root.join(&hash_hex[..2]).join(format!("{hash_hex}.{ext}"))
}

fn extension_of(suggested_name: &str) -> String {
    Path::new(suggested_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string())
}

/// Content-addressed store on the local filesystem.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &str) -> Option<PathBuf> {
        let (hash, ext) = key.split_once('.')?;
        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(content_path(&self.root, hash, ext))
    }

    pub async fn load(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("bad file key '{key}'"))
        })?;
        Ok(tokio::fs::read(path).await?)
    }
}

#[async_trait]
impl FileStore for ContentStore {
    async fn save(&self, bytes: &[u8], suggested_name: &str) -> Result<StoredFile, StoreError> {
        let hash = to_hex(&sha256_bytes(bytes));
        let ext = extension_of(suggested_name);
        let path = content_path(&self.root, &hash, &ext);

        if tokio::fs::try_exists(&path).await? {
            tracing::debug!(path = %path.display(), "Slip bytes already stored");
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // Readers never observe a half-written file.
            let partial = path.with_extension(format!("{ext}.part"));
            tokio::fs::write(&partial, bytes).await?;
            tokio::fs::rename(&partial, &path).await?;
            tracing::debug!(path = %path.display(), size = bytes.len(), "Stored slip bytes");
        }

        Ok(StoredFile {
            key: format!("{hash}.{ext}"),
            url: format!("file://{}", path.display()),
        })
    }
}
