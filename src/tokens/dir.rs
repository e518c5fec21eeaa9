//! Directory-backed token store and JSON-lines access log
//!
//! Layout:
//! ```text
//! {root}/{sha256(token)}.json   # one CapabilityToken document per file
//! ```
//!
//! File names are derived from the token hash so arbitrary token strings are
//! safe to use and tokens can be provisioned out-of-band by dropping a file in
//! place.

use super::{AccessLogEntry, AccessLogStore, StoreError, TokenStore};
use crate::types::CapabilityToken;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Write data atomically: write to a temp file in the same directory, then rename.
async fn atomic_write(path: &Path, data: Vec<u8>) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Other("Cannot atomic-write to a path with no parent".into()))?
        .to_path_buf();
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let mut tmp = NamedTempFile::new_in(&parent)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok::<(), StoreError>(())
    })
    .await
    .map_err(|e| StoreError::Other(format!("spawn_blocking join failed: {}", e)))?
}

/// Token store keeping one JSON document per token under a root directory.
pub struct DirTokenStore {
    root: PathBuf,
}

impl DirTokenStore {
    /// Open (and create if needed) the store directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Path of the document holding `token`.
    pub fn token_path(&self, token: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(token.as_bytes()));
        self.root.join(format!("{}.json", digest))
    }
}

#[async_trait]
impl TokenStore for DirTokenStore {
    async fn get_by_token(&self, token: &str) -> Result<Option<CapabilityToken>, StoreError> {
        let data = match tokio::fs::read(self.token_path(token)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let doc: CapabilityToken = serde_json::from_slice(&data)?;
        if doc.token != token {
            return Err(StoreError::Other(format!(
                "document {} holds a different token",
                self.token_path(token).display()
            )));
        }
        Ok(Some(doc))
    }

    async fn save(&self, token: &CapabilityToken) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(token)?;
        atomic_write(&self.token_path(&token.token), data).await?;
        debug!("Saved token document (used={})", token.used);
        Ok(())
    }

    async fn delete(&self, token: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.token_path(token)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Access log appending one JSON object per line.
pub struct JsonLinesAccessLog {
    file: Mutex<tokio::fs::File>,
}

impl JsonLinesAccessLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl AccessLogStore for JsonLinesAccessLog {
    async fn append(&self, entry: &AccessLogEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
