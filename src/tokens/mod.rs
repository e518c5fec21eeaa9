//! Token store and access log abstractions
//!
//! Both are only consulted in web mode. The proxy never creates tokens; it
//! reads them, writes back usage counters and deletes them once exhausted.

mod dir;
mod memory;

pub use dir::{DirTokenStore, JsonLinesAccessLog};
pub use memory::{MemoryAccessLog, MemoryTokenStore};

use crate::config::{AccessLogConfig, TokenStoreConfig};
use crate::types::CapabilityToken;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by token and access log stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Other(String),
}

/// Persistent lookup of capability tokens by their opaque string.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Exact-match lookup; `Ok(None)` when no such token exists.
    async fn get_by_token(&self, token: &str) -> Result<Option<CapabilityToken>, StoreError>;

    /// Insert or replace the document for `token.token`.
    async fn save(&self, token: &CapabilityToken) -> Result<(), StoreError>;

    /// Remove a token. Deleting a missing token is not an error.
    async fn delete(&self, token: &str) -> Result<(), StoreError>;
}

/// One successfully authorized web request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub date_time: DateTime<Utc>,
    pub method: String,
    pub bucket: String,
    pub path: String,
    /// `bucket/path` of every file packed into an archive download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_content: Option<Vec<String>>,
}

/// Append-only sink for [`AccessLogEntry`] records.
#[async_trait]
pub trait AccessLogStore: Send + Sync {
    async fn append(&self, entry: &AccessLogEntry) -> Result<(), StoreError>;
}

pub fn open_token_store(config: &TokenStoreConfig) -> Result<Arc<dyn TokenStore>, StoreError> {
    match config {
        TokenStoreConfig::Dir { path } => Ok(Arc::new(DirTokenStore::open(path)?)),
    }
}

pub async fn open_access_log(
    config: &AccessLogConfig,
) -> Result<Arc<dyn AccessLogStore>, StoreError> {
    match config {
        AccessLogConfig::Jsonl { path } => Ok(Arc::new(JsonLinesAccessLog::open(path).await?)),
    }
}
