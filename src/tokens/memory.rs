//! In-memory token store and access log.

use super::{AccessLogEntry, AccessLogStore, StoreError, TokenStore};
use crate::types::CapabilityToken;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Thread-safe in-memory token store.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, CapabilityToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: CapabilityToken) {
        self.tokens.write().insert(token.token.clone(), token);
    }

    pub fn get(&self, token: &str) -> Option<CapabilityToken> {
        self.tokens.read().get(token).cloned()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get_by_token(&self, token: &str) -> Result<Option<CapabilityToken>, StoreError> {
        Ok(self.get(token))
    }

    async fn save(&self, token: &CapabilityToken) -> Result<(), StoreError> {
        self.insert(token.clone());
        Ok(())
    }

    async fn delete(&self, token: &str) -> Result<(), StoreError> {
        self.tokens.write().remove(token);
        Ok(())
    }
}

/// Access log kept in memory, oldest entry first.
#[derive(Default)]
pub struct MemoryAccessLog {
    entries: RwLock<Vec<AccessLogEntry>>,
}

impl MemoryAccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AccessLogEntry> {
        self.entries.read().clone()
    }
}

#[async_trait]
impl AccessLogStore for MemoryAccessLog {
    async fn append(&self, entry: &AccessLogEntry) -> Result<(), StoreError> {
        self.entries.write().push(entry.clone());
        Ok(())
    }
}
