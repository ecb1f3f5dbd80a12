use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Backend(String),
    #[error("snapshot encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Persisted skeleton of a session: enough to mount its route again and
/// restore session data, never the component tree itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub created_at_ms: u64,
    #[serde(default)]
    pub detached_at_ms: Option<u64>,
    #[serde(default)]
    pub had_auth: bool,
    pub path: String,
    #[serde(default)]
    pub recv_seq: u64,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl SessionSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn save(&self, id: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    async fn remove(&self, _id: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory adapter for tests and single-process deployments.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().await.get(id).cloned())
    }

    async fn save(&self, id: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.entries.lock().await.insert(id.to_string(), bytes);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(id);
        Ok(())
    }
}
