//! Narrow write/read interface for large payloads and result files.

use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Pointer to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Storage key.
    pub key: String,
    /// Payload size in bytes.
    pub size_bytes: usize,
}

/// Stores opaque payloads by key.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Writes a payload, replacing any previous one under the key.
    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<ArtifactRef, StoreError>;

    /// Reads a payload.
    async fn read(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StoreError>;
}

/// In-memory artifact store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryArtifactStore {
    artifacts: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryArtifactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.lock().len()
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.lock().is_empty()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<ArtifactRef, StoreError> {
        let artifact = ArtifactRef {
            key: key.to_string(),
            size_bytes: bytes.len(),
        };
        self.artifacts.lock().insert(key.to_string(), bytes);
        Ok(artifact)
    }

    async fn read(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StoreError> {
        self.artifacts
            .lock()
            .get(&artifact.key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("artifact", &artifact.key))
    }
}
