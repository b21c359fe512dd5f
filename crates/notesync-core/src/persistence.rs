use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::SyncError;

/// Host key-value persistence.
///
/// Keys are `/`-separated (`cache/assets/03`). Blobs are always read and
/// written whole; there is no partial update.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Load a blob, `None` if the key is absent.
    async fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError>;

    /// Replace a blob.
    async fn save_blob(&self, key: &str, bytes: &[u8]) -> Result<(), SyncError>;

    /// Delete a blob. Returns `false` if it did not exist.
    async fn delete_blob(&self, key: &str) -> Result<bool, SyncError>;

    /// List keys starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, SyncError>;
}

/// In-memory blob store, for ephemeral runs and tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError> {
        Ok(self.blobs().get(key).cloned())
    }

    async fn save_blob(&self, key: &str, bytes: &[u8]) -> Result<(), SyncError> {
        self.blobs().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete_blob(&self, key: &str) -> Result<bool, SyncError> {
        Ok(self.blobs().remove(key).is_some())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, SyncError> {
        Ok(self
            .blobs()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
