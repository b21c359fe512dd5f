use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Metadata of a remote path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    /// Opaque revision token, only used as a write precondition
    pub revision: String,
    /// Size in bytes, when reported
    #[serde(default)]
    pub size: Option<u64>,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Write applied; carries the new revision token
    Written(String),
    /// The expected revision did not match the remote one
    Conflict,
}

/// Primitive operations of the remote content store.
///
/// The store offers no transactions and no atomic create-if-absent: every
/// higher-level guarantee is built from these calls.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Human-readable backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Get the current revision of a path, `None` if it does not exist.
    async fn get_metadata(&self, path: &str) -> Result<Option<RemoteMetadata>, SyncError>;

    /// Read the content of a path, `None` if it does not exist.
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, SyncError>;

    /// Write a path.
    ///
    /// `expected_revision` is the precondition: `None` means "create", `Some`
    /// means "replace exactly this revision".
    async fn write(
        &self,
        path: &str,
        content: &[u8],
        expected_revision: Option<&str>,
        message: &str,
    ) -> Result<WriteOutcome, SyncError>;

    /// Delete a path. Returns `false` if it did not exist.
    async fn delete(&self, path: &str, message: &str) -> Result<bool, SyncError>;

    /// Timestamp of the most recent write to the store, any device.
    async fn latest_activity(&self) -> Result<Option<DateTime<Utc>>, SyncError>;
}
