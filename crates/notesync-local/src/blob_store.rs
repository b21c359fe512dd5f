use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use notesync_core::{BlobStore, SyncError};
use tokio::fs;
use tracing::{debug, instrument};

use crate::walk::{relative_key, safe_join, walk_files};

const BLOB_EXTENSION: &str = ".json";

/// Blob store over a local directory.
///
/// Layout:
/// ```text
/// {root}/
///   settings.json
///   device.json
///   cache/docs/{collection}.json
///   cache/assets/{NN}.json
///   history/runs.json
///   history/stats.json
/// ```
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf, SyncError> {
        if key.trim_matches('/').is_empty() {
            return Err(SyncError::Io("Empty blob key".to_string()));
        }
        safe_join(&self.root, &format!("{}{}", key, BLOB_EXTENSION))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    #[instrument(skip(self), level = "debug")]
    async fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError> {
        let path = self.blob_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => {
                debug!("Loaded {} ({} bytes)", key, bytes.len());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self, bytes), level = "debug", fields(len = bytes.len()))]
    async fn save_blob(&self, key: &str, bytes: &[u8]) -> Result<(), SyncError> {
        let path = self.blob_path(key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                SyncError::Io(format!(
                    "Failed to create directory for {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }

        // Write atomically via temp file
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, bytes).await.map_err(|e| {
            SyncError::Io(format!(
                "Failed to write temp file {}: {}",
                temp_path.display(),
                e
            ))
        })?;

        fs::rename(&temp_path, &path).await.map_err(|e| {
            SyncError::Io(format!(
                "Failed to rename temp file to {}: {}",
                path.display(),
                e
            ))
        })?;

        debug!("Saved {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_blob(&self, key: &str) -> Result<bool, SyncError> {
        let path = self.blob_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SyncError::Io(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, SyncError> {
        let files = walk_files(&self.root).await?;
        Ok(files
            .iter()
            .filter_map(|path| relative_key(&self.root, path))
            .filter_map(|key| key.strip_suffix(BLOB_EXTENSION).map(str::to_string))
            .filter(|key| key.starts_with(prefix))
            .collect())
    }
}
