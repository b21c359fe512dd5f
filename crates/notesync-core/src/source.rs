use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// A collection (notebook) owning a set of documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Stable collection identifier
    pub id: String,
    /// Display name, matched by collection ignore filters
    pub name: String,
}

/// Reference to a document inside a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRef {
    /// Stable item identifier
    pub id: String,
    /// Owning collection identifier
    pub collection_id: String,
    /// Display title
    pub title: String,
}

/// Metadata of a document as reported by the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// Hierarchical path (`Collection/Folder/Title`), without extension
    pub path: String,
    /// Item-level tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Unix timestamp of the last local modification
    pub last_modified: i64,
}

/// Exported content of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemContent {
    Text(String),
    Bytes(Vec<u8>),
}

impl ItemContent {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ItemContent::Text(text) => text.as_bytes(),
            ItemContent::Bytes(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ItemContent::Text(text) => text.into_bytes(),
            ItemContent::Bytes(bytes) => bytes,
        }
    }
}

/// An attachment file known to the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetRef {
    /// Path relative to the asset root (`assets/image.png`)
    pub path: String,
    /// Size in bytes, when cheaply known
    pub size: Option<u64>,
}

/// Source of the documents and attachments mirrored to the remote store.
///
/// Implementations enumerate and export content; they never write.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// List all collections.
    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, SyncError>;

    /// List the documents of a collection.
    async fn list_items_under(&self, collection_id: &str) -> Result<Vec<ItemRef>, SyncError>;

    /// Export a document to its uploadable representation.
    async fn export_item_content(&self, item_id: &str) -> Result<ItemContent, SyncError>;

    /// Get path, tags and modification time of a document.
    async fn get_item_metadata(&self, item_id: &str) -> Result<ItemMetadata, SyncError>;

    /// Attachments referenced by a document.
    async fn referenced_assets(&self, item_id: &str) -> Result<Vec<AssetRef>, SyncError>;

    /// All attachments known to the source.
    async fn list_assets(&self) -> Result<Vec<AssetRef>, SyncError>;

    /// Read the bytes of an attachment.
    async fn read_asset(&self, path: &str) -> Result<Vec<u8>, SyncError>;
}
