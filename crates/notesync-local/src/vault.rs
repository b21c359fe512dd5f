//! Markdown vault on the local filesystem as a document source.
//!
//! ```text
//! {root}/
//!   Notes/              # collection "Notes"
//!     Plan.md           # document "Notes/Plan"
//!     Drafts/Idea.md    # document "Notes/Drafts/Idea"
//!   assets/             # attachments, not a collection
//!     diagram.png
//! ```

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use notesync_core::{
    AssetRef, CollectionInfo, DocumentSource, ItemContent, ItemMetadata, ItemRef, SyncError,
};
use tokio::fs;
use tracing::{debug, instrument};

use crate::walk::{is_hidden, relative_key, safe_join, walk_files};

const ASSETS_DIR: &str = "assets";
const DOCUMENT_EXTENSION: &str = "md";

#[derive(Debug, Clone)]
pub struct VaultSource {
    root: PathBuf,
}

impl VaultSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, item_id: &str) -> Result<PathBuf, SyncError> {
        safe_join(&self.root, &format!("{}.{}", item_id, DOCUMENT_EXTENSION))
    }

    fn asset_path(&self, path: &str) -> Result<PathBuf, SyncError> {
        if !path.starts_with("assets/") {
            return Err(SyncError::Source(format!("Not an attachment path: {}", path)));
        }
        safe_join(&self.root, path)
    }

    async fn read_document(&self, item_id: &str) -> Result<String, SyncError> {
        let path = self.document_path(item_id)?;
        fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SyncError::NotFound(item_id.to_string()),
            _ => SyncError::Source(format!("Failed to read {}: {}", path.display(), e)),
        })
    }

    async fn asset_ref(&self, path: String) -> Option<AssetRef> {
        let full = self.asset_path(&path).ok()?;
        let metadata = fs::metadata(&full).await.ok()?;
        metadata.is_file().then(|| AssetRef {
            path,
            size: Some(metadata.len()),
        })
    }
}

#[async_trait]
impl DocumentSource for VaultSource {
    #[instrument(skip(self), level = "debug")]
    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, SyncError> {
        let mut entries = fs::read_dir(&self.root).await.map_err(|e| {
            SyncError::Source(format!(
                "Cannot open vault {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let mut collections = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if is_hidden(&name) || name == ASSETS_DIR || !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = name.to_string_lossy().to_string();
            collections.push(CollectionInfo {
                id: name.clone(),
                name,
            });
        }

        collections.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("Found {} collections", collections.len());
        Ok(collections)
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_items_under(&self, collection_id: &str) -> Result<Vec<ItemRef>, SyncError> {
        let dir = safe_join(&self.root, collection_id)?;
        let files = walk_files(&dir).await?;

        Ok(files
            .iter()
            // Exact match: ids drop the extension and are read back as `.md`
            .filter(|path| path.extension().is_some_and(|ext| ext == DOCUMENT_EXTENSION))
            .filter_map(|path| {
                let key = relative_key(&self.root, &path.with_extension(""))?;
                let title = path.file_stem()?.to_string_lossy().to_string();
                Some(ItemRef {
                    id: key,
                    collection_id: collection_id.to_string(),
                    title,
                })
            })
            .collect())
    }

    async fn export_item_content(&self, item_id: &str) -> Result<ItemContent, SyncError> {
        self.read_document(item_id).await.map(ItemContent::Text)
    }

    async fn get_item_metadata(&self, item_id: &str) -> Result<ItemMetadata, SyncError> {
        let content = self.read_document(item_id).await?;
        let modified = fs::metadata(self.document_path(item_id)?)
            .await?
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp())
            .unwrap_or_default();

        Ok(ItemMetadata {
            path: item_id.to_string(),
            tags: parse_tags(&content),
            last_modified: modified,
        })
    }

    async fn referenced_assets(&self, item_id: &str) -> Result<Vec<AssetRef>, SyncError> {
        let content = self.read_document(item_id).await?;
        let mut assets = Vec::new();
        for path in asset_links(&content) {
            match self.asset_ref(path.clone()).await {
                Some(asset) => assets.push(asset),
                None => debug!("{} links missing attachment {}", item_id, path),
            }
        }
        Ok(assets)
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_assets(&self) -> Result<Vec<AssetRef>, SyncError> {
        let files = walk_files(&self.root.join(ASSETS_DIR)).await?;
        let mut assets = Vec::with_capacity(files.len());
        for file in &files {
            let Some(path) = relative_key(&self.root, file) else {
                continue;
            };
            let size = fs::metadata(file).await.ok().map(|m| m.len());
            assets.push(AssetRef { path, size });
        }
        Ok(assets)
    }

    async fn read_asset(&self, path: &str) -> Result<Vec<u8>, SyncError> {
        let full = self.asset_path(path)?;
        fs::read(&full).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SyncError::NotFound(path.to_string()),
            _ => SyncError::Source(format!("Failed to read {}: {}", full.display(), e)),
        })
    }
}

/// Tags from a `tags:` line at the top of the document.
fn parse_tags(content: &str) -> Vec<String> {
    let Some(first) = content.lines().find(|line| !line.trim().is_empty()) else {
        return Vec::new();
    };
    let Some(list) = first.trim().strip_prefix("tags:") else {
        return Vec::new();
    };
    list.split(',')
        .map(|tag| tag.trim().trim_start_matches('#').to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Attachment paths of markdown links pointing into `assets/`, in order, without duplicates.
fn asset_links(content: &str) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    let mut rest = content;

    while let Some(start) = rest.find("](") {
        rest = &rest[start + 2..];
        let Some(end) = rest.find(')') else {
            break;
        };
        let raw = rest[..end].trim_start();
        let target = match raw.strip_prefix('<') {
            Some(inner) => inner.split('>').next().unwrap_or_default(),
            None => raw.split_whitespace().next().unwrap_or_default(),
        };
        rest = &rest[end..];

        let Some(index) = target.find("assets/") else {
            continue;
        };
        if target.contains("://") {
            continue;
        }
        let path = &target[index..];
        let path = path.split(['#', '?']).next().unwrap_or(path);
        let path = urlencoding::decode(path)
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| path.to_string());
        if !links.contains(&path) {
            links.push(path);
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn vault() -> (VaultSource, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        for dir in ["Notes/Drafts", "Work", "assets/img", ".obsidian"] {
            fs::create_dir_all(root.join(dir)).await.unwrap();
        }
        fs::write(
            root.join("Notes/Plan.md"),
            "tags: roadmap, #Q3\n\n# Plan\n![diagram](../assets/img/diagram%201.png) and [spec](assets/spec.pdf)\n",
        )
        .await
        .unwrap();
        fs::write(root.join("Notes/Drafts/Idea.md"), "just an idea")
            .await
            .unwrap();
        fs::write(root.join("Notes/readme.txt"), "not markdown")
            .await
            .unwrap();
        fs::write(root.join("assets/img/diagram 1.png"), b"png")
            .await
            .unwrap();
        fs::write(root.join("assets/spec.pdf"), b"pdf").await.unwrap();
        (VaultSource::new(root), temp_dir)
    }

    #[tokio::test]
    async fn test_collections_are_top_level_dirs() {
        let (vault, _temp_dir) = vault().await;
        let names: Vec<_> = vault
            .list_collections()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Notes", "Work"]);
    }

    #[tokio::test]
    async fn test_items_are_markdown_files() {
        let (vault, _temp_dir) = vault().await;
        let items = vault.list_items_under("Notes").await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["Notes/Drafts/Idea", "Notes/Plan"]);
        assert_eq!(items[1].title, "Plan");
        assert!(vault.list_items_under("Work").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listed_items_can_be_read_back() {
        let (vault, temp_dir) = vault().await;
        fs::write(temp_dir.path().join("Work/Shout.MD"), "upper")
            .await
            .unwrap();
        fs::write(temp_dir.path().join("Work/Quiet.md"), "lower")
            .await
            .unwrap();

        let items = vault.list_items_under("Work").await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["Work/Quiet"]);
        for item in &items {
            assert!(vault.export_item_content(&item.id).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_metadata_and_content() {
        let (vault, _temp_dir) = vault().await;
        let meta = vault.get_item_metadata("Notes/Plan").await.unwrap();
        assert_eq!(meta.path, "Notes/Plan");
        assert_eq!(meta.tags, vec!["roadmap", "Q3"]);
        assert!(meta.last_modified > 0);

        let content = vault.export_item_content("Notes/Drafts/Idea").await.unwrap();
        assert_eq!(content.as_bytes(), b"just an idea");
    }

    #[tokio::test]
    async fn test_missing_document_is_not_found() {
        let (vault, _temp_dir) = vault().await;
        assert!(matches!(
            vault.export_item_content("Notes/Gone").await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_referenced_assets() {
        let (vault, _temp_dir) = vault().await;
        let assets = vault.referenced_assets("Notes/Plan").await.unwrap();
        let paths: Vec<_> = assets.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["assets/img/diagram 1.png", "assets/spec.pdf"]);
        assert_eq!(assets[0].size, Some(3));
    }

    #[tokio::test]
    async fn test_list_and_read_assets() {
        let (vault, _temp_dir) = vault().await;
        let assets = vault.list_assets().await.unwrap();
        assert_eq!(assets.len(), 2);
        assert_eq!(
            vault.read_asset("assets/spec.pdf").await.unwrap(),
            b"pdf".to_vec()
        );
        assert!(vault.read_asset("Notes/Plan.md").await.is_err());
        assert!(vault.read_asset("assets/../Notes/Plan.md").await.is_err());
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!(parse_tags("\n tags: a, b ,, #c\nbody"), vec!["a", "b", "c"]);
        assert!(parse_tags("# Title\ntags: a").is_empty());
        assert!(parse_tags("").is_empty());
    }

    #[test]
    fn test_asset_links() {
        let content = "![a](assets/a.png) [b](<./assets/b c.pdf>) [web](https://x.io/assets/c.png) \
                       [again](assets/a.png#frag) [other](Notes/x.md)";
        assert_eq!(asset_links(content), vec!["assets/a.png", "assets/b c.pdf"]);
    }
}
