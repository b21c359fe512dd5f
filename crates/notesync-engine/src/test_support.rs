//! In-memory doubles for the remote store and the document source.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notesync_core::{
    AssetRef, CollectionInfo, DocumentSource, ItemContent, ItemMetadata, ItemRef, RemoteMetadata,
    RemoteStore, SyncError, WriteOutcome,
};

#[derive(Default)]
struct RemoteState {
    files: HashMap<String, (Vec<u8>, String)>,
    next_revision: u64,
    latest_activity: Option<DateTime<Utc>>,
    pending_conflicts: HashMap<String, u32>,
    failing_paths: HashSet<String>,
    write_attempts: HashMap<String, Vec<Option<String>>>,
    fail_deletes: bool,
}

/// Remote store honoring revision preconditions, with fault injection.
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<RemoteState>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    pub fn fail_next_writes_with_conflict(&self, path: &str, count: u32) {
        self.state().pending_conflicts.insert(path.to_string(), count);
    }

    pub fn fail_path(&self, path: &str) {
        self.state().failing_paths.insert(path.to_string());
    }

    pub fn fail_deletes(&self) {
        self.state().fail_deletes = true;
    }

    pub fn set_latest_activity(&self, at: Option<DateTime<Utc>>) {
        self.state().latest_activity = at;
    }

    pub fn put_file(&self, path: &str, content: &[u8]) {
        let mut state = self.state();
        state.next_revision += 1;
        let revision = format!("r{}", state.next_revision);
        state
            .files
            .insert(path.to_string(), (content.to_vec(), revision));
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).map(|(c, _)| c.clone())
    }

    pub fn write_attempts(&self, path: &str) -> Vec<Option<String>> {
        self.state()
            .write_attempts
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_writes(&self) -> usize {
        self.state().write_attempts.values().map(Vec::len).sum()
    }

    pub fn writes_under(&self, prefix: &str) -> usize {
        self.state()
            .write_attempts
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(_, attempts)| attempts.len())
            .sum()
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    async fn get_metadata(&self, path: &str) -> Result<Option<RemoteMetadata>, SyncError> {
        Ok(self.state().files.get(path).map(|(content, revision)| RemoteMetadata {
            revision: revision.clone(),
            size: Some(content.len() as u64),
        }))
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, SyncError> {
        Ok(self.content(path))
    }

    async fn write(
        &self,
        path: &str,
        content: &[u8],
        expected_revision: Option<&str>,
        _message: &str,
    ) -> Result<WriteOutcome, SyncError> {
        let mut state = self.state();
        state
            .write_attempts
            .entry(path.to_string())
            .or_default()
            .push(expected_revision.map(str::to_string));

        if state.failing_paths.contains(path) {
            return Err(SyncError::Remote(format!("injected failure for {}", path)));
        }

        if let Some(remaining) = state.pending_conflicts.get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(WriteOutcome::Conflict);
            }
        }

        let current = state.files.get(path).map(|(_, r)| r.clone());
        if current.as_deref() != expected_revision {
            return Ok(WriteOutcome::Conflict);
        }

        state.next_revision += 1;
        let revision = format!("r{}", state.next_revision);
        state
            .files
            .insert(path.to_string(), (content.to_vec(), revision.clone()));
        state.latest_activity = Some(Utc::now());
        Ok(WriteOutcome::Written(revision))
    }

    async fn delete(&self, path: &str, _message: &str) -> Result<bool, SyncError> {
        let mut state = self.state();
        if state.fail_deletes {
            return Err(SyncError::Remote("injected delete failure".to_string()));
        }
        let removed = state.files.remove(path).is_some();
        if removed {
            state.latest_activity = Some(Utc::now());
        }
        Ok(removed)
    }

    async fn latest_activity(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        Ok(self.state().latest_activity)
    }
}

struct MockItem {
    item: ItemRef,
    metadata: ItemMetadata,
    content: String,
    assets: Vec<AssetRef>,
}

#[derive(Default)]
struct SourceState {
    collections: Vec<CollectionInfo>,
    items: Vec<MockItem>,
    assets: HashMap<String, Vec<u8>>,
    failing_exports: HashSet<String>,
    fail_listing: bool,
}

/// Document source backed by in-memory collections.
#[derive(Default)]
pub struct MockSource {
    state: Mutex<SourceState>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().unwrap()
    }

    pub fn add_collection(&self, id: &str, name: &str) {
        self.state().collections.push(CollectionInfo {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    pub fn add_document(&self, collection_id: &str, id: &str, path: &str, content: &str) {
        self.add_tagged_document(collection_id, id, path, content, &[]);
    }

    pub fn add_tagged_document(
        &self,
        collection_id: &str,
        id: &str,
        path: &str,
        content: &str,
        tags: &[&str],
    ) {
        self.state().items.push(MockItem {
            item: ItemRef {
                id: id.to_string(),
                collection_id: collection_id.to_string(),
                title: id.to_string(),
            },
            metadata: ItemMetadata {
                path: path.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                last_modified: 0,
            },
            content: content.to_string(),
            assets: Vec::new(),
        });
    }

    pub fn set_content(&self, id: &str, content: &str) {
        if let Some(item) = self.state().items.iter_mut().find(|i| i.item.id == id) {
            item.content = content.to_string();
        }
    }

    pub fn add_asset(&self, path: &str, bytes: &[u8]) {
        self.state().assets.insert(path.to_string(), bytes.to_vec());
    }

    pub fn link_asset(&self, id: &str, path: &str) {
        let size = self.state().assets.get(path).map(|b| b.len() as u64);
        if let Some(item) = self.state().items.iter_mut().find(|i| i.item.id == id) {
            item.assets.push(AssetRef {
                path: path.to_string(),
                size,
            });
        }
    }

    pub fn fail_export(&self, id: &str) {
        self.state().failing_exports.insert(id.to_string());
    }

    pub fn fail_listing(&self) {
        self.state().fail_listing = true;
    }
}

#[async_trait]
impl DocumentSource for MockSource {
    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, SyncError> {
        let state = self.state();
        if state.fail_listing {
            return Err(SyncError::Source("injected listing failure".to_string()));
        }
        Ok(state.collections.clone())
    }

    async fn list_items_under(&self, collection_id: &str) -> Result<Vec<ItemRef>, SyncError> {
        Ok(self
            .state()
            .items
            .iter()
            .filter(|i| i.item.collection_id == collection_id)
            .map(|i| i.item.clone())
            .collect())
    }

    async fn export_item_content(&self, item_id: &str) -> Result<ItemContent, SyncError> {
        let state = self.state();
        if state.failing_exports.contains(item_id) {
            return Err(SyncError::Source(format!("cannot export {}", item_id)));
        }
        state
            .items
            .iter()
            .find(|i| i.item.id == item_id)
            .map(|i| ItemContent::Text(i.content.clone()))
            .ok_or_else(|| SyncError::NotFound(item_id.to_string()))
    }

    async fn get_item_metadata(&self, item_id: &str) -> Result<ItemMetadata, SyncError> {
        self.state()
            .items
            .iter()
            .find(|i| i.item.id == item_id)
            .map(|i| i.metadata.clone())
            .ok_or_else(|| SyncError::NotFound(item_id.to_string()))
    }

    async fn referenced_assets(&self, item_id: &str) -> Result<Vec<AssetRef>, SyncError> {
        Ok(self
            .state()
            .items
            .iter()
            .find(|i| i.item.id == item_id)
            .map(|i| i.assets.clone())
            .unwrap_or_default())
    }

    async fn list_assets(&self) -> Result<Vec<AssetRef>, SyncError> {
        let mut assets: Vec<AssetRef> = self
            .state()
            .assets
            .iter()
            .map(|(path, bytes)| AssetRef {
                path: path.clone(),
                size: Some(bytes.len() as u64),
            })
            .collect();
        assets.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(assets)
    }

    async fn read_asset(&self, path: &str) -> Result<Vec<u8>, SyncError> {
        self.state()
            .assets
            .get(path)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(path.to_string()))
    }
}
