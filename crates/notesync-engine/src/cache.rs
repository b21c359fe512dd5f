//! Sharded fingerprint cache.
//!
//! Remembers, per document and per attachment, the content fingerprint and
//! remote revision of the last successful upload. Partitions are persisted as
//! whole blobs in host persistence:
//! ```text
//! cache/
//!   docs/{collection_id}   # one blob per collection, id percent-encoded
//!   assets/{NN}            # one blob per asset shard, NN in [0, shard_count)
//! ```
//! The cache is purely an optimization. A missing or corrupt blob is an empty
//! partition, which only costs redundant uploads.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use notesync_core::{BlobStore, SyncError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Number of asset shards, fixed at deployment time.
pub const ASSET_SHARD_COUNT: usize = 16;

const CACHE_PREFIX: &str = "cache/";
const CACHE_FORMAT_VERSION: u32 = 1;

/// SHA-256 fingerprint of content, hex encoded.
pub fn fingerprint(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Shard index of an asset path: first four bytes of SHA-256, big endian, mod `shard_count`.
pub fn shard_for(path: &str, shard_count: usize) -> usize {
    let digest = Sha256::digest(path.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix as usize % shard_count.max(1)
}

/// Last-synced state of one document or attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub item_id: String,
    /// Owning collection (`None` for attachments)
    #[serde(default)]
    pub collection_id: Option<String>,
    pub remote_path: String,
    /// Fingerprint of the content last uploaded
    pub fingerprint: String,
    /// Remote revision returned by that upload
    pub revision: String,
    /// Unix timestamp of that upload
    pub synced_at: i64,
    #[serde(default)]
    pub size: Option<u64>,
}

/// A unit of persistence: loaded and saved as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Partition {
    Collection(String),
    AssetShard(usize),
}

impl Partition {
    pub fn blob_key(&self) -> String {
        match self {
            Partition::Collection(id) => {
                format!("{}docs/{}", CACHE_PREFIX, urlencoding::encode(id))
            }
            Partition::AssetShard(index) => format!("{}assets/{:02}", CACHE_PREFIX, index),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PartitionBlob {
    version: u32,
    entries: HashMap<String, CacheEntry>,
}

type Entries = HashMap<String, CacheEntry>;

/// `None` until the partition is first touched.
type PartitionSlot = Arc<Mutex<Option<Entries>>>;

/// Arena of independently lockable cache partitions.
///
/// Every read-modify-write of a partition happens under that partition's
/// mutex, so concurrent updates within the process never drop entries.
pub struct FingerprintCache {
    store: Arc<dyn BlobStore>,
    shard_count: usize,
    partitions: DashMap<Partition, PartitionSlot>,
}

impl FingerprintCache {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self::with_shard_count(store, ASSET_SHARD_COUNT)
    }

    pub fn with_shard_count(store: Arc<dyn BlobStore>, shard_count: usize) -> Self {
        Self {
            store,
            shard_count: shard_count.max(1),
            partitions: DashMap::new(),
        }
    }

    pub fn asset_partition(&self, path: &str) -> Partition {
        Partition::AssetShard(shard_for(path, self.shard_count))
    }

    /// Cached state of a document.
    pub async fn get_document(&self, collection_id: &str, item_id: &str) -> Option<CacheEntry> {
        self.get(&Partition::Collection(collection_id.to_string()), item_id)
            .await
    }

    /// Record a document upload. Rewrites the collection's blob.
    pub async fn put_document(
        &self,
        collection_id: &str,
        item_id: &str,
        entry: CacheEntry,
    ) -> Result<(), SyncError> {
        self.update(&Partition::Collection(collection_id.to_string()), |entries| {
            entries.insert(item_id.to_string(), entry);
        })
        .await
    }

    /// Cached state of an attachment.
    pub async fn get_asset(&self, path: &str) -> Option<CacheEntry> {
        self.get(&self.asset_partition(path), path).await
    }

    /// Record an attachment upload. Rewrites the owning shard's blob.
    pub async fn put_asset(&self, path: &str, entry: CacheEntry) -> Result<(), SyncError> {
        self.update(&self.asset_partition(path), |entries| {
            entries.insert(path.to_string(), entry);
        })
        .await
    }

    /// Record several attachment uploads with one blob write per touched shard.
    pub async fn put_assets(&self, entries: Vec<(String, CacheEntry)>) -> Result<(), SyncError> {
        let mut by_shard: HashMap<Partition, Vec<(String, CacheEntry)>> = HashMap::new();
        for (path, entry) in entries {
            by_shard
                .entry(self.asset_partition(&path))
                .or_default()
                .push((path, entry));
        }

        for (partition, batch) in by_shard {
            self.update(&partition, |entries| entries.extend(batch))
                .await?;
        }
        Ok(())
    }

    /// Number of entries in a partition.
    pub async fn partition_len(&self, partition: &Partition) -> usize {
        let slot = self.slot(partition);
        let mut guard = slot.lock().await;
        let entries = match guard.take() {
            Some(entries) => entries,
            None => self.load_partition(partition).await,
        };
        let len = entries.len();
        *guard = Some(entries);
        len
    }

    /// Delete every persisted partition and forget the in-memory state.
    ///
    /// Returns the number of blobs deleted.
    pub async fn clear(&self) -> Result<usize, SyncError> {
        let keys = self.store.list_keys(CACHE_PREFIX).await?;
        let mut deleted = 0;
        for key in &keys {
            if self.store.delete_blob(key).await? {
                deleted += 1;
            }
        }
        self.partitions.clear();
        warn!("Cleared fingerprint cache ({} blobs)", deleted);
        Ok(deleted)
    }

    fn slot(&self, partition: &Partition) -> PartitionSlot {
        self.partitions
            .entry(partition.clone())
            .or_default()
            .clone()
    }

    async fn get(&self, partition: &Partition, item_id: &str) -> Option<CacheEntry> {
        let slot = self.slot(partition);
        let mut guard = slot.lock().await;
        let entries = match guard.take() {
            Some(entries) => entries,
            None => self.load_partition(partition).await,
        };
        let found = entries.get(item_id).cloned();
        *guard = Some(entries);
        found
    }

    async fn update<F>(&self, partition: &Partition, mutator: F) -> Result<(), SyncError>
    where
        F: FnOnce(&mut Entries),
    {
        let slot = self.slot(partition);
        let mut guard = slot.lock().await;
        let mut entries = match guard.take() {
            Some(entries) => entries,
            None => self.load_partition(partition).await,
        };

        mutator(&mut entries);

        let result = self.save_partition(partition, &entries).await;
        *guard = Some(entries);
        result
    }

    #[instrument(skip(self), level = "debug")]
    async fn load_partition(&self, partition: &Partition) -> Entries {
        let key = partition.blob_key();
        let bytes = match self.store.load_blob(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Entries::new(),
            Err(e) => {
                warn!("Cache partition {} unreadable, treating as empty: {}", key, e);
                return Entries::new();
            }
        };

        match serde_json::from_slice::<PartitionBlob>(&bytes) {
            Ok(blob) if blob.version == CACHE_FORMAT_VERSION => {
                debug!("Loaded cache partition {} ({} entries)", key, blob.entries.len());
                blob.entries
            }
            Ok(blob) => {
                warn!(
                    "Cache partition {} has format version {}, treating as empty",
                    key, blob.version
                );
                Entries::new()
            }
            Err(e) => {
                warn!("Cache partition {} is corrupt, treating as empty: {}", key, e);
                Entries::new()
            }
        }
    }

    async fn save_partition(&self, partition: &Partition, entries: &Entries) -> Result<(), SyncError> {
        #[derive(Serialize)]
        struct PartitionBlobRef<'a> {
            version: u32,
            entries: &'a Entries,
        }

        let key = partition.blob_key();
        let bytes = serde_json::to_vec(&PartitionBlobRef {
            version: CACHE_FORMAT_VERSION,
            entries,
        })?;
        self.store.save_blob(&key, &bytes).await?;
        debug!("Saved cache partition {} ({} entries)", key, entries.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_core::MemoryBlobStore;

    fn entry(id: &str, fp: &str) -> CacheEntry {
        CacheEntry {
            item_id: id.to_string(),
            collection_id: None,
            remote_path: format!("assets/{}", id),
            fingerprint: fp.to_string(),
            revision: "rev-1".to_string(),
            synced_at: 1_700_000_000,
            size: Some(3),
        }
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_shard_is_stable() {
        for path in ["assets/a.png", "assets/deep/b.pdf", ""] {
            let first = shard_for(path, ASSET_SHARD_COUNT);
            for _ in 0..10 {
                assert_eq!(shard_for(path, ASSET_SHARD_COUNT), first);
            }
            assert!(first < ASSET_SHARD_COUNT);
        }
    }

    #[test]
    fn test_shard_distribution_is_roughly_uniform() {
        let samples = 16_000;
        let mut counts = [0usize; ASSET_SHARD_COUNT];
        for i in 0..samples {
            counts[shard_for(&format!("assets/file-{}.png", i), ASSET_SHARD_COUNT)] += 1;
        }

        let expected = samples / ASSET_SHARD_COUNT;
        for (shard, count) in counts.iter().enumerate() {
            assert!(
                *count > expected * 3 / 4 && *count < expected * 5 / 4,
                "shard {} got {} of {} samples",
                shard,
                count,
                samples
            );
        }
    }

    #[test]
    fn test_partition_keys() {
        assert_eq!(
            Partition::Collection("nb/1".to_string()).blob_key(),
            "cache/docs/nb%2F1"
        );
        assert_eq!(
            Partition::Collection("nb_1".to_string()).blob_key(),
            "cache/docs/nb_1"
        );
        assert_eq!(Partition::AssetShard(3).blob_key(), "cache/assets/03");
    }

    #[tokio::test]
    async fn test_put_persists_across_instances() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let cache = FingerprintCache::new(store.clone());

        let mut doc = entry("plan", "h0");
        doc.collection_id = Some("notes".to_string());
        cache.put_document("notes", "plan", doc.clone()).await.unwrap();
        cache
            .put_asset("assets/a.png", entry("assets/a.png", "h-a"))
            .await
            .unwrap();

        let reopened = FingerprintCache::new(store);
        assert_eq!(reopened.get_document("notes", "plan").await, Some(doc));
        assert_eq!(
            reopened.get_asset("assets/a.png").await.unwrap().fingerprint,
            "h-a"
        );
        assert!(reopened.get_document("other", "plan").await.is_none());
    }

    #[tokio::test]
    async fn test_similar_collection_ids_use_separate_blobs() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let cache = FingerprintCache::new(store.clone());
        cache
            .put_document("a/b", "plan", entry("plan", "h-slash"))
            .await
            .unwrap();
        cache
            .put_document("a_b", "plan", entry("plan", "h-underscore"))
            .await
            .unwrap();

        let reopened = FingerprintCache::new(store.clone());
        assert_eq!(
            reopened.get_document("a/b", "plan").await.unwrap().fingerprint,
            "h-slash"
        );
        assert_eq!(
            reopened.get_document("a_b", "plan").await.unwrap().fingerprint,
            "h-underscore"
        );
        assert_eq!(store.list_keys("cache/docs/").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_partition_fails_open() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        store
            .save_blob("cache/docs/notes", b"{ not json")
            .await
            .unwrap();

        let cache = FingerprintCache::new(store.clone());
        assert!(cache.get_document("notes", "plan").await.is_none());

        // Writing after corruption replaces the blob with a readable one
        cache
            .put_document("notes", "plan", entry("plan", "h1"))
            .await
            .unwrap();
        let reopened = FingerprintCache::new(store);
        assert_eq!(
            reopened.get_document("notes", "plan").await.unwrap().fingerprint,
            "h1"
        );
    }

    #[tokio::test]
    async fn test_unknown_format_version_is_empty() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        store
            .save_blob("cache/docs/notes", br#"{"version": 99, "entries": {}}"#)
            .await
            .unwrap();
        let cache = FingerprintCache::new(store);
        assert_eq!(
            cache
                .partition_len(&Partition::Collection("notes".to_string()))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_concurrent_puts_on_one_shard_keep_all_entries() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let cache = Arc::new(FingerprintCache::with_shard_count(store.clone(), 1));

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let path = format!("assets/{}.png", i);
                    cache.put_asset(&path, entry(&path, "h")).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let reopened = FingerprintCache::with_shard_count(store, 1);
        assert_eq!(reopened.partition_len(&Partition::AssetShard(0)).await, 32);
    }

    #[tokio::test]
    async fn test_put_assets_batches_per_shard() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let cache = FingerprintCache::new(store.clone());

        let batch: Vec<_> = (0..40)
            .map(|i| {
                let path = format!("assets/{}.bin", i);
                let e = entry(&path, "h");
                (path, e)
            })
            .collect();
        cache.put_assets(batch).await.unwrap();

        let keys = store.list_keys("cache/assets/").await.unwrap();
        assert!(!keys.is_empty() && keys.len() <= ASSET_SHARD_COUNT);
        assert!(cache.get_asset("assets/17.bin").await.is_some());
    }

    #[tokio::test]
    async fn test_clear_removes_all_partitions() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        store.save_blob("history/runs", b"[]").await.unwrap();
        let cache = FingerprintCache::new(store.clone());
        cache.put_document("a", "x", entry("x", "h")).await.unwrap();
        cache.put_document("b", "y", entry("y", "h")).await.unwrap();
        cache.put_asset("assets/z", entry("z", "h")).await.unwrap();

        assert_eq!(cache.clear().await.unwrap(), 3);
        assert!(cache.get_document("a", "x").await.is_none());
        assert!(store.load_blob("history/runs").await.unwrap().is_some());
    }
}
