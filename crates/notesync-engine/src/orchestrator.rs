//! Sync orchestrator: one run from source scan to cache update.
//!
//! ## Run flow
//!
//! 1. **Validate**: configuration errors abort before any item is touched
//! 2. **Scan**: enumerate collections and documents, drop ignored items
//! 3. **Classify**: fingerprint each item, compare with the cache
//! 4. **Upload**: changed items in windows of `settings.concurrency`; a window
//!    finishes before the next one starts, failures stay per item
//! 5. **Bookkeeping**: cache entries after confirmed writes, run history

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::future::join_all;
use notesync_core::{
    AssetRef, DeviceIdentity, DocumentSource, ItemMetadata, ItemRef, Settings, SyncError,
};
use tracing::{debug, info, instrument, warn};

use crate::cache::{fingerprint, CacheEntry, FingerprintCache};
use crate::filter::IgnoreFilter;
use crate::history::RunHistory;
use crate::result::{ItemClass, SyncRunResult};
use crate::writer::RemoteWriter;

/// Placeholder path for failures not tied to one item.
const SOURCE_PATH: &str = "<source>";

/// What a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Documents, then every attachment in a separate asset phase
    Full,
    /// Documents only; attachments are left for an asset run
    DocumentsOnly,
    /// Documents, each followed by the attachments it references
    DocumentsWithAttachments,
    /// The asset phase only
    AssetsOnly,
}

impl SyncMode {
    /// Default mode for a settings snapshot.
    pub fn for_settings(settings: &Settings) -> Self {
        match settings.attachments {
            notesync_core::AttachmentMode::Inline => SyncMode::DocumentsWithAttachments,
            notesync_core::AttachmentMode::Deferred => SyncMode::Full,
        }
    }

    fn syncs_documents(self) -> bool {
        !matches!(self, SyncMode::AssetsOnly)
    }

    fn inline_attachments(self) -> bool {
        matches!(self, SyncMode::DocumentsWithAttachments)
    }

    fn runs_asset_phase(self) -> bool {
        matches!(self, SyncMode::Full | SyncMode::AssetsOnly)
    }
}

/// Receives human-readable status lines during a run.
pub trait ProgressSink: Send + Sync {
    fn report(&self, message: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn report(&self, message: &str) {
        self(message)
    }
}

/// Progress sink that drops every message.
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn report(&self, _message: &str) {}
}

struct DocumentJob {
    item: ItemRef,
    metadata: ItemMetadata,
    content: Vec<u8>,
    fingerprint: String,
}

struct AssetJob {
    path: String,
    content: Vec<u8>,
    fingerprint: String,
}

/// State shared by the items of one run.
struct RunContext<'a> {
    settings: &'a Settings,
    filter: IgnoreFilter,
    progress: &'a dyn ProgressSink,
    result: Mutex<SyncRunResult>,
    /// Attachments already handled in this run
    seen_assets: Mutex<HashSet<String>>,
}

impl RunContext<'_> {
    fn result(&self) -> MutexGuard<'_, SyncRunResult> {
        self.result.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn fail(&self, class: ItemClass, path: &str, error: &SyncError) {
        warn!("Failed to sync {}: {}", path, error);
        self.result().record_failure(class, path, error);
    }

    /// Returns `false` if the attachment was already handled in this run.
    fn claim_asset(&self, path: &str) -> bool {
        self.seen_assets
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(path.to_string())
    }
}

/// Runs incremental syncs of a document source into the remote store.
pub struct SyncOrchestrator {
    source: Arc<dyn DocumentSource>,
    writer: RemoteWriter,
    cache: Arc<FingerprintCache>,
    history: Arc<RunHistory>,
    device: DeviceIdentity,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        writer: RemoteWriter,
        cache: Arc<FingerprintCache>,
        history: Arc<RunHistory>,
        device: DeviceIdentity,
    ) -> Self {
        Self {
            source,
            writer,
            cache,
            history,
            device,
        }
    }

    pub fn cache(&self) -> &Arc<FingerprintCache> {
        &self.cache
    }

    pub fn history(&self) -> &Arc<RunHistory> {
        &self.history
    }

    /// Configuration checks that must pass before a run touches the remote.
    pub fn preflight(settings: &Settings) -> Result<IgnoreFilter, SyncError> {
        settings.validate()?;
        IgnoreFilter::new(&settings.filters)
    }

    /// Execute one run.
    ///
    /// Only configuration errors are returned as `Err`; every item-level
    /// error ends up in the result's failure list.
    #[instrument(skip(self, settings, progress), level = "debug")]
    pub async fn run(
        &self,
        settings: &Settings,
        mode: SyncMode,
        progress: &dyn ProgressSink,
    ) -> Result<SyncRunResult, SyncError> {
        let filter = Self::preflight(settings)?;

        let ctx = RunContext {
            settings,
            filter,
            progress,
            result: Mutex::new(SyncRunResult::begin()),
            seen_assets: Mutex::new(HashSet::new()),
        };

        info!(
            "Starting sync run ({:?}) on {} via {}",
            mode,
            self.device.name,
            self.writer.remote().backend_name()
        );

        if mode.syncs_documents() {
            self.sync_documents(&ctx, mode.inline_attachments()).await;
        }
        if mode.runs_asset_phase() {
            self.sync_assets(&ctx).await;
        }

        let result = ctx
            .result
            .into_inner()
            .unwrap_or_else(|p| p.into_inner())
            .finish();

        if let Err(e) = self.history.record(&result, &self.device.name).await {
            warn!("Failed to record run history: {}", e);
        }

        info!("Sync run finished: {}", result.summary());
        progress.report(&format!("Sync finished: {}", result.summary()));
        Ok(result)
    }

    // =========================================================================
    // Documents
    // =========================================================================

    async fn sync_documents(&self, ctx: &RunContext<'_>, inline_attachments: bool) {
        ctx.progress.report("Scanning documents");

        let changed = match self.scan_documents(ctx).await {
            Ok(changed) => changed,
            Err(e) => {
                ctx.fail(ItemClass::Document, SOURCE_PATH, &e);
                return;
            }
        };

        if changed.is_empty() {
            ctx.progress.report("No document changes");
            return;
        }

        ctx.progress
            .report(&format!("Uploading {} changed documents", changed.len()));

        for window in changed.chunks(ctx.settings.concurrency) {
            join_all(
                window
                    .iter()
                    .map(|job| self.upload_document(ctx, job, inline_attachments)),
            )
            .await;
        }
    }

    /// Enumerate, filter and classify documents. Returns the changed ones.
    async fn scan_documents(&self, ctx: &RunContext<'_>) -> Result<Vec<DocumentJob>, SyncError> {
        let collections = self.source.list_collections().await?;
        let mut changed = Vec::new();

        for collection in collections {
            let items = match self.source.list_items_under(&collection.id).await {
                Ok(items) => items,
                Err(e) => {
                    ctx.fail(ItemClass::Document, &collection.name, &e);
                    continue;
                }
            };

            if ctx.filter.is_collection_ignored(&collection.name) {
                debug!(
                    "Ignoring collection {} ({} documents)",
                    collection.name,
                    items.len()
                );
                let mut result = ctx.result();
                result.documents.scanned += items.len();
                result.documents.ignored += items.len();
                continue;
            }

            for item in items {
                ctx.result().documents.scanned += 1;
                if let Some(job) = self.classify_document(ctx, &collection.name, item).await {
                    changed.push(job);
                }
            }
        }

        Ok(changed)
    }

    async fn classify_document(
        &self,
        ctx: &RunContext<'_>,
        collection_name: &str,
        item: ItemRef,
    ) -> Option<DocumentJob> {
        let metadata = match self.source.get_item_metadata(&item.id).await {
            Ok(metadata) => metadata,
            Err(e) => {
                ctx.fail(ItemClass::Document, &item.id, &e);
                return None;
            }
        };

        if let Some(reason) = ctx
            .filter
            .check(collection_name, &metadata.path, &metadata.tags)
        {
            debug!("Ignoring {} ({:?} rule)", metadata.path, reason);
            ctx.result().documents.ignored += 1;
            return None;
        }

        let content = match self.source.export_item_content(&item.id).await {
            Ok(content) => content.into_bytes(),
            Err(e) => {
                ctx.fail(ItemClass::Document, &metadata.path, &e);
                return None;
            }
        };

        let fingerprint = fingerprint(&content);
        let cached = self
            .cache
            .get_document(&item.collection_id, &item.id)
            .await;

        if cached.is_some_and(|entry| entry.fingerprint == fingerprint) {
            ctx.result().documents.skipped += 1;
            return None;
        }

        ctx.result().documents.changed += 1;
        Some(DocumentJob {
            item,
            metadata,
            content,
            fingerprint,
        })
    }

    async fn upload_document(&self, ctx: &RunContext<'_>, job: &DocumentJob, inline_attachments: bool) {
        let relative = format!("{}.md", job.metadata.path.trim_start_matches('/'));
        let remote_path = ctx.settings.remote.remote_path(&relative);
        let message = format!("notesync: update {} from {}", relative, self.device.name);

        let revision = match self
            .writer
            .write_or_update(&remote_path, &job.content, &message)
            .await
        {
            Ok(revision) => revision,
            Err(e) => {
                ctx.fail(ItemClass::Document, &job.metadata.path, &e);
                return;
            }
        };

        let entry = CacheEntry {
            item_id: job.item.id.clone(),
            collection_id: Some(job.item.collection_id.clone()),
            remote_path: remote_path.clone(),
            fingerprint: job.fingerprint.clone(),
            revision,
            synced_at: Utc::now().timestamp(),
            size: Some(job.content.len() as u64),
        };
        if let Err(e) = self
            .cache
            .put_document(&job.item.collection_id, &job.item.id, entry)
            .await
        {
            warn!("Uploaded {} but could not update the cache: {}", remote_path, e);
        }

        ctx.result().documents.uploaded += 1;
        ctx.progress.report(&format!("Uploaded {}", relative));

        if inline_attachments {
            self.sync_document_assets(ctx, &job.item.id).await;
        }
    }

    async fn sync_document_assets(&self, ctx: &RunContext<'_>, item_id: &str) {
        let assets = match self.source.referenced_assets(item_id).await {
            Ok(assets) => assets,
            Err(e) => {
                ctx.fail(ItemClass::Asset, item_id, &e);
                return;
            }
        };

        for asset in assets {
            if !ctx.claim_asset(&asset.path) {
                continue;
            }
            if let Some(job) = self.classify_asset(ctx, &asset).await {
                if let Some((path, entry)) = self.upload_asset(ctx, &job).await {
                    if let Err(e) = self.cache.put_asset(&path, entry).await {
                        warn!("Uploaded {} but could not update the cache: {}", path, e);
                    }
                }
            }
        }
    }

    // =========================================================================
    // Assets
    // =========================================================================

    async fn sync_assets(&self, ctx: &RunContext<'_>) {
        ctx.progress.report("Scanning attachments");

        let assets = match self.source.list_assets().await {
            Ok(assets) => assets,
            Err(e) => {
                ctx.fail(ItemClass::Asset, SOURCE_PATH, &e);
                return;
            }
        };

        let mut changed = Vec::new();
        for asset in &assets {
            if !ctx.claim_asset(&asset.path) {
                continue;
            }
            if let Some(job) = self.classify_asset(ctx, asset).await {
                changed.push(job);
            }
        }

        if changed.is_empty() {
            ctx.progress.report("No attachment changes");
            return;
        }

        ctx.progress
            .report(&format!("Uploading {} changed attachments", changed.len()));

        for window in changed.chunks(ctx.settings.concurrency) {
            let uploaded: Vec<_> = join_all(window.iter().map(|job| self.upload_asset(ctx, job)))
                .await
                .into_iter()
                .flatten()
                .collect();

            if let Err(e) = self.cache.put_assets(uploaded).await {
                warn!("Could not update the attachment cache: {}", e);
            }
        }
    }

    async fn classify_asset(&self, ctx: &RunContext<'_>, asset: &AssetRef) -> Option<AssetJob> {
        ctx.result().assets.scanned += 1;

        if ctx.filter.is_path_ignored(&asset.path) {
            ctx.result().assets.ignored += 1;
            return None;
        }

        let content = match self.source.read_asset(&asset.path).await {
            Ok(content) => content,
            Err(e) => {
                ctx.fail(ItemClass::Asset, &asset.path, &e);
                return None;
            }
        };

        let fingerprint = fingerprint(&content);
        if self
            .cache
            .get_asset(&asset.path)
            .await
            .is_some_and(|entry| entry.fingerprint == fingerprint)
        {
            ctx.result().assets.skipped += 1;
            return None;
        }

        ctx.result().assets.changed += 1;
        Some(AssetJob {
            path: asset.path.clone(),
            content,
            fingerprint,
        })
    }

    /// Upload one attachment. Returns the cache entry to record on success.
    async fn upload_asset(&self, ctx: &RunContext<'_>, job: &AssetJob) -> Option<(String, CacheEntry)> {
        let remote_path = ctx.settings.remote.remote_path(&job.path);
        let message = format!("notesync: update {} from {}", job.path, self.device.name);

        match self
            .writer
            .write_or_update(&remote_path, &job.content, &message)
            .await
        {
            Ok(revision) => {
                ctx.result().assets.uploaded += 1;
                ctx.progress.report(&format!("Uploaded {}", job.path));
                Some((
                    job.path.clone(),
                    CacheEntry {
                        item_id: job.path.clone(),
                        collection_id: None,
                        remote_path,
                        fingerprint: job.fingerprint.clone(),
                        revision,
                        synced_at: Utc::now().timestamp(),
                        size: Some(job.content.len() as u64),
                    },
                ))
            }
            Err(e) => {
                ctx.fail(ItemClass::Asset, &job.path, &e);
                None
            }
        }
    }
}
