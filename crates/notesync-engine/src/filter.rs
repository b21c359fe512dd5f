use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use notesync_core::{FilterSettings, SyncError};

/// Which ignore rule excluded an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Collection,
    Path,
    Tag,
}

/// Compiled ignore filters. All patterns are case-insensitive globs.
#[derive(Debug, Clone)]
pub struct IgnoreFilter {
    collections: GlobSet,
    paths: GlobSet,
    tags: GlobSet,
}

impl IgnoreFilter {
    pub fn new(settings: &FilterSettings) -> Result<Self, SyncError> {
        Ok(Self {
            collections: build_set(&settings.collections)?,
            paths: build_set(&settings.paths)?,
            tags: build_set(&settings.tags)?,
        })
    }

    pub fn is_collection_ignored(&self, name: &str) -> bool {
        self.collections.is_match(name)
    }

    /// Check a document against the collection, path and tag rules, in that order.
    pub fn check(&self, collection_name: &str, path: &str, tags: &[String]) -> Option<IgnoreReason> {
        if self.is_collection_ignored(collection_name) {
            return Some(IgnoreReason::Collection);
        }
        if self.paths.is_match(path.trim_start_matches('/')) {
            return Some(IgnoreReason::Path);
        }
        if tags.iter().any(|tag| self.tags.is_match(tag.trim_start_matches('#'))) {
            return Some(IgnoreReason::Tag);
        }
        None
    }

    /// Check an attachment path against the path rules.
    pub fn is_path_ignored(&self, path: &str) -> bool {
        self.paths.is_match(path.trim_start_matches('/'))
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet, SyncError> {
    patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .try_fold(&mut GlobSetBuilder::new(), |builder, pattern| {
            GlobBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map(|glob| builder.add(glob))
                .map_err(|e| SyncError::Config(format!("Invalid ignore pattern {:?}: {}", pattern, e)))
        })?
        .build()
        .map_err(|e| SyncError::Config(format!("Invalid ignore patterns: {}", e)))
}
