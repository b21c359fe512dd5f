use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Class of a synced item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemClass {
    Document,
    Asset,
}

/// Per-class counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ItemCounts {
    /// Items enumerated from the source
    pub scanned: usize,
    /// Items excluded by ignore filters
    pub ignored: usize,
    /// Items whose fingerprint differs from the cache
    pub changed: usize,
    pub uploaded: usize,
    /// Items whose fingerprint matches the cache
    pub skipped: usize,
    pub failed: usize,
}

/// One item that could not be synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub class: ItemClass,
    pub path: String,
    pub error: String,
}

/// Report of one orchestrator run.
///
/// Built up while the run progresses and never mutated once returned.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunResult {
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub documents: ItemCounts,
    pub assets: ItemCounts,
    /// Failures in the order they were observed
    pub failures: Vec<SyncFailure>,
    #[serde(skip)]
    clock: Option<Instant>,
}

impl SyncRunResult {
    pub(crate) fn begin() -> Self {
        Self {
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            documents: ItemCounts::default(),
            assets: ItemCounts::default(),
            failures: Vec::new(),
            clock: Some(Instant::now()),
        }
    }

    pub(crate) fn finish(mut self) -> Self {
        if let Some(clock) = self.clock.take() {
            self.elapsed = clock.elapsed();
        }
        self
    }

    pub(crate) fn counts_mut(&mut self, class: ItemClass) -> &mut ItemCounts {
        match class {
            ItemClass::Document => &mut self.documents,
            ItemClass::Asset => &mut self.assets,
        }
    }

    pub(crate) fn record_failure(
        &mut self,
        class: ItemClass,
        path: impl Into<String>,
        error: impl fmt::Display,
    ) {
        self.counts_mut(class).failed += 1;
        self.failures.push(SyncFailure {
            class,
            path: path.into(),
            error: error.to_string(),
        });
    }

    pub fn total_uploaded(&self) -> usize {
        self.documents.uploaded + self.assets.uploaded
    }

    pub fn total_failed(&self) -> usize {
        self.documents.failed + self.assets.failed
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// One-line summary for logs and status bars.
    pub fn summary(&self) -> String {
        format!(
            "documents: {} uploaded, {} unchanged, {} ignored, {} failed; assets: {} uploaded, {} unchanged, {} failed; {:.1}s",
            self.documents.uploaded,
            self.documents.skipped,
            self.documents.ignored,
            self.documents.failed,
            self.assets.uploaded,
            self.assets.skipped,
            self.assets.failed,
            self.elapsed.as_secs_f64()
        )
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
