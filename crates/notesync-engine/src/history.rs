//! Run history and aggregate statistics, persisted in host persistence.

use std::collections::VecDeque;
use std::sync::Arc;

use notesync_core::{BlobStore, SyncError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::result::SyncRunResult;

pub const HISTORY_KEY: &str = "history/runs";
pub const STATS_KEY: &str = "history/stats";

/// Maximum number of run records kept; the oldest are evicted first.
pub const MAX_HISTORY_RECORDS: usize = 50;

/// Failure messages copied into a run record.
const MAX_RECORDED_FAILURES: usize = 10;

/// Summary of one run, as kept in the history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub started_at: i64,
    pub duration_ms: u64,
    pub device: String,
    pub documents_uploaded: usize,
    pub documents_failed: usize,
    pub assets_uploaded: usize,
    pub assets_failed: usize,
    #[serde(default)]
    pub failures: Vec<String>,
}

impl RunRecord {
    pub fn from_result(result: &SyncRunResult, device: &str) -> Self {
        Self {
            started_at: result.started_at.timestamp(),
            duration_ms: result.elapsed.as_millis() as u64,
            device: device.to_string(),
            documents_uploaded: result.documents.uploaded,
            documents_failed: result.documents.failed,
            assets_uploaded: result.assets.uploaded,
            assets_failed: result.assets.failed,
            failures: result
                .failures
                .iter()
                .take(MAX_RECORDED_FAILURES)
                .map(|f| format!("{}: {}", f.path, f.error))
                .collect(),
        }
    }
}

/// Totals across all runs of this device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStatistics {
    pub total_runs: u64,
    pub total_uploaded: u64,
    pub total_failed: u64,
    pub last_run_at: Option<i64>,
    pub last_success_at: Option<i64>,
}

/// Append-only, capped run log plus statistics.
pub struct RunHistory {
    store: Arc<dyn BlobStore>,
    max_records: usize,
    write_lock: Mutex<()>,
}

impl RunHistory {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self::with_capacity(store, MAX_HISTORY_RECORDS)
    }

    pub fn with_capacity(store: Arc<dyn BlobStore>, max_records: usize) -> Self {
        Self {
            store,
            max_records: max_records.max(1),
            write_lock: Mutex::new(()),
        }
    }

    /// Append a run to the log and fold it into the statistics.
    pub async fn record(&self, result: &SyncRunResult, device: &str) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;
        let record = RunRecord::from_result(result, device);

        let mut records: VecDeque<RunRecord> = self.load_or_default(HISTORY_KEY).await;
        records.push_back(record.clone());
        while records.len() > self.max_records {
            records.pop_front();
        }
        self.store
            .save_blob(HISTORY_KEY, &serde_json::to_vec(&records)?)
            .await?;

        let mut stats: SyncStatistics = self.load_or_default(STATS_KEY).await;
        let failed = (record.documents_failed + record.assets_failed) as u64;
        stats.total_runs += 1;
        stats.total_uploaded += (record.documents_uploaded + record.assets_uploaded) as u64;
        stats.total_failed += failed;
        stats.last_run_at = Some(record.started_at);
        if failed == 0 {
            stats.last_success_at = Some(record.started_at);
        }
        self.store
            .save_blob(STATS_KEY, &serde_json::to_vec(&stats)?)
            .await
    }

    /// Run records, oldest first.
    pub async fn records(&self) -> Vec<RunRecord> {
        self.load_or_default::<VecDeque<RunRecord>>(HISTORY_KEY)
            .await
            .into()
    }

    pub async fn statistics(&self) -> SyncStatistics {
        self.load_or_default(STATS_KEY).await
    }

    async fn load_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        match self.store.load_blob(key).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("{} is corrupt, starting over: {}", key, e);
                T::default()
            }),
            Ok(None) => T::default(),
            Err(e) => {
                warn!("{} unreadable, starting over: {}", key, e);
                T::default()
            }
        }
    }
}
