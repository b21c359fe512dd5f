//! Incremental sync engine.
//!
//! - `FingerprintCache`: Sharded, persisted content fingerprints of synced items
//! - `RemoteWriter`: Revision-checked writes with a single conflict retry
//! - `SyncOrchestrator`: Scan, classify and upload one run
//! - `DistributedLock`: Best-effort cross-device lock on a remote file
//! - `AutoSyncScheduler`: Periodic runs behind an owned handle
//! - `SyncEngine`: Facade tying the pieces together

mod cache;
mod engine;
mod filter;
mod history;
mod lock;
mod orchestrator;
mod result;
mod scheduler;
mod writer;

#[cfg(test)]
mod test_support;

pub use cache::{fingerprint, shard_for, CacheEntry, FingerprintCache, Partition, ASSET_SHARD_COUNT};
pub use engine::{CacheClear, Confirmed, RunOutcome, SyncEngine, Unconfirmed};
pub use filter::{IgnoreFilter, IgnoreReason};
pub use history::{RunHistory, RunRecord, SyncStatistics, HISTORY_KEY, MAX_HISTORY_RECORDS, STATS_KEY};
pub use lock::{DistributedLock, LockOutcome, LockRecord, SkipReason, LOCK_PATH};
pub use orchestrator::{ProgressSink, SilentProgress, SyncMode, SyncOrchestrator};
pub use result::{ItemClass, ItemCounts, SyncFailure, SyncRunResult};
pub use scheduler::{AutoSyncScheduler, SchedulerState};
pub use writer::{RemoteWriter, MAX_WRITE_ATTEMPTS};
