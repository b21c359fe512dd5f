//! Cross-device advisory lock built on a well-known remote file.
//!
//! The remote store has no atomic create-if-absent, so this is a
//! contention-reduction protocol, not a mutual exclusion guarantee:
//!
//! 1. Lock disabled: run the body directly
//! 2. Unexpired lock record present: skip
//! 3. Remote activity newer than the first threshold: skip
//! 4. Sleep a random jitter
//! 5. Remote activity newer than the second threshold: skip
//! 6. Write the lock record, conditioned on the revision seen in step 2
//! 7. Run the body
//! 8. Delete the lock record on every exit path
//!
//! A record whose deletion failed stops blocking other devices once it expires.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notesync_core::{DeviceIdentity, LockSettings, RemoteStore, Settings, SyncError, WriteOutcome};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// Lock record location, relative to the remote root directory.
pub const LOCK_PATH: &str = ".notesync/lock.json";

/// Content of the remote lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder_id: String,
    pub holder_name: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(device: &DeviceIdentity, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            holder_id: device.id.clone(),
            holder_name: device.name.clone(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Why a run did not happen. None of these are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Another device holds an unexpired lock
    LockHeld {
        holder: String,
        expires_at: DateTime<Utc>,
    },
    /// The remote store was written too recently
    RecentActivity {
        at: DateTime<Utc>,
        threshold_secs: u64,
    },
    /// The lock file changed under us while writing our record
    LockContended,
    /// A run is already in progress in this process
    RunInProgress,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::LockHeld { holder, expires_at } => write!(
                f,
                "locked by {} until {}",
                holder,
                expires_at.to_rfc3339()
            ),
            SkipReason::RecentActivity { at, threshold_secs } => write!(
                f,
                "remote written at {} (within {}s)",
                at.to_rfc3339(),
                threshold_secs
            ),
            SkipReason::LockContended => write!(f, "lock contended by another device"),
            SkipReason::RunInProgress => write!(f, "a sync run is already in progress"),
        }
    }
}

/// Outcome of a guarded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    Acquired(T),
    Skipped(SkipReason),
}

/// Best-effort cross-device mutex.
pub struct DistributedLock {
    remote: Arc<dyn RemoteStore>,
    device: DeviceIdentity,
}

impl DistributedLock {
    pub fn new(remote: Arc<dyn RemoteStore>, device: DeviceIdentity) -> Self {
        Self { remote, device }
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    /// Run `body` while holding the remote lock, or skip under contention.
    #[instrument(skip(self, settings, body), level = "debug")]
    pub async fn with_lock<F, Fut, T>(
        &self,
        settings: &Settings,
        body: F,
    ) -> Result<LockOutcome<T>, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let lock = &settings.lock;
        if !lock.enabled {
            return body().await.map(LockOutcome::Acquired);
        }

        let lock_path = settings.remote.remote_path(LOCK_PATH);

        let (observed, record) = self.read_record(&lock_path).await?;
        if let Some(record) = record {
            if !record.is_expired_at(Utc::now()) {
                debug!("Lock held by {} until {}", record.holder_name, record.expires_at);
                return Ok(LockOutcome::Skipped(SkipReason::LockHeld {
                    holder: record.holder_name,
                    expires_at: record.expires_at,
                }));
            }
            info!(
                "Ignoring expired lock of {} (expired {})",
                record.holder_name, record.expires_at
            );
        }

        if let Some(reason) = self
            .check_activity(lock.first_check_threshold())
            .await?
        {
            return Ok(LockOutcome::Skipped(reason));
        }

        let jitter = jitter_delay(lock);
        debug!("Sleeping {}ms before re-checking remote activity", jitter.as_millis());
        tokio::time::sleep(jitter).await;

        if let Some(reason) = self
            .check_activity(lock.second_check_threshold())
            .await?
        {
            return Ok(LockOutcome::Skipped(reason));
        }

        let record = LockRecord::new(&self.device, Utc::now(), lock.ttl());
        let bytes = serde_json::to_vec_pretty(&record)?;
        let message = format!("notesync: lock by {}", self.device.name);
        // No refetch: a record created since the first read must make this write conflict
        match self
            .remote
            .write(&lock_path, &bytes, observed.as_deref(), &message)
            .await?
        {
            WriteOutcome::Written(revision) => debug!("Lock record written at {}", revision),
            WriteOutcome::Conflict => {
                warn!("Lost the race for the lock: {} changed since it was read", lock_path);
                return Ok(LockOutcome::Skipped(SkipReason::LockContended));
            }
        }
        info!("Acquired sync lock until {}", record.expires_at);

        let result = body().await;

        self.release(&lock_path, &record).await;

        result.map(LockOutcome::Acquired)
    }

    /// Revision and content of the lock file.
    ///
    /// The revision is read first, so a record replaced between the two
    /// reads leaves a stale revision and the later write conflicts.
    async fn read_record(
        &self,
        lock_path: &str,
    ) -> Result<(Option<String>, Option<LockRecord>), SyncError> {
        let Some(metadata) = self.remote.get_metadata(lock_path).await? else {
            return Ok((None, None));
        };
        let Some(bytes) = self.remote.read(lock_path).await? else {
            return Ok((Some(metadata.revision), None));
        };

        match serde_json::from_slice::<LockRecord>(&bytes) {
            Ok(record) => Ok((Some(metadata.revision), Some(record))),
            Err(e) => {
                warn!("Unreadable lock record at {}, treating as absent: {}", lock_path, e);
                Ok((Some(metadata.revision), None))
            }
        }
    }

    async fn check_activity(
        &self,
        threshold: chrono::Duration,
    ) -> Result<Option<SkipReason>, SyncError> {
        let Some(at) = self.remote.latest_activity().await? else {
            return Ok(None);
        };

        if Utc::now() - at < threshold {
            let threshold_secs = threshold.num_seconds().max(0) as u64;
            debug!("Remote activity at {} is within {}s", at, threshold_secs);
            return Ok(Some(SkipReason::RecentActivity { at, threshold_secs }));
        }
        Ok(None)
    }

    async fn release(&self, lock_path: &str, record: &LockRecord) {
        let message = format!("notesync: unlock by {}", self.device.name);
        match self.remote.delete(lock_path, &message).await {
            Ok(true) => debug!("Released sync lock"),
            Ok(false) => warn!("Sync lock was already gone on release"),
            Err(e) => warn!(
                "Failed to release sync lock, it expires at {}: {}",
                record.expires_at, e
            ),
        }
    }
}

fn jitter_delay(lock: &LockSettings) -> Duration {
    let (min, max) = (lock.jitter_min_ms, lock.jitter_max_ms.max(lock.jitter_min_ms));
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}
