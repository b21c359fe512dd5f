//! Public facade: one engine per application, shared by the CLI and the scheduler.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use notesync_core::{BlobStore, DeviceIdentity, DocumentSource, RemoteStore, Settings, SyncError};
use tracing::{info, instrument, warn};

use crate::cache::FingerprintCache;
use crate::history::{RunHistory, RunRecord, SyncStatistics};
use crate::lock::{DistributedLock, LockOutcome, SkipReason};
use crate::orchestrator::{ProgressSink, SilentProgress, SyncMode, SyncOrchestrator};
use crate::result::SyncRunResult;
use crate::writer::RemoteWriter;

/// Result of asking the engine for a run.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(SyncRunResult),
    Skipped(SkipReason),
}

impl RunOutcome {
    pub fn completed(&self) -> Option<&SyncRunResult> {
        match self {
            RunOutcome::Completed(result) => Some(result),
            RunOutcome::Skipped(_) => None,
        }
    }
}

/// In-process guard allowing one run at a time.
///
/// Each entry gets a fresh epoch. Leaving only clears the guard if it still
/// belongs to the same epoch, so a run abandoned by `reset` cannot release
/// the guard of a newer run.
#[derive(Default)]
pub(crate) struct RunGuard {
    state: Mutex<GuardState>,
}

#[derive(Default)]
struct GuardState {
    next_epoch: u64,
    active: Option<u64>,
}

impl RunGuard {
    fn state(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn try_enter(&self) -> Option<RunTicket<'_>> {
        let mut state = self.state();
        if state.active.is_some() {
            return None;
        }
        state.next_epoch += 1;
        let epoch = state.next_epoch;
        state.active = Some(epoch);
        Some(RunTicket { guard: self, epoch })
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state().active.is_some()
    }

    pub(crate) fn reset(&self) {
        self.state().active = None;
    }

    fn leave(&self, epoch: u64) {
        let mut state = self.state();
        if state.active == Some(epoch) {
            state.active = None;
        }
    }
}

/// Held for the duration of a run; releases the guard on drop.
pub(crate) struct RunTicket<'a> {
    guard: &'a RunGuard,
    epoch: u64,
}

impl Drop for RunTicket<'_> {
    fn drop(&mut self) {
        self.guard.leave(self.epoch);
    }
}

/// Incremental sync engine.
pub struct SyncEngine {
    orchestrator: SyncOrchestrator,
    lock: DistributedLock,
    guard: RunGuard,
    progress: Arc<dyn ProgressSink>,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn BlobStore>,
        device: DeviceIdentity,
    ) -> Self {
        let writer = RemoteWriter::new(remote);
        let orchestrator = SyncOrchestrator::new(
            source,
            writer.clone(),
            Arc::new(FingerprintCache::new(store.clone())),
            Arc::new(RunHistory::new(store)),
            device.clone(),
        );
        Self {
            orchestrator,
            lock: DistributedLock::new(writer.remote().clone(), device),
            guard: RunGuard::default(),
            progress: Arc::new(SilentProgress),
        }
    }

    /// Route status lines of every run to `progress`.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn device(&self) -> &DeviceIdentity {
        self.lock.device()
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_active()
    }

    pub(crate) fn reset_run_guard(&self) {
        self.guard.reset();
    }

    /// One run under the distributed lock.
    #[instrument(skip(self, settings), level = "debug")]
    pub async fn run_once(
        &self,
        settings: &Settings,
        mode: SyncMode,
    ) -> Result<RunOutcome, SyncError> {
        SyncOrchestrator::preflight(settings)?;
        let Some(_ticket) = self.guard.try_enter() else {
            return Ok(self.skipped(SkipReason::RunInProgress));
        };

        let progress = self.progress.as_ref();
        let orchestrator = &self.orchestrator;
        let outcome = self
            .lock
            .with_lock(settings, move || orchestrator.run(settings, mode, progress))
            .await?;

        Ok(match outcome {
            LockOutcome::Acquired(result) => RunOutcome::Completed(result),
            LockOutcome::Skipped(reason) => self.skipped(reason),
        })
    }

    /// One run that ignores the distributed lock.
    ///
    /// The in-process guard still applies.
    #[instrument(skip(self, settings), level = "debug")]
    pub async fn force_sync_overriding_lock(
        &self,
        settings: &Settings,
        mode: SyncMode,
    ) -> Result<RunOutcome, SyncError> {
        SyncOrchestrator::preflight(settings)?;
        let Some(_ticket) = self.guard.try_enter() else {
            return Ok(self.skipped(SkipReason::RunInProgress));
        };

        warn!("Forcing sync run without the distributed lock");
        let result = self
            .orchestrator
            .run(settings, mode, self.progress.as_ref())
            .await?;
        Ok(RunOutcome::Completed(result))
    }

    pub async fn history(&self) -> Vec<RunRecord> {
        self.orchestrator.history().records().await
    }

    pub async fn statistics(&self) -> SyncStatistics {
        self.orchestrator.history().statistics().await
    }

    /// Start the two-step confirmation for wiping the fingerprint cache.
    ///
    /// Nothing is deleted until both `confirm` and `confirm_again` were called.
    pub fn begin_cache_clear(&self) -> CacheClear<'_, Unconfirmed> {
        CacheClear {
            engine: self,
            _state: PhantomData,
        }
    }

    fn skipped(&self, reason: SkipReason) -> RunOutcome {
        info!("Sync run skipped: {}", reason);
        self.progress.report(&format!("Sync skipped: {}", reason));
        RunOutcome::Skipped(reason)
    }
}

/// Cache clear awaiting its first confirmation.
pub struct Unconfirmed;

/// Cache clear awaiting its second confirmation.
pub struct Confirmed;

#[must_use = "the cache is only cleared after confirm().confirm_again()"]
pub struct CacheClear<'a, S> {
    engine: &'a SyncEngine,
    _state: PhantomData<S>,
}

impl<'a> CacheClear<'a, Unconfirmed> {
    pub fn confirm(self) -> CacheClear<'a, Confirmed> {
        CacheClear {
            engine: self.engine,
            _state: PhantomData,
        }
    }
}

impl CacheClear<'_, Confirmed> {
    /// Delete every cache blob. The next run re-uploads everything.
    ///
    /// Refused while a run is in progress.
    pub async fn confirm_again(self) -> Result<usize, SyncError> {
        let Some(_ticket) = self.engine.guard.try_enter() else {
            return Err(SyncError::Lock(
                "cannot clear the cache while a sync run is in progress".to_string(),
            ));
        };
        let deleted = self.engine.orchestrator.cache().clear().await?;
        self.engine
            .progress
            .report(&format!("Cleared sync cache ({} entries)", deleted));
        Ok(deleted)
    }
}
