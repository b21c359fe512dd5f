//! Periodic background runs.
//!
//! The scheduler owns a timer task. Each tick spawns the run as a separate
//! task, so stopping the timer never interrupts a run that already started.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use notesync_core::{Settings, SyncError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::engine::{RunOutcome, SyncEngine};
use crate::orchestrator::SyncMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed { interval: Duration },
}

/// Owned handle for automatic syncing. Dropping it stops the timer.
pub struct AutoSyncScheduler {
    engine: Arc<SyncEngine>,
    settings: RwLock<Arc<Settings>>,
    timer: Mutex<Option<(JoinHandle<()>, Duration)>>,
}

impl AutoSyncScheduler {
    pub fn new(engine: Arc<SyncEngine>, settings: Settings) -> Self {
        Self {
            engine,
            settings: RwLock::new(Arc::new(settings)),
            timer: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Arm the timer: one run right away, then one per interval.
    ///
    /// No-op when auto-sync is disabled or the timer is already armed.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> SchedulerState {
        let settings = self.settings();
        if !settings.auto_sync.enabled {
            info!("Auto-sync disabled, scheduler stays idle");
            return SchedulerState::Idle;
        }

        let mut timer = self.timer();
        if let Some((handle, interval)) = timer.as_ref() {
            if !handle.is_finished() {
                return SchedulerState::Armed {
                    interval: *interval,
                };
            }
        }

        let interval = settings.auto_sync.interval();
        if interval.is_zero() {
            warn!("Auto-sync interval is zero, scheduler stays idle");
            return SchedulerState::Idle;
        }
        let engine = self.engine.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                fire(&engine, &settings);
            }
        });
        *timer = Some((handle, interval));

        info!("Auto-sync armed every {}s", interval.as_secs());
        SchedulerState::Armed { interval }
    }

    /// Cancel the timer. A run already in progress finishes normally.
    pub fn stop(&self) {
        if let Some((handle, _)) = self.timer().take() {
            handle.abort();
            info!("Auto-sync stopped");
        }
    }

    /// Cancel the timer and release the run guard immediately.
    ///
    /// The abandoned run keeps going until its next suspension point
    /// completes, but it can no longer block new runs.
    pub fn force_stop(&self) {
        self.stop();
        if self.engine.is_running() {
            warn!("Force-stopping auto-sync with a run in progress");
        }
        self.engine.reset_run_guard();
    }

    /// Run once now with the current settings, outside the timer.
    pub async fn trigger_sync(&self) -> Result<RunOutcome, SyncError> {
        let settings = self.settings();
        let mode = SyncMode::for_settings(&settings);
        self.engine.run_once(&settings, mode).await
    }

    /// Replace the settings; an armed timer is re-armed with the new values.
    pub fn update_settings(&self, settings: Settings) {
        *self
            .settings
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Arc::new(settings);
        if self.state() != SchedulerState::Idle || self.settings().auto_sync.enabled {
            self.restart();
        }
    }

    pub fn restart(&self) -> SchedulerState {
        self.stop();
        self.start()
    }

    pub fn state(&self) -> SchedulerState {
        match self.timer().as_ref() {
            Some((handle, interval)) if !handle.is_finished() => SchedulerState::Armed {
                interval: *interval,
            },
            _ => SchedulerState::Idle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    fn settings(&self) -> Arc<Settings> {
        self.settings
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn timer(&self) -> std::sync::MutexGuard<'_, Option<(JoinHandle<()>, Duration)>> {
        self.timer.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for AutoSyncScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn fire(engine: &Arc<SyncEngine>, settings: &Arc<Settings>) {
    if engine.is_running() {
        debug!("Previous sync run still in progress, skipping tick");
        return;
    }

    let engine = engine.clone();
    let settings = settings.clone();
    tokio::spawn(async move {
        let mode = SyncMode::for_settings(&settings);
        match engine.run_once(&settings, mode).await {
            Ok(RunOutcome::Completed(result)) => {
                debug!("Scheduled sync completed: {}", result.summary())
            }
            Ok(RunOutcome::Skipped(reason)) => debug!("Scheduled sync skipped: {}", reason),
            Err(e) => error!("Scheduled sync failed: {}", e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockRemote, MockSource};
    use notesync_core::{DeviceIdentity, MemoryBlobStore};

    const MINUTE: Duration = Duration::from_secs(60);

    fn engine() -> Arc<SyncEngine> {
        let source = Arc::new(MockSource::new());
        source.add_collection("c1", "Notes");
        source.add_document("c1", "d1", "Notes/Plan", "h0");
        Arc::new(SyncEngine::new(
            source,
            Arc::new(MockRemote::new()),
            Arc::new(MemoryBlobStore::new()),
            DeviceIdentity {
                id: "dev-1".to_string(),
                name: "laptop".to_string(),
            },
        ))
    }

    fn settings(enabled: bool, interval_minutes: u64) -> Settings {
        let mut settings = Settings::default();
        settings.remote.owner = "alice".to_string();
        settings.remote.repository = "notes".to_string();
        settings.remote.token = "token".to_string();
        settings.lock.enabled = false;
        settings.auto_sync.enabled = enabled;
        settings.auto_sync.interval_minutes = interval_minutes;
        settings
    }

    /// Settings whose runs sit in the lock jitter for `jitter_secs`.
    fn slow_settings(interval_minutes: u64, jitter_secs: u64) -> Settings {
        let mut slow = settings(true, interval_minutes);
        slow.lock.enabled = true;
        slow.lock.first_check_threshold_secs = 0;
        slow.lock.second_check_threshold_secs = 0;
        slow.lock.jitter_min_ms = jitter_secs * 1_000;
        slow.lock.jitter_max_ms = jitter_secs * 1_000;
        slow
    }

    async fn runs(scheduler: &AutoSyncScheduler) -> usize {
        scheduler.engine().history().await.len()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_immediately_then_every_interval() {
        let scheduler = AutoSyncScheduler::new(engine(), settings(true, 1));

        assert_eq!(
            scheduler.start(),
            SchedulerState::Armed { interval: MINUTE }
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs(&scheduler).await, 1);

        tokio::time::sleep(MINUTE).await;
        assert_eq!(runs(&scheduler).await, 2);

        tokio::time::sleep(MINUTE * 2).await;
        assert_eq!(runs(&scheduler).await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_stays_idle() {
        let scheduler = AutoSyncScheduler::new(engine(), settings(false, 1));

        assert_eq!(scheduler.start(), SchedulerState::Idle);
        tokio::time::sleep(MINUTE * 3).await;
        assert_eq!(runs(&scheduler).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_keeps_one_timer() {
        let scheduler = AutoSyncScheduler::new(engine(), settings(true, 1));
        scheduler.start();
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs(&scheduler).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer() {
        let scheduler = AutoSyncScheduler::new(engine(), settings(true, 1));
        scheduler.start();
        tokio::time::sleep(Duration::from_secs(1)).await;

        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        tokio::time::sleep(MINUTE * 3).await;
        assert_eq!(runs(&scheduler).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_does_not_interrupt_running_sync() {
        let mut slow = settings(true, 1);
        slow.lock.enabled = true;
        slow.lock.jitter_min_ms = 5_000;
        slow.lock.jitter_max_ms = 5_000;
        let scheduler = AutoSyncScheduler::new(engine(), slow);
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(scheduler.is_running());
        scheduler.stop();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!scheduler.is_running());
        assert_eq!(runs(&scheduler).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_stop_releases_guard() {
        let mut slow = settings(true, 1);
        slow.lock.enabled = true;
        slow.lock.jitter_min_ms = 5_000;
        slow.lock.jitter_max_ms = 5_000;
        let scheduler = AutoSyncScheduler::new(engine(), slow);
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(scheduler.is_running());

        scheduler.force_stop();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_during_run_is_skipped() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = lines.clone();
        let source = Arc::new(MockSource::new());
        source.add_collection("c1", "Notes");
        source.add_document("c1", "d1", "Notes/Plan", "h0");
        let engine = Arc::new(
            SyncEngine::new(
                source,
                Arc::new(MockRemote::new()),
                Arc::new(MemoryBlobStore::new()),
                DeviceIdentity {
                    id: "dev-1".to_string(),
                    name: "laptop".to_string(),
                },
            )
            .with_progress(Arc::new(move |line: &str| {
                sink.lock().unwrap().push(line.to_string())
            })),
        );

        // Each run lasts 90s, longer than the 60s interval
        let scheduler = AutoSyncScheduler::new(engine, slow_settings(1, 90));
        scheduler.start();

        // Ticks at 0s and 60s: the second one lands inside the first run
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(scheduler.is_running());
        assert_eq!(runs(&scheduler).await, 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!scheduler.is_running());
        assert_eq!(runs(&scheduler).await, 1);

        // The tick at 120s starts the next run, the one at 180s is skipped
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(runs(&scheduler).await, 1);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(runs(&scheduler).await, 2);

        // Skipped ticks never reached the engine
        let lines = lines.lock().unwrap();
        assert!(!lines.iter().any(|l| l.starts_with("Sync skipped")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_after_force_stop_fires_new_run() {
        let scheduler = AutoSyncScheduler::new(engine(), slow_settings(1, 90));
        scheduler.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(scheduler.is_running());

        scheduler.force_stop();
        assert!(!scheduler.is_running());

        assert_eq!(
            scheduler.start(),
            SchedulerState::Armed { interval: MINUTE }
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(scheduler.is_running());

        // Both the abandoned and the new run complete
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(!scheduler.is_running());
        assert_eq!(runs(&scheduler).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_settings_rearms_with_new_interval() {
        let scheduler = AutoSyncScheduler::new(engine(), settings(true, 1));
        scheduler.start();
        tokio::time::sleep(Duration::from_secs(1)).await;

        scheduler.update_settings(settings(true, 5));
        assert_eq!(
            scheduler.state(),
            SchedulerState::Armed {
                interval: MINUTE * 5
            }
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs(&scheduler).await, 2);

        tokio::time::sleep(MINUTE * 2).await;
        assert_eq!(runs(&scheduler).await, 2);

        tokio::time::sleep(MINUTE * 3).await;
        assert_eq!(runs(&scheduler).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_settings_can_disable() {
        let scheduler = AutoSyncScheduler::new(engine(), settings(true, 1));
        scheduler.start();

        scheduler.update_settings(settings(false, 1));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_trigger_sync_runs_with_current_settings() {
        let scheduler = AutoSyncScheduler::new(engine(), settings(false, 1));
        let outcome = scheduler.trigger_sync().await.unwrap();

        assert_eq!(outcome.completed().unwrap().documents.uploaded, 1);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_timer() {
        let engine = engine();
        {
            let scheduler = AutoSyncScheduler::new(engine.clone(), settings(true, 1));
            scheduler.start();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        tokio::time::sleep(MINUTE * 3).await;
        assert_eq!(engine.history().await.len(), 1);
    }
}
