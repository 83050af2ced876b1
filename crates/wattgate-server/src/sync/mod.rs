//! Background synchronizer.
//!
//! Each [`SyncJob`] runs in its own loop:
//!
//! ```text
//! Idle -> CheckEligibility -> Skip | Run -> UpdateMarker -> Sleep -> Idle
//! ```
//!
//! Eligibility compares the job's [`SyncMarker`](wattgate_core::SyncMarker)
//! with its minimum interval. The marker is a best-effort de-duplication hint
//! between instances, not a lock: two instances may both run a cycle, which is
//! harmless because every cycle is an idempotent upsert. The marker only moves
//! after a cycle succeeded in full.

pub mod calendar;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wattgate_core::{DynSyncMarkerStorage, StorageError, SyncMarkerStorage};

use crate::metrics;
use crate::upstream::UpstreamError;

pub use calendar::{BackfillJob, CalendarSyncSettings, NearTermJob};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("upstream fetch failed: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid sync window: {0}")]
    Window(String),
}

/// One periodically synchronized source.
#[async_trait]
pub trait SyncJob: Send + Sync {
    /// Marker name, e.g. `calendar.near_term`.
    fn name(&self) -> &str;

    /// A cycle is skipped when the last success is younger than this.
    fn min_interval(&self) -> chrono::Duration;

    /// Sleep between two cycles of the loop.
    fn interval(&self) -> Duration;

    /// Runs one cycle and returns the number of rows written.
    async fn run_cycle(&self, now: DateTime<Utc>) -> Result<u64, SyncError>;
}

/// Result of one pass through the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped { last_success_at: DateTime<Utc> },
    Completed { written: u64 },
    Failed { error: String },
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped { .. } => "skipped",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Runs one eligibility check and, if eligible, one cycle of `job`.
pub async fn run_once(
    job: &dyn SyncJob,
    markers: &dyn SyncMarkerStorage,
    now: DateTime<Utc>,
) -> CycleOutcome {
    let name = job.name();

    match markers.get_marker(name).await {
        Ok(Some(marker)) if marker.is_fresh(now, job.min_interval()) => {
            debug!(source = name, last_success_at = %marker.last_success_at, "sync skipped, marker is fresh");
            metrics::record_sync_cycle(name, "skipped");
            return CycleOutcome::Skipped {
                last_success_at: marker.last_success_at,
            };
        }
        Ok(_) => {}
        // The marker is only a hint; run anyway.
        Err(e) => warn!(source = name, error = %e, "could not read sync marker"),
    }

    let outcome = match job.run_cycle(now).await {
        Ok(written) => {
            if let Err(e) = markers.set_marker(name, now).await {
                warn!(source = name, error = %e, "cycle applied but marker not updated");
            }
            info!(source = name, written, "sync cycle completed");
            metrics::record_sync_days_written(name, written);
            CycleOutcome::Completed { written }
        }
        Err(e) => {
            error!(source = name, error = %e, "sync cycle failed");
            CycleOutcome::Failed {
                error: e.to_string(),
            }
        }
    };
    metrics::record_sync_cycle(name, outcome.label());
    outcome
}

/// Runs every registered job in its own background loop.
pub struct SyncScheduler {
    jobs: Vec<Arc<dyn SyncJob>>,
    markers: DynSyncMarkerStorage,
}

impl SyncScheduler {
    pub fn new(markers: DynSyncMarkerStorage) -> Self {
        Self {
            jobs: Vec::new(),
            markers,
        }
    }

    #[must_use]
    pub fn with_job(mut self, job: Arc<dyn SyncJob>) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Spawns the loops. The first cycle of each job starts immediately.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = self
            .jobs
            .into_iter()
            .map(|job| {
                let markers = self.markers.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(run_loop(job, markers, shutdown_rx))
            })
            .collect();

        SchedulerHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

async fn run_loop(
    job: Arc<dyn SyncJob>,
    markers: DynSyncMarkerStorage,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(
        source = job.name(),
        interval_secs = job.interval().as_secs(),
        "sync loop started"
    );

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        run_once(job.as_ref(), markers.as_ref(), Utc::now()).await;

        tokio::select! {
            _ = tokio::time::sleep(job.interval()) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!(source = job.name(), "sync loop stopped");
}

/// Handle to the running loops.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signals every loop and waits for them to finish their current step.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "sync loop terminated abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use wattgate_db_memory::InMemoryStorage;

    struct FakeJob {
        runs: AtomicUsize,
        fail: AtomicBool,
        min_interval: chrono::Duration,
    }

    impl FakeJob {
        fn new(min_interval: chrono::Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                min_interval,
            })
        }
    }

    #[async_trait]
    impl SyncJob for FakeJob {
        fn name(&self) -> &str {
            "fake"
        }

        fn min_interval(&self) -> chrono::Duration {
            self.min_interval
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn run_cycle(&self, _now: DateTime<Utc>) -> Result<u64, SyncError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SyncError::Window("boom".into()));
            }
            Ok(3)
        }
    }

    #[tokio::test]
    async fn test_marker_moves_only_after_success() {
        let markers = InMemoryStorage::new();
        let job = FakeJob::new(chrono::Duration::minutes(30));
        let now = Utc::now();

        job.fail.store(true, Ordering::SeqCst);
        let outcome = run_once(job.as_ref(), &markers, now).await;
        assert_eq!(outcome.label(), "failed");
        assert!(markers.get_marker("fake").await.unwrap().is_none());

        job.fail.store(false, Ordering::SeqCst);
        let outcome = run_once(job.as_ref(), &markers, now).await;
        assert_eq!(outcome, CycleOutcome::Completed { written: 3 });
        assert_eq!(
            markers.get_marker("fake").await.unwrap().unwrap().last_success_at,
            now
        );
    }

    #[tokio::test]
    async fn test_fresh_marker_skips_cycle() {
        let markers = InMemoryStorage::new();
        let job = FakeJob::new(chrono::Duration::minutes(30));
        let now = Utc::now();
        markers
            .set_marker("fake", now - chrono::Duration::minutes(10))
            .await
            .unwrap();

        let outcome = run_once(job.as_ref(), &markers, now).await;
        assert!(matches!(outcome, CycleOutcome::Skipped { .. }));
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);

        let later = now + chrono::Duration::minutes(25);
        let outcome = run_once(job.as_ref(), &markers, later).await;
        assert!(matches!(outcome, CycleOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_loops_survive_failures_and_stop_on_shutdown() {
        let markers: DynSyncMarkerStorage = Arc::new(InMemoryStorage::new());
        let job = FakeJob::new(chrono::Duration::zero());
        job.fail.store(true, Ordering::SeqCst);

        let scheduler = SyncScheduler::new(markers).with_job(job.clone());
        assert_eq!(scheduler.job_count(), 1);
        let handle = scheduler.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        let runs = job.runs.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected repeated cycles, got {runs}");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), runs);
    }
}
