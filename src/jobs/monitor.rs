use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{JobStatus, SharedBackend};
use crate::error::{MonitorError, Result};
use crate::notify::Notifier;

/// What the job panel shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum JobView {
    Empty,
    Submitting,
    Tracked {
        job_id: String,
        /// `None` until the first status arrives
        status: Option<JobStatus>,
    },
}

struct TrackedJob {
    id: String,
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

enum Slot {
    Empty,
    Submitting,
    Tracked(TrackedJob),
}

#[derive(Debug, Default)]
struct Tracking {
    /// Bumped on every submit and reset; older poll results are dropped
    generation: u64,
    applied_seq: u64,
}

/// State shared with the poller task.
struct Shared {
    backend: SharedBackend,
    notifier: Notifier,
    next_seq: AtomicU64,
    tracking: Mutex<Tracking>,
    view_tx: watch::Sender<JobView>,
}

impl Shared {
    fn tracking(&self) -> std::sync::MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue one status check and apply it if it is still the newest.
    async fn poll(&self, job_id: &str, generation: u64) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        match self.backend.check_job_status(job_id).await {
            Ok(status) => {
                let mut tracking = self.tracking();
                if tracking.generation != generation || seq <= tracking.applied_seq {
                    tracing::debug!(job_id, seq, "Dropping stale job status");
                    return Ok(());
                }
                tracking.applied_seq = seq;
                tracing::debug!(job_id, status = %status.label(), "Job status");
                let finished = status.is_terminal();
                let previous = self.view_tx.send_replace(JobView::Tracked {
                    job_id: job_id.to_string(),
                    status: Some(status),
                });
                let was_finished = matches!(
                    previous,
                    JobView::Tracked { status: Some(ref s), .. } if s.is_terminal()
                );
                if finished && !was_finished {
                    tracing::info!(job_id, "Test job left the queue");
                }
                Ok(())
            }
            Err(e) => {
                if self.tracking().generation == generation {
                    self.notifier
                        .error(format!("Could not check job {job_id}: {e}"));
                }
                Err(e.into())
            }
        }
    }
}

/// Single-slot tracker for the submitted test job.
///
/// Once a job is submitted its status is polled every `poll_interval`
/// until [`reset`](Self::reset). Polling continues through `Ended` and
/// `NotFound`; only a reset, dropping the monitor or cancelling the parent
/// token stops it.
pub struct JobMonitor {
    shared: Arc<Shared>,
    poll_interval: Duration,
    parent: CancellationToken,
    slot: Mutex<Slot>,
}

impl JobMonitor {
    pub fn new(
        backend: SharedBackend,
        notifier: Notifier,
        poll_interval: Duration,
        parent: CancellationToken,
    ) -> Self {
        let (view_tx, _) = watch::channel(JobView::Empty);
        Self {
            shared: Arc::new(Shared {
                backend,
                notifier,
                next_seq: AtomicU64::new(0),
                tracking: Mutex::new(Tracking::default()),
                view_tx,
            }),
            poll_interval,
            parent,
            slot: Mutex::new(Slot::Empty),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn view(&self) -> JobView {
        self.shared.view_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobView> {
        self.shared.view_tx.subscribe()
    }

    pub fn job_id(&self) -> Option<String> {
        match &*self.slot() {
            Slot::Tracked(job) => Some(job.id.clone()),
            _ => None,
        }
    }

    /// Submit the test job and start polling it.
    pub async fn submit(&self) -> Result<String> {
        {
            let mut slot = self.slot();
            if !matches!(*slot, Slot::Empty) {
                return Err(MonitorError::JobAlreadyTracked);
            }
            *slot = Slot::Submitting;
        }
        self.shared.view_tx.send_replace(JobView::Submitting);

        let job_id = match self.shared.backend.start_test_job().await {
            Ok(job_id) => job_id,
            Err(e) => {
                *self.slot() = Slot::Empty;
                self.shared.view_tx.send_replace(JobView::Empty);
                self.shared
                    .notifier
                    .error(format!("Could not submit test job: {e}"));
                return Err(e.into());
            }
        };

        let generation = {
            let mut tracking = self.shared.tracking();
            tracking.generation += 1;
            tracking.applied_seq = self.shared.next_seq.load(Ordering::SeqCst);
            tracking.generation
        };
        self.shared.view_tx.send_replace(JobView::Tracked {
            job_id: job_id.clone(),
            status: None,
        });
        let token = self.parent.child_token();
        let handle = self.spawn_poller(job_id.clone(), generation, token.clone());
        *self.slot() = Slot::Tracked(TrackedJob {
            id: job_id.clone(),
            generation,
            token,
            handle,
        });
        tracing::info!(job_id = %job_id, "Tracking test job");
        self.shared
            .notifier
            .success(format!("Submitted job {job_id}"));
        Ok(job_id)
    }

    fn spawn_poller(&self, job_id: String, generation: u64, token: CancellationToken) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let period = self.poll_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = shared.poll(&job_id, generation) => {
                        if let Err(e) = result {
                            tracing::warn!(job_id = %job_id, error = %e, "Job status poll failed");
                        }
                    }
                }
            }
            tracing::debug!(job_id = %job_id, "Job poller stopped");
        })
    }

    /// Check the tracked job right away, outside the polling cadence.
    pub async fn check_now(&self) -> Result<JobView> {
        let (job_id, generation) = match &*self.slot() {
            Slot::Tracked(job) => (job.id.clone(), job.generation),
            _ => return Err(MonitorError::NoJobTracked),
        };
        self.shared.poll(&job_id, generation).await?;
        Ok(self.view())
    }

    /// Forget the tracked job and stop polling it.
    pub fn reset(&self) -> Result<()> {
        let job = {
            let mut slot = self.slot();
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Tracked(job) => job,
                Slot::Submitting => {
                    *slot = Slot::Submitting;
                    return Err(MonitorError::Busy("job submit"));
                }
                Slot::Empty => return Err(MonitorError::NoJobTracked),
            }
        };

        job.token.cancel();
        self.shared.tracking().generation += 1;
        self.shared.view_tx.send_replace(JobView::Empty);
        tracing::info!(job_id = %job.id, "Stopped tracking job");
        job.handle.abort();
        Ok(())
    }
}

impl Drop for JobMonitor {
    fn drop(&mut self) {
        if let Slot::Tracked(job) = &*self.slot() {
            job.token.cancel();
        }
    }
}
