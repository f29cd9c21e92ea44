use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{LoopInfo, SharedBackend};
use crate::config::MIN_LOOP_INTERVAL_SECS;
use crate::error::{MonitorError, Result};
use crate::notify::Notifier;

/// Client view of the backend sampling loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Running(LoopInfo),
}

impl LoopState {
    pub fn is_running(&self) -> bool {
        matches!(self, LoopState::Running(_))
    }
}

/// Accept `seconds` as a loop interval, or explain why not.
pub fn check_interval(seconds: i64) -> Result<u32> {
    if seconds < MIN_LOOP_INTERVAL_SECS {
        return Err(MonitorError::InvalidInterval(format!(
            "{seconds} is below the minimum of {MIN_LOOP_INTERVAL_SECS} seconds"
        )));
    }
    u32::try_from(seconds)
        .map_err(|_| MonitorError::InvalidInterval(format!("{seconds} is too large")))
}

/// Parse a user-entered interval. Only whole numbers are accepted.
pub fn parse_interval(raw: &str) -> Result<u32> {
    let raw = raw.trim();
    let seconds: i64 = raw.parse().map_err(|_| {
        MonitorError::InvalidInterval(format!("'{raw}' is not a whole number of seconds"))
    })?;
    check_interval(seconds)
}

#[derive(Debug)]
struct StatusCache {
    state: LoopState,
    applied_seq: u64,
    last_issued: Option<Instant>,
}

/// Clears the loading flag when the start/stop call finishes, however it ends.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Starts, stops and reflects the backend-side `squeue` loop.
///
/// Start and stop are serialized by a loading flag. Status fetches are
/// numbered when issued and only the newest answer is applied, so a slow
/// response can never overwrite a fresher one.
pub struct LoopController {
    backend: SharedBackend,
    notifier: Notifier,
    min_refresh: Duration,
    loading: AtomicBool,
    next_seq: AtomicU64,
    cache: Mutex<StatusCache>,
    state_tx: watch::Sender<LoopState>,
}

impl LoopController {
    pub fn new(backend: SharedBackend, notifier: Notifier, min_refresh: Duration) -> Self {
        let (state_tx, _) = watch::channel(LoopState::Idle);
        Self {
            backend,
            notifier,
            min_refresh,
            loading: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            cache: Mutex::new(StatusCache {
                state: LoopState::Idle,
                applied_seq: 0,
                last_issued: None,
            }),
            state_tx,
        }
    }

    /// Last confirmed state, without a remote call.
    pub fn current(&self) -> LoopState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    fn begin(&self, what: &'static str) -> Result<LoadingGuard<'_>> {
        if self
            .loading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MonitorError::Busy(what));
        }
        Ok(LoadingGuard(&self.loading))
    }

    /// Ask the backend to start sampling every `interval_seconds`.
    ///
    /// Intervals below the minimum are rejected without any remote call.
    pub async fn start(&self, interval_seconds: i64) -> Result<LoopState> {
        let seconds = check_interval(interval_seconds)?;
        let _loading = self.begin("loop start/stop")?;

        tracing::info!(interval_seconds = seconds, "Starting squeue loop");
        match self.backend.start_squeue_loop(seconds).await {
            Ok(message) => {
                self.notifier.success(message);
                Ok(self.status().await)
            }
            Err(e) => {
                self.notifier.error(format!("Could not start loop: {e}"));
                Err(e.into())
            }
        }
    }

    /// [`start`](Self::start) from raw text input.
    pub async fn start_from_input(&self, raw: &str) -> Result<LoopState> {
        let seconds = parse_interval(raw)?;
        self.start(i64::from(seconds)).await
    }

    /// Ask the backend to stop, then refresh regardless of the outcome.
    ///
    /// A failed stop that leaves the loop idle counts as success.
    pub async fn stop(&self) -> Result<LoopState> {
        let _loading = self.begin("loop start/stop")?;

        tracing::info!("Stopping squeue loop");
        let result = self.backend.stop_squeue_loop().await;
        let state = self.status().await;
        match result {
            Ok(message) => {
                self.notifier.success(message);
                Ok(state)
            }
            Err(e) if state == LoopState::Idle => {
                tracing::debug!(error = %e, "Stop with no running loop, nothing to do");
                Ok(state)
            }
            Err(e) => {
                self.notifier.error(format!("Could not stop loop: {e}"));
                Err(e.into())
            }
        }
    }

    /// Fetch the loop descriptor. A remote error or no loop reads as `Idle`.
    pub async fn status(&self) -> LoopState {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.last_issued = Some(Instant::now());
        }

        let fetched = match self.backend.get_loop_info().await {
            Ok(Some(info)) => LoopState::Running(info),
            Ok(None) => LoopState::Idle,
            Err(e) => {
                tracing::debug!(error = %e, "No loop info, treating loop as idle");
                LoopState::Idle
            }
        };

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if seq > cache.applied_seq {
            cache.applied_seq = seq;
            cache.state = fetched;
            self.state_tx.send_replace(cache.state.clone());
        } else {
            tracing::debug!(seq, applied = cache.applied_seq, "Dropping stale loop status");
        }
        cache.state.clone()
    }

    /// Memoized [`status`](Self::status) for callers that refresh on every render.
    pub async fn refresh_if_stale(&self) -> LoopState {
        let fresh = {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache
                .last_issued
                .is_some_and(|at| at.elapsed() < self.min_refresh)
                .then(|| cache.state.clone())
        };
        match fresh {
            Some(state) => state,
            None => self.status().await,
        }
    }

    /// Refresh every `period` until `token` is cancelled.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        period: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("Loop status refresher stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        controller.status().await;
                    }
                }
            }
        })
    }
}
