use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{QueueSnapshot, SharedBackend};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::jobs::{JobMonitor, JobView};
use crate::notify::Notifier;
use crate::sampling::{follow, ChartData, LoopController, LoopState, SampleAggregator, SeriesMode};
use crate::session::{CredentialForm, KeyValueStore, SessionManager, SessionState};

/// Background work that only runs while the session is authenticated.
#[derive(Default)]
struct SessionTasks {
    /// Cancelled when the session ends; `None` while logged out
    scope: Option<CancellationToken>,
    refresh_period: Option<Duration>,
}

/// Wires the dashboard subsystems around one backend.
///
/// Everything except the session operations requires an authenticated
/// session and fails with [`MonitorError::NotAuthenticated`] otherwise.
/// Ending the session stops the loop status refresher and forgets the
/// tracked job; the refresher resumes on the next login.
pub struct DashboardClient {
    pub config: MonitorConfig,
    pub backend: SharedBackend,
    pub notifier: Notifier,
    pub session: Arc<SessionManager>,
    pub loop_controller: Arc<LoopController>,
    pub jobs: Arc<JobMonitor>,
    pub aggregator: Arc<SampleAggregator>,
    shutdown: CancellationToken,
    session_tasks: Mutex<SessionTasks>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DashboardClient {
    pub fn new(
        config: MonitorConfig,
        backend: SharedBackend,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let notifier = Notifier::new();
        let shutdown = CancellationToken::new();
        let session = SessionManager::new(backend.clone(), notifier.clone(), store);
        let loop_controller = LoopController::new(
            backend.clone(),
            notifier.clone(),
            config.status_refresh_min_interval,
        );
        let jobs = JobMonitor::new(
            backend.clone(),
            notifier.clone(),
            config.job_poll_interval,
            shutdown.child_token(),
        );
        let aggregator = SampleAggregator::new(config.history_capacity, config.max_display_points);

        Self {
            config,
            backend,
            notifier,
            session: Arc::new(session),
            loop_controller: Arc::new(loop_controller),
            jobs: Arc::new(jobs),
            aggregator: Arc::new(aggregator),
            shutdown,
            session_tasks: Mutex::new(SessionTasks::default()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Probe for an existing session and start ingesting pushed snapshots.
    pub async fn start(&self) -> SessionState {
        let follower = follow(
            Arc::clone(&self.aggregator),
            self.backend.subscribe_squeue(),
            self.shutdown.child_token(),
        );
        self.track(follower);

        let state = self.probe().await;
        tracing::info!(session = %state, "Dashboard client started");
        state
    }

    /// Refresh the loop status every `period` while the session is
    /// authenticated.
    pub fn spawn_loop_refresher(&self, period: Duration) {
        let mut tasks = self.session_tasks();
        tasks.refresh_period = Some(period);
        if let Some(scope) = &tasks.scope {
            let handle = self.loop_controller.spawn_refresher(period, scope.child_token());
            self.track(handle);
        }
    }

    fn session_tasks(&self) -> std::sync::MutexGuard<'_, SessionTasks> {
        self.session_tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm_session_tasks(&self) {
        let mut tasks = self.session_tasks();
        if tasks.scope.is_some() {
            return;
        }
        let scope = self.shutdown.child_token();
        if let Some(period) = tasks.refresh_period {
            let handle = self.loop_controller.spawn_refresher(period, scope.child_token());
            self.track(handle);
        }
        tasks.scope = Some(scope);
        tracing::debug!("Session tasks started");
    }

    fn disarm_session_tasks(&self) {
        if let Some(scope) = self.session_tasks().scope.take() {
            scope.cancel();
            tracing::debug!("Session tasks stopped");
        }
        match self.jobs.reset() {
            Ok(()) | Err(MonitorError::NoJobTracked) => {}
            Err(e) => tracing::warn!(error = %e, "Could not forget tracked job"),
        }
    }

    fn sync_session_tasks(&self, state: SessionState) {
        match state {
            SessionState::Authenticated => self.arm_session_tasks(),
            SessionState::Unauthenticated => self.disarm_session_tasks(),
            _ => {}
        }
    }

    /// Check for an existing session and start or stop the session tasks
    /// to match.
    pub async fn probe(&self) -> SessionState {
        let state = self.session.probe().await;
        self.sync_session_tasks(state);
        state
    }

    pub async fn login(&self, form: &CredentialForm, save: bool) -> Result<()> {
        self.session.login(form, save).await?;
        self.arm_session_tasks();
        Ok(())
    }

    /// Log out and stop everything tied to the session, even if the remote
    /// logout failed.
    pub async fn logout(&self) -> Result<()> {
        let result = self.session.logout().await;
        if matches!(result, Ok(()) | Err(MonitorError::Remote(_))) {
            self.disarm_session_tasks();
        }
        result
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Dashboard client stopped");
    }

    fn require_session(&self) -> Result<()> {
        if self.session.is_authenticated() {
            Ok(())
        } else {
            Err(MonitorError::NotAuthenticated)
        }
    }

    pub async fn loop_status(&self) -> Result<LoopState> {
        self.require_session()?;
        Ok(self.loop_controller.refresh_if_stale().await)
    }

    pub async fn start_loop(&self, interval: &str) -> Result<LoopState> {
        self.require_session()?;
        self.loop_controller.start_from_input(interval).await
    }

    pub async fn stop_loop(&self) -> Result<LoopState> {
        self.require_session()?;
        self.loop_controller.stop().await
    }

    pub async fn pull_snapshot(&self) -> Result<QueueSnapshot> {
        self.require_session()?;
        match self.aggregator.pull_once(self.backend.as_ref()).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                self.notifier.error(format!("Could not fetch queue: {e}"));
                Err(e)
            }
        }
    }

    /// One-shot squeue run on the backend; the outcome goes to the notifier.
    pub async fn run_squeue(&self) -> Result<String> {
        self.require_session()?;
        match self.backend.run_squeue().await {
            Ok(message) => {
                self.notifier.success(message.clone());
                Ok(message)
            }
            Err(e) => {
                self.notifier.error(format!("squeue failed: {e}"));
                Err(e.into())
            }
        }
    }

    pub fn chart(&self, mode: SeriesMode) -> Result<ChartData> {
        self.require_session()?;
        Ok(self.aggregator.chart(mode))
    }

    pub fn job_view(&self) -> Result<JobView> {
        self.require_session()?;
        Ok(self.jobs.view())
    }

    pub async fn submit_job(&self) -> Result<String> {
        self.require_session()?;
        self.jobs.submit().await
    }

    pub fn reset_job(&self) -> Result<()> {
        self.require_session()?;
        self.jobs.reset()
    }

    pub async fn extract_ocel(&self) -> Result<String> {
        self.require_session()?;
        match self.backend.extract_ocel().await {
            Ok(message) => {
                self.notifier.success(format!("OCEL written to {message}"));
                Ok(message)
            }
            Err(e) => {
                self.notifier.error(format!("OCEL extraction failed: {e}"));
                Err(e.into())
            }
        }
    }
}
