//! Scriptable in-process backend.
//!
//! Holds a tiny model of the remote side (session flag, loop descriptor,
//! latest queue snapshot) and lets callers script failures, job-status
//! sequences and per-call delays. Every operation is counted so callers can
//! assert on exactly which remote calls were issued.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;

use crate::backend::{Backend, JobStatus, LoopInfo, QueueSnapshot};
use crate::error::{RemoteError, RemoteResult};
use crate::session::credential::Credential;

/// Backend operations, for call counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Login,
    Logout,
    IsLoggedIn,
    RunSqueue,
    StartLoop,
    StopLoop,
    GetLoopInfo,
    GetSqueue,
    ExtractOcel,
    StartTestJob,
    CheckJobStatus,
}

#[derive(Debug, Default)]
struct FakeState {
    logged_in: bool,
    loop_info: Option<LoopInfo>,
    latest: Option<QueueSnapshot>,
    job_statuses: VecDeque<JobStatus>,
    next_job_id: u64,
    fail_next: HashMap<Op, VecDeque<String>>,
    fail_always: HashMap<Op, String>,
    delays: HashMap<Op, VecDeque<Duration>>,
    calls: HashMap<Op, usize>,
    checked_jobs: Vec<String>,
    credentials: Vec<Credential>,
}

pub struct InMemoryBackend {
    state: Mutex<FakeState>,
    tx: broadcast::Sender<QueueSnapshot>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(FakeState {
                next_job_id: 1000,
                ..Default::default()
            }),
            tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start with a live session, as if a previous run had logged in.
    pub fn logged_in(self) -> Self {
        self.lock().logged_in = true;
        self
    }

    pub fn set_logged_in(&self, logged_in: bool) {
        self.lock().logged_in = logged_in;
    }

    /// Pretend a loop is already running.
    pub fn set_loop_info(&self, info: Option<LoopInfo>) {
        self.lock().loop_info = info;
    }

    /// Fail the next call of `op` once with `message`.
    pub fn fail_next(&self, op: Op, message: impl Into<String>) {
        self.lock()
            .fail_next
            .entry(op)
            .or_default()
            .push_back(message.into());
    }

    /// Fail every call of `op` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, op: Op, message: impl Into<String>) {
        self.lock().fail_always.insert(op, message.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_next.clear();
        state.fail_always.clear();
    }

    /// Delay the response of the next call of `op`. The result is decided
    /// when the call is made, only its delivery is late.
    pub fn delay_next(&self, op: Op, delay: Duration) {
        self.lock().delays.entry(op).or_default().push_back(delay);
    }

    /// Statuses returned by successive `check_job_status` calls; the last
    /// one repeats.
    pub fn script_job_statuses(&self, statuses: impl IntoIterator<Item = JobStatus>) {
        self.lock().job_statuses = statuses.into_iter().collect();
    }

    /// Make `snapshot` the current queue listing and push it to subscribers.
    pub fn push_snapshot(&self, snapshot: QueueSnapshot) {
        self.lock().latest = Some(snapshot.clone());
        // No subscribers is fine
        let _ = self.tx.send(snapshot);
    }

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Job ids passed to `check_job_status`, in call order.
    pub fn checked_jobs(&self) -> Vec<String> {
        self.lock().checked_jobs.clone()
    }

    /// Credentials passed to `login`, in call order.
    pub fn credentials(&self) -> Vec<Credential> {
        self.lock().credentials.clone()
    }

    fn enter(&self, op: Op) -> (RemoteResult<()>, Option<Duration>) {
        let mut state = self.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        let delay = state.delays.get_mut(&op).and_then(VecDeque::pop_front);
        let once = state.fail_next.get_mut(&op).and_then(VecDeque::pop_front);
        let failure = once.or_else(|| state.fail_always.get(&op).cloned());
        (failure.map_or(Ok(()), |m| Err(RemoteError::new(m))), delay)
    }

    async fn respond<T>(delay: Option<Duration>, result: RemoteResult<T>) -> RemoteResult<T> {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    fn call<T>(
        &self,
        op: Op,
        act: impl FnOnce(&mut FakeState) -> RemoteResult<T>,
    ) -> (RemoteResult<T>, Option<Duration>) {
        let (admitted, delay) = self.enter(op);
        let result = admitted.and_then(|()| act(&mut self.lock()));
        (result, delay)
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn login(&self, credential: &Credential) -> RemoteResult<String> {
        let credential = credential.clone();
        let (result, delay) = self.call(Op::Login, move |state| {
            state.credentials.push(credential);
            state.logged_in = true;
            Ok("Logged in".to_string())
        });
        Self::respond(delay, result).await
    }

    async fn logout(&self) -> RemoteResult<String> {
        let (result, delay) = self.call(Op::Logout, |state| {
            state.logged_in = false;
            Ok("Logged out".to_string())
        });
        Self::respond(delay, result).await
    }

    async fn is_logged_in(&self) -> RemoteResult<bool> {
        let (result, delay) = self.call(Op::IsLoggedIn, |state| Ok(state.logged_in));
        Self::respond(delay, result).await
    }

    async fn run_squeue(&self) -> RemoteResult<String> {
        let (result, delay) = self.call(Op::RunSqueue, |state| {
            let rows = state.latest.as_ref().map_or(0, |s| s.rows.len());
            Ok(format!("Captured {rows} rows"))
        });
        Self::respond(delay, result).await
    }

    async fn start_squeue_loop(&self, interval_seconds: u32) -> RemoteResult<String> {
        let (result, delay) = self.call(Op::StartLoop, |state| {
            if state.loop_info.is_some() {
                return Err(RemoteError::new("Loop already running"));
            }
            let running_since = Utc::now();
            let folder = running_since.to_rfc3339().replace(':', "_");
            state.loop_info = Some(LoopInfo {
                interval_seconds,
                running_since,
                output_path: PathBuf::from(format!("squeue_results_{folder}")),
            });
            Ok(format!("Started loop every {interval_seconds}s"))
        });
        Self::respond(delay, result).await
    }

    async fn stop_squeue_loop(&self) -> RemoteResult<String> {
        let (result, delay) = self.call(Op::StopLoop, |state| match state.loop_info.take() {
            Some(_) => Ok("Stopped loop".to_string()),
            None => Err(RemoteError::new("No loop currently running")),
        });
        Self::respond(delay, result).await
    }

    async fn get_loop_info(&self) -> RemoteResult<Option<LoopInfo>> {
        let (result, delay) = self.call(Op::GetLoopInfo, |state| Ok(state.loop_info.clone()));
        Self::respond(delay, result).await
    }

    async fn get_squeue(&self) -> RemoteResult<QueueSnapshot> {
        let (result, delay) = self.call(Op::GetSqueue, |state| {
            Ok(state
                .latest
                .clone()
                .unwrap_or_else(|| QueueSnapshot::new(Utc::now(), Vec::new())))
        });
        Self::respond(delay, result).await
    }

    async fn extract_ocel(&self) -> RemoteResult<String> {
        let (result, delay) = self.call(Op::ExtractOcel, |_| Ok("ocel.json".to_string()));
        Self::respond(delay, result).await
    }

    async fn start_test_job(&self) -> RemoteResult<String> {
        let (result, delay) = self.call(Op::StartTestJob, |state| {
            state.next_job_id += 1;
            Ok(state.next_job_id.to_string())
        });
        Self::respond(delay, result).await
    }

    async fn check_job_status(&self, job_id: &str) -> RemoteResult<JobStatus> {
        let job_id = job_id.to_string();
        let (result, delay) = self.call(Op::CheckJobStatus, move |state| {
            state.checked_jobs.push(job_id);
            let status = if state.job_statuses.len() > 1 {
                state.job_statuses.pop_front()
            } else {
                state.job_statuses.front().cloned()
            };
            Ok(status.unwrap_or(JobStatus::NotFound))
        });
        Self::respond(delay, result).await
    }

    fn subscribe_squeue(&self) -> broadcast::Receiver<QueueSnapshot> {
        self.tx.subscribe()
    }
}
