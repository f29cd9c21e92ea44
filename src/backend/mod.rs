//! The operation contract between the dashboard core and the job-queue backend.
//!
//! Everything the core knows about the cluster flows through [`Backend`]:
//! session handling, the backend-side `squeue` sampling loop, one-shot queue
//! snapshots, OCEL extraction and test-job submission/status.
//!
//! # Implementations
//!
//! - [`local::LocalBackend`]: shells out to `squeue`/`sbatch` through a
//!   [`local::CommandRunner`] and runs the sampling loop as a tokio task
//! - [`memory::InMemoryBackend`]: scriptable fake used by tests and demos
//!
//! Both are interchangeable behind `Arc<dyn Backend>`.

pub mod local;
pub mod memory;
pub mod ocel;
pub mod squeue;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::RemoteResult;
use crate::session::credential::Credential;

/// State of a SLURM job as reported by `squeue`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum JobState {
    Running,
    Pending,
    Completing,
    Completed,
    Cancelled,
    Failed,
    Timeout,
    OutOfMemory,
    NodeFail,
    Other(String),
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Running => "RUNNING",
            JobState::Pending => "PENDING",
            JobState::Completing => "COMPLETING",
            JobState::Completed => "COMPLETED",
            JobState::Cancelled => "CANCELLED",
            JobState::Failed => "FAILED",
            JobState::Timeout => "TIMEOUT",
            JobState::OutOfMemory => "OUT_OF_MEMORY",
            JobState::NodeFail => "NODE_FAIL",
            JobState::Other(s) => s,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "RUNNING" => JobState::Running,
            "PENDING" => JobState::Pending,
            "COMPLETING" => JobState::Completing,
            "COMPLETED" => JobState::Completed,
            "CANCELLED" => JobState::Cancelled,
            "FAILED" => JobState::Failed,
            "TIMEOUT" => JobState::Timeout,
            "OUT_OF_MEMORY" => JobState::OutOfMemory,
            "NODE_FAIL" => JobState::NodeFail,
            other => JobState::Other(other.to_string()),
        })
    }
}

impl From<String> for JobState {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(state) => state,
            Err(never) => match never {},
        }
    }
}

impl From<&str> for JobState {
    fn from(s: &str) -> Self {
        JobState::from(s.to_string())
    }
}

impl From<JobState> for String {
    fn from(state: JobState) -> Self {
        state.as_str().to_string()
    }
}

/// One parsed row of `squeue` output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqueueRow {
    pub account: String,
    pub state: JobState,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub cpus: usize,
    #[serde(default)]
    pub nodes: usize,
    #[serde(default)]
    pub exec_host: Option<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub submit_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub start_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub end_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub work_dir: String,
    #[serde(default)]
    pub command: String,
}

impl SqueueRow {
    pub fn new(account: impl Into<String>, state: JobState) -> Self {
        Self {
            account: account.into(),
            state,
            job_id: String::new(),
            name: String::new(),
            partition: String::new(),
            group: String::new(),
            cpus: 0,
            nodes: 0,
            exec_host: None,
            reason: String::new(),
            submit_time: None,
            start_time: None,
            end_time: None,
            work_dir: String::new(),
            command: String::new(),
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }
}

/// A queue listing captured at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub time: DateTime<Utc>,
    pub rows: Vec<SqueueRow>,
}

impl QueueSnapshot {
    pub fn new(time: DateTime<Utc>, rows: Vec<SqueueRow>) -> Self {
        Self { time, rows }
    }

    /// Number of rows per job state.
    pub fn tally(&self) -> BTreeMap<JobState, u32> {
        let mut counts = BTreeMap::new();
        for row in &self.rows {
            *counts.entry(row.state.clone()).or_insert(0) += 1;
        }
        counts
    }
}

/// Descriptor of the backend-side sampling loop while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopInfo {
    pub interval_seconds: u32,
    pub running_since: DateTime<Utc>,
    pub output_path: PathBuf,
}

/// Status of a single submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending {
        start_time: Option<NaiveDateTime>,
    },
    Running {
        start_time: Option<NaiveDateTime>,
        end_time: Option<NaiveDateTime>,
    },
    Ended {
        state: JobState,
    },
    #[serde(rename = "NotFound")]
    NotFound,
}

impl JobStatus {
    /// Map a job's `squeue` row (or its absence) onto a status.
    pub fn from_row(row: Option<&SqueueRow>) -> Self {
        match row {
            None => JobStatus::NotFound,
            Some(row) => match &row.state {
                JobState::Pending => JobStatus::Pending {
                    start_time: row.start_time,
                },
                JobState::Running => JobStatus::Running {
                    start_time: row.start_time,
                    end_time: row.end_time,
                },
                other => JobStatus::Ended {
                    state: other.clone(),
                },
            },
        }
    }

    /// `Ended` and `NotFound`. Informational only; polling does not stop on them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Ended { .. } | JobStatus::NotFound)
    }

    pub fn label(&self) -> String {
        match self {
            JobStatus::Pending { .. } => "pending".to_string(),
            JobStatus::Running { .. } => "running".to_string(),
            JobStatus::Ended { state } => format!("ended ({state})"),
            JobStatus::NotFound => "not found".to_string(),
        }
    }
}

/// Asynchronous operations the backend must provide.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn login(&self, credential: &Credential) -> RemoteResult<String>;

    async fn logout(&self) -> RemoteResult<String>;

    async fn is_logged_in(&self) -> RemoteResult<bool>;

    /// Take one snapshot and persist it backend-side.
    async fn run_squeue(&self) -> RemoteResult<String>;

    async fn start_squeue_loop(&self, interval_seconds: u32) -> RemoteResult<String>;

    async fn stop_squeue_loop(&self) -> RemoteResult<String>;

    /// `None` when no loop is running.
    async fn get_loop_info(&self) -> RemoteResult<Option<LoopInfo>>;

    async fn get_squeue(&self) -> RemoteResult<QueueSnapshot>;

    async fn extract_ocel(&self) -> RemoteResult<String>;

    /// Submit the configured test job; returns its scheduler job id.
    async fn start_test_job(&self) -> RemoteResult<String>;

    async fn check_job_status(&self, job_id: &str) -> RemoteResult<JobStatus>;

    /// Snapshots pushed by the sampling loop. Dropping the receiver unsubscribes.
    fn subscribe_squeue(&self) -> broadcast::Receiver<QueueSnapshot>;
}

pub type SharedBackend = Arc<dyn Backend>;
