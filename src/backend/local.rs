//! Backend that drives SLURM by running its CLI tools.
//!
//! Commands go through a [`CommandRunner`], by default [`ShellRunner`]
//! (`sh -c` on this host, i.e. a cluster login node). The sampling loop is a
//! tokio task that captures one `squeue` listing per tick, writes it to the
//! loop's output folder and broadcasts it to subscribers.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::ocel::build_ocel;
use crate::backend::squeue::{parse_output, squeue_command, squeue_job_command};
use crate::backend::{Backend, JobStatus, LoopInfo, QueueSnapshot};
use crate::config::{LocalBackendConfig, TestJobConfig};
use crate::error::{RemoteError, RemoteResult};
use crate::session::credential::Credential;

const NO_CLIENT: &str = "No logged-in client available.";
const LOOP_DIR_PREFIX: &str = "squeue_results_";

/// Runs one shell command and returns its stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(&self, command: &str) -> RemoteResult<String>;
}

/// Runs commands with `sh -c` on the local host.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    fn process_output(
        command: &str,
        result: Result<std::process::Output, std::io::Error>,
    ) -> RemoteResult<String> {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let exit_code = output.status.code();

                if output.status.success() {
                    tracing::debug!(command, exit_code = ?exit_code, "Command finished");
                    Ok(stdout)
                } else {
                    tracing::warn!(command, exit_code = ?exit_code, stderr = %stderr, "Command failed");
                    Err(RemoteError::new(if stderr.is_empty() {
                        format!("Exit code: {:?}", exit_code)
                    } else {
                        stderr
                    }))
                }
            }
            Err(e) => {
                tracing::error!(command, error = %e, "Command could not be started");
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> RemoteResult<String> {
        let result = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;
        Self::process_output(command, result)
    }
}

#[derive(Debug, Clone)]
struct LocalSession {
    username: String,
    host: String,
}

struct SamplingLoop {
    info: LoopInfo,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Single-quote `value` for `sh`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Timestamp usable in file names: RFC 3339 with ':' replaced.
fn file_stamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339().replace(':', "_")
}

/// Scheduler job ids are digits, optionally with an array suffix.
pub fn is_valid_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Batch script for the configured test job.
pub fn test_job_script(job: &TestJobConfig, job_name: &str) -> String {
    format!(
        "#!/bin/bash\n\
         #SBATCH --ntasks=1\n\
         #SBATCH --cpus-per-task={}\n\
         #SBATCH --time={}\n\
         #SBATCH --job-name={}\n\
         #SBATCH --output=stdout.txt\n\
         \n\
         {}\n",
        job.num_cpus, job.time, job_name, job.command
    )
}

/// The job id is the last word of `sbatch` output ("Submitted batch job 42").
pub fn parse_sbatch_output(output: &str) -> RemoteResult<String> {
    output
        .split_whitespace()
        .last()
        .filter(|id| is_valid_job_id(id))
        .map(str::to_string)
        .ok_or_else(|| RemoteError::new(format!("Unexpected sbatch output: {}", output.trim())))
}

pub struct LocalBackend {
    config: LocalBackendConfig,
    runner: Arc<dyn CommandRunner>,
    session: RwLock<Option<LocalSession>>,
    sampling: Mutex<Option<SamplingLoop>>,
    tx: broadcast::Sender<QueueSnapshot>,
}

impl LocalBackend {
    pub fn new(config: LocalBackendConfig) -> Self {
        Self::with_runner(config, Arc::new(ShellRunner))
    }

    pub fn with_runner(config: LocalBackendConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let (tx, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            config,
            runner,
            session: RwLock::new(None),
            sampling: Mutex::new(None),
            tx,
        }
    }

    async fn require_session(&self) -> RemoteResult<()> {
        match self.session.read().await.as_ref() {
            Some(_) => Ok(()),
            None => Err(RemoteError::new(NO_CLIENT)),
        }
    }

    async fn capture(runner: &dyn CommandRunner) -> RemoteResult<QueueSnapshot> {
        let output = runner.run(&squeue_command()).await?;
        Ok(QueueSnapshot::new(Utc::now(), parse_output(&output)))
    }

    async fn write_snapshot(dir: &Path, snapshot: &QueueSnapshot) -> RemoteResult<PathBuf> {
        let path = dir.join(format!("{}.json", file_stamp(snapshot.time)));
        let json = serde_json::to_vec(snapshot)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    /// Capture, persist and broadcast one snapshot per tick until cancelled.
    fn spawn_sampler(
        &self,
        interval_seconds: u32,
        dir: PathBuf,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let runner = Arc::clone(&self.runner);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(u64::from(interval_seconds)));
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!(dir = %dir.display(), "Sampling loop stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let snapshot = match Self::capture(runner.as_ref()).await {
                            Ok(snapshot) => snapshot,
                            Err(e) => {
                                tracing::warn!(error = %e, "squeue failed, skipping sample");
                                continue;
                            }
                        };
                        if let Err(e) = Self::write_snapshot(&dir, &snapshot).await {
                            tracing::warn!(error = %e, "Could not write squeue snapshot");
                        }
                        tracing::debug!(rows = snapshot.rows.len(), "Captured squeue snapshot");
                        // No subscribers is fine
                        let _ = tx.send(snapshot);
                    }
                }
            }
        })
    }

    /// Output folder of the running loop, else the newest one on disk.
    async fn latest_loop_dir(&self) -> RemoteResult<PathBuf> {
        if let Some(sampling) = self.sampling.lock().await.as_ref() {
            return Ok(sampling.info.output_path.clone());
        }

        let mut newest: Option<String> = None;
        let mut entries = tokio::fs::read_dir(&self.config.output_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(LOOP_DIR_PREFIX) && entry.file_type().await?.is_dir() {
                // RFC 3339 stamps sort chronologically
                if newest.as_ref().map_or(true, |n| name > *n) {
                    newest = Some(name);
                }
            }
        }
        newest
            .map(|name| self.config.output_root.join(name))
            .ok_or_else(|| RemoteError::new("No recorded squeue results found"))
    }

    async fn read_snapshots(dir: &Path) -> RemoteResult<Vec<QueueSnapshot>> {
        let mut snapshots = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_snapshot = path.extension().is_some_and(|ext| ext == "json")
                && path.file_name().is_some_and(|name| name != "ocel.json");
            if !is_snapshot {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<QueueSnapshot>(&raw) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot")
                }
            }
        }
        Ok(snapshots)
    }

    async fn stop_sampler(&self) -> Option<LoopInfo> {
        let sampling = self.sampling.lock().await.take()?;
        sampling.token.cancel();
        if let Err(e) = sampling.handle.await {
            tracing::warn!(error = %e, "Sampling task ended abnormally");
        }
        Some(sampling.info)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn login(&self, credential: &Credential) -> RemoteResult<String> {
        let (host, port) = &credential.host;
        // Confirms the SLURM tools are reachable for this session
        let version = self.runner.run("squeue --version").await?;
        tracing::info!(
            host = %host,
            port,
            username = %credential.username,
            slurm = %version.trim(),
            "Session opened"
        );
        *self.session.write().await = Some(LocalSession {
            username: credential.username.clone(),
            host: host.clone(),
        });
        Ok(format!("Logged in as {} on {}", credential.username, host))
    }

    async fn logout(&self) -> RemoteResult<String> {
        let session = self.session.write().await.take();
        match session {
            Some(session) => {
                if let Some(info) = self.stop_sampler().await {
                    tracing::info!(dir = %info.output_path.display(), "Stopped sampling loop on logout");
                }
                tracing::info!(username = %session.username, host = %session.host, "Session closed");
                Ok("Logged out".to_string())
            }
            None => Err(RemoteError::new(NO_CLIENT)),
        }
    }

    async fn is_logged_in(&self) -> RemoteResult<bool> {
        Ok(self.session.read().await.is_some())
    }

    async fn run_squeue(&self) -> RemoteResult<String> {
        self.require_session().await?;
        let snapshot = Self::capture(self.runner.as_ref()).await?;
        tokio::fs::create_dir_all(&self.config.output_root).await?;
        Self::write_snapshot(&self.config.output_root, &snapshot).await?;
        Ok(format!(
            "Got {} jobs at {}.",
            snapshot.rows.len(),
            snapshot.time.to_rfc3339()
        ))
    }

    async fn start_squeue_loop(&self, interval_seconds: u32) -> RemoteResult<String> {
        self.require_session().await?;
        if interval_seconds == 0 {
            return Err(RemoteError::new("Interval must be positive"));
        }

        let mut sampling = self.sampling.lock().await;
        if sampling.is_some() {
            return Err(RemoteError::new("Loop already running"));
        }

        let running_since = Utc::now();
        let output_path = self
            .config
            .output_root
            .join(format!("{LOOP_DIR_PREFIX}{}", file_stamp(running_since)));
        tokio::fs::create_dir_all(&output_path).await?;

        let token = CancellationToken::new();
        let handle = self.spawn_sampler(interval_seconds, output_path.clone(), token.clone());
        tracing::info!(
            interval_seconds,
            dir = %output_path.display(),
            "Sampling loop started"
        );
        *sampling = Some(SamplingLoop {
            info: LoopInfo {
                interval_seconds,
                running_since,
                output_path,
            },
            token,
            handle,
        });
        Ok("Loop running in background".to_string())
    }

    async fn stop_squeue_loop(&self) -> RemoteResult<String> {
        match self.stop_sampler().await {
            Some(info) => Ok(format!(
                "Stopped loop running since {}",
                info.running_since.to_rfc3339()
            )),
            None => Err(RemoteError::new("No loop currently running")),
        }
    }

    async fn get_loop_info(&self) -> RemoteResult<Option<LoopInfo>> {
        Ok(self
            .sampling
            .lock()
            .await
            .as_ref()
            .map(|sampling| sampling.info.clone()))
    }

    async fn get_squeue(&self) -> RemoteResult<QueueSnapshot> {
        self.require_session().await?;
        Self::capture(self.runner.as_ref()).await
    }

    async fn extract_ocel(&self) -> RemoteResult<String> {
        let dir = self.latest_loop_dir().await?;
        let snapshots = Self::read_snapshots(&dir).await?;
        let ocel = build_ocel(&snapshots);
        let path = dir.join("ocel.json");
        tokio::fs::write(&path, serde_json::to_vec(&ocel)?).await?;
        tracing::info!(
            path = %path.display(),
            snapshots = snapshots.len(),
            events = ocel.events.len(),
            objects = ocel.objects.len(),
            "Extracted OCEL"
        );
        Ok(path.display().to_string())
    }

    async fn start_test_job(&self) -> RemoteResult<String> {
        self.require_session().await?;
        let job = &self.config.test_job;
        let folder = format!(
            "{}_{}",
            Utc::now().format("%Y%m%dT%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let dir = format!("{}/{}", job.root_dir, folder);
        let script = test_job_script(job, &folder);

        self.runner
            .run(&format!(
                "mkdir -p {dir} && printf '%s' {script} > {dir}/start.sh",
                dir = shell_quote(&dir),
                script = shell_quote(&script),
            ))
            .await?;
        let output = self
            .runner
            .run(&format!("cd {} && sbatch start.sh", shell_quote(&dir)))
            .await?;
        let job_id = parse_sbatch_output(&output)?;
        tracing::info!(job_id = %job_id, dir = %dir, "Submitted test job");
        Ok(job_id)
    }

    async fn check_job_status(&self, job_id: &str) -> RemoteResult<JobStatus> {
        self.require_session().await?;
        if !is_valid_job_id(job_id) {
            return Err(RemoteError::new(format!("Invalid job id: {job_id}")));
        }
        let output = match self.runner.run(&squeue_job_command(job_id)).await {
            Ok(output) => output,
            // squeue rejects ids it no longer knows
            Err(e) if e.0.contains("Invalid job id") => return Ok(JobStatus::NotFound),
            Err(e) => return Err(e),
        };
        let rows = parse_output(&output);
        let row = rows.iter().find(|r| r.job_id == job_id).or(rows.first());
        Ok(JobStatus::from_row(row))
    }

    fn subscribe_squeue(&self) -> broadcast::Receiver<QueueSnapshot> {
        self.tx.subscribe()
    }
}
