//! Local backend tests against a scripted command runner.


use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hpc_monitor::backend::local::{CommandRunner, LocalBackend};
use hpc_monitor::backend::ocel::Ocel;
use hpc_monitor::backend::{Backend, JobState, JobStatus, QueueSnapshot};
use hpc_monitor::config::{LocalBackendConfig, TestJobConfig};
use hpc_monitor::error::{RemoteError, RemoteResult};
use hpc_monitor::session::credential::{validate, Credential};
use test_harness::password_form;

const ROWS: &str = "\
proj01|4242|n23m0001|8|1|grp01|train|c23ms|RUNNING|None|2024-05-01T10:00:05|2024-05-01T10:30:05|2024-05-01T09:59:00|/home/ab/run|start.sh
proj02|4243|n/a|1|1|grp02|sleep|c23ms|PENDING|Priority|N/A|N/A|2024-05-01T09:59:30|/home/cd|sleep 30
";

/// Answers commands by prefix and records every command it was given.
#[derive(Default)]
struct ScriptedRunner {
    responses: Mutex<Vec<(String, RemoteResult<String>)>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn new() -> Self {
        let runner = Self::default();
        runner.respond("squeue --version", Ok("slurm 23.02.7\n".to_string()));
        runner.respond("squeue -h", Ok(ROWS.to_string()));
        runner.respond("mkdir -p", Ok(String::new()));
        runner.respond("cd ", Ok("Submitted batch job 5150\n".to_string()));
        runner
    }

    /// Later responses for the same prefix take precedence.
    fn respond(&self, prefix: &str, result: RemoteResult<String>) {
        self.responses
            .lock()
            .unwrap()
            .insert(0, (prefix.to_string(), result));
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &str) -> RemoteResult<String> {
        self.commands.lock().unwrap().push(command.to_string());
        self.responses
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| Err(RemoteError::new(format!("unexpected command: {command}"))))
    }
}

fn credential() -> Credential {
    validate(&password_form("ab123456", "login.example.org")).unwrap()
}

fn backend(root: &Path) -> (LocalBackend, Arc<ScriptedRunner>) {
    let runner = Arc::new(ScriptedRunner::new());
    let config = LocalBackendConfig::new(root).with_test_job(TestJobConfig {
        root_dir: "/scratch/ab123456/tests".to_string(),
        ..Default::default()
    });
    (LocalBackend::with_runner(config, runner.clone()), runner)
}

async fn logged_in(root: &Path) -> (LocalBackend, Arc<ScriptedRunner>) {
    let (backend, runner) = backend(root);
    backend.login(&credential()).await.unwrap();
    (backend, runner)
}

fn loop_dirs(root: &Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("squeue_results_")
        })
        .collect()
}

#[tokio::test]
async fn test_login_checks_slurm_tools() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, runner) = backend(dir.path());
    assert!(!backend.is_logged_in().await.unwrap());

    let message = backend.login(&credential()).await.unwrap();
    assert!(message.contains("ab123456"));
    assert!(backend.is_logged_in().await.unwrap());
    assert_eq!(runner.commands(), vec!["squeue --version".to_string()]);
}

#[tokio::test]
async fn test_login_fails_without_slurm() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, runner) = backend(dir.path());
    runner.respond("squeue --version", Err(RemoteError::new("sh: squeue: not found")));

    let err = backend.login(&credential()).await.unwrap_err();
    assert_eq!(err.to_string(), "sh: squeue: not found");
    assert!(!backend.is_logged_in().await.unwrap());
}

#[tokio::test]
async fn test_operations_require_session() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, runner) = backend(dir.path());

    for err in [
        backend.run_squeue().await.unwrap_err(),
        backend.start_squeue_loop(5).await.unwrap_err(),
        backend.start_test_job().await.unwrap_err(),
        backend.logout().await.unwrap_err(),
    ] {
        assert_eq!(err.to_string(), "No logged-in client available.");
    }
    assert!(backend.get_squeue().await.is_err());
    assert!(backend.check_job_status("4242").await.is_err());
    assert!(runner.commands().is_empty());
}

#[tokio::test]
async fn test_run_squeue_writes_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, _runner) = logged_in(dir.path()).await;

    let message = backend.run_squeue().await.unwrap();
    assert!(message.starts_with("Got 2 jobs at "));

    let files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    assert_eq!(files.len(), 1);
    let snapshot: QueueSnapshot =
        serde_json::from_slice(&std::fs::read(&files[0]).unwrap()).unwrap();
    assert_eq!(snapshot.rows.len(), 2);
    assert_eq!(snapshot.rows[0].job_id, "4242");
}

#[tokio::test]
async fn test_get_squeue_parses_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, runner) = logged_in(dir.path()).await;

    let snapshot = backend.get_squeue().await.unwrap();
    let counts = snapshot.tally();
    assert_eq!(counts.get(&JobState::Running), Some(&1));
    assert_eq!(counts.get(&JobState::Pending), Some(&1));
    assert!(runner.commands()[1].starts_with("squeue -h -a -t all --format='%a|"));
}

#[tokio::test]
async fn test_loop_samples_until_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, _runner) = logged_in(dir.path()).await;
    let mut rx = backend.subscribe_squeue();

    assert_eq!(
        backend.start_squeue_loop(1).await.unwrap(),
        "Loop running in background"
    );
    let info = backend.get_loop_info().await.unwrap().unwrap();
    assert_eq!(info.interval_seconds, 1);
    assert!(info.output_path.starts_with(dir.path()));

    let pushed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed.rows.len(), 2);

    let err = backend.start_squeue_loop(1).await.unwrap_err();
    assert_eq!(err.to_string(), "Loop already running");

    backend.stop_squeue_loop().await.unwrap();
    assert!(backend.get_loop_info().await.unwrap().is_none());
    let written = std::fs::read_dir(&info.output_path).unwrap().count();
    assert!(written >= 1);

    let err = backend.stop_squeue_loop().await.unwrap_err();
    assert_eq!(err.to_string(), "No loop currently running");
}

#[tokio::test]
async fn test_logout_stops_loop() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, _runner) = logged_in(dir.path()).await;
    backend.start_squeue_loop(60).await.unwrap();

    backend.logout().await.unwrap();
    assert!(!backend.is_logged_in().await.unwrap());
    assert!(backend.get_loop_info().await.unwrap().is_none());
}

#[tokio::test]
async fn test_extract_ocel_from_latest_loop_folder() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, _runner) = logged_in(dir.path()).await;
    let mut rx = backend.subscribe_squeue();
    backend.start_squeue_loop(1).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    backend.stop_squeue_loop().await.unwrap();

    let path = backend.extract_ocel().await.unwrap();
    assert!(path.ends_with("ocel.json"));
    let dirs = loop_dirs(dir.path());
    assert_eq!(dirs.len(), 1);
    assert!(Path::new(&path).starts_with(&dirs[0]));

    let ocel: Ocel = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    let jobs = ocel.objects.iter().filter(|o| o.object_type == "Job").count();
    assert_eq!(jobs, 2);
    assert!(ocel.events.iter().any(|e| e.event_type == "Submit Job"));

    // A second extraction ignores the previous ocel.json
    backend.extract_ocel().await.unwrap();
}

#[tokio::test]
async fn test_extract_ocel_without_recordings_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, _runner) = logged_in(dir.path()).await;

    let err = backend.extract_ocel().await.unwrap_err();
    assert_eq!(err.to_string(), "No recorded squeue results found");
}

#[tokio::test]
async fn test_start_test_job_writes_script_and_submits() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, runner) = logged_in(dir.path()).await;

    assert_eq!(backend.start_test_job().await.unwrap(), "5150");

    let commands = runner.commands();
    assert_eq!(commands.len(), 3);
    assert!(commands[1].starts_with("mkdir -p '/scratch/ab123456/tests/"));
    assert!(commands[1].contains("#SBATCH --cpus-per-task=1"));
    assert!(commands[1].contains("/start.sh"));
    assert!(commands[2].starts_with("cd '/scratch/ab123456/tests/"));
    assert!(commands[2].ends_with("&& sbatch start.sh"));
}

#[tokio::test]
async fn test_start_test_job_rejects_unexpected_sbatch_output() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, runner) = logged_in(dir.path()).await;
    runner.respond("cd ", Ok("sbatch: queued?\n".to_string()));

    let err = backend.start_test_job().await.unwrap_err();
    assert!(err.to_string().starts_with("Unexpected sbatch output"));
}

#[tokio::test]
async fn test_check_job_status_maps_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, runner) = logged_in(dir.path()).await;

    let status = backend.check_job_status("4243").await.unwrap();
    assert_eq!(status, JobStatus::Pending { start_time: None });
    assert!(runner
        .commands()
        .last()
        .unwrap()
        .contains("-j 4243 --format="));

    runner.respond("squeue -h", Ok(String::new()));
    assert_eq!(
        backend.check_job_status("4243").await.unwrap(),
        JobStatus::NotFound
    );

    runner.respond(
        "squeue -h",
        Err(RemoteError::new("slurm_load_jobs error: Invalid job id specified")),
    );
    assert_eq!(
        backend.check_job_status("4243").await.unwrap(),
        JobStatus::NotFound
    );

    runner.respond("squeue -h", Err(RemoteError::new("Socket timed out")));
    assert!(backend.check_job_status("4243").await.is_err());
}

#[tokio::test]
async fn test_check_job_status_rejects_bad_ids() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, runner) = logged_in(dir.path()).await;
    let before = runner.commands().len();

    let err = backend.check_job_status("1; reboot").await.unwrap_err();
    assert!(err.to_string().starts_with("Invalid job id"));
    assert_eq!(runner.commands().len(), before);
}
