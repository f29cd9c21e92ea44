use std::path::PathBuf;
use std::time::Duration;

/// SSH port used when the port field is left empty.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Smallest sampling-loop interval the client will ever request.
pub const MIN_LOOP_INTERVAL_SECS: i64 = 3;

/// Client-side timing and sizing knobs for the dashboard core.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Cadence of the tracked job's status poll
    pub job_poll_interval: Duration,
    /// Points kept by the chart downsampler (plus the newest point)
    pub max_display_points: usize,
    /// Ring buffer size of the aggregated queue history
    pub history_capacity: usize,
    /// Loop-status refreshes closer together than this reuse the last answer
    pub status_refresh_min_interval: Duration,
    /// Directory of the persisted-credential store
    pub store_dir: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            job_poll_interval: Duration::from_secs(3),
            max_display_points: 30,
            history_capacity: 10_000,
            status_refresh_min_interval: Duration::from_secs(1),
            store_dir: PathBuf::from(".hpc-monitor"),
        }
    }
}

impl MonitorConfig {
    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = dir.into();
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    pub fn with_job_poll_interval(mut self, interval: Duration) -> Self {
        self.job_poll_interval = interval;
        self
    }

    pub fn with_status_refresh_min_interval(mut self, interval: Duration) -> Self {
        self.status_refresh_min_interval = interval;
        self
    }
}

/// Parameters of the batch script submitted by `start_test_job`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestJobConfig {
    /// Remote directory that receives one sub-folder per submission
    pub root_dir: String,
    pub num_cpus: usize,
    /// SLURM time limit, `days-hours:minutes:seconds`
    pub time: String,
    pub command: String,
}

impl Default for TestJobConfig {
    fn default() -> Self {
        Self {
            root_dir: "hpc_experiments".to_string(),
            num_cpus: 1,
            time: "0-00:01:00".to_string(),
            command: "sleep 30".to_string(),
        }
    }
}

/// Configuration of the host-side backend that shells out to SLURM.
#[derive(Debug, Clone)]
pub struct LocalBackendConfig {
    /// Parent directory of each sampling loop's output folder
    pub output_root: PathBuf,
    /// Capacity of the snapshot broadcast channel
    pub event_buffer: usize,
    pub test_job: TestJobConfig,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("."),
            event_buffer: 64,
            test_job: TestJobConfig::default(),
        }
    }
}

impl LocalBackendConfig {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            ..Default::default()
        }
    }

    pub fn with_test_job(mut self, test_job: TestJobConfig) -> Self {
        self.test_job = test_job;
        self
    }
}
