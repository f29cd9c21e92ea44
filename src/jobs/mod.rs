//! Test-job submission and status polling.

pub mod monitor;

pub use monitor::{JobMonitor, JobView};
