pub mod backend;
pub mod client;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod jobs;
pub mod notify;
pub mod sampling;
pub mod session;
pub mod shutdown;
