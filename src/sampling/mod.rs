//! The backend sampling loop and the client-side history built from it.

pub mod aggregator;
pub mod controller;
pub mod series;

pub use aggregator::{follow, HistoryEntry, SampleAggregator};
pub use controller::{check_interval, parse_interval, LoopController, LoopState};
pub use series::{downsample_indices, ChartData, Series, SeriesMode};
