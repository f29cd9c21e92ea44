//! Chart-ready series derived from the aggregated history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::JobState;
use crate::sampling::aggregator::HistoryEntry;

/// Color of states without an entry in the palette.
pub const DEFAULT_COLOR: &str = "#808080";

/// Which job states become series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesMode {
    /// Active baseline plus every state seen so far
    #[default]
    All,
    /// Only the exit states
    Exit,
}

impl std::str::FromStr for SeriesMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(SeriesMode::All),
            "exit" => Ok(SeriesMode::Exit),
            other => Err(format!("unknown series mode '{other}'")),
        }
    }
}

pub fn baseline_states() -> [JobState; 3] {
    [JobState::Pending, JobState::Running, JobState::Completing]
}

pub fn exit_states() -> [JobState; 4] {
    [
        JobState::Completed,
        JobState::Cancelled,
        JobState::Failed,
        JobState::OutOfMemory,
    ]
}

pub fn state_color(state: &JobState) -> &'static str {
    match state {
        JobState::Running => "#2ca02c",
        JobState::Pending => "#1f77b4",
        JobState::Completing => "#17becf",
        JobState::Completed => "#9467bd",
        JobState::Cancelled => "#ff7f0e",
        JobState::Failed => "#d62728",
        JobState::Timeout => "#bcbd22",
        JobState::OutOfMemory => "#8c564b",
        JobState::NodeFail => "#e377c2",
        JobState::Other(_) => DEFAULT_COLOR,
    }
}

/// Indices kept when showing `len` points on a chart of `max_points`.
///
/// Every `step`-th index is kept plus the last one, with
/// `step = max(1, ceil(len / max_points))`. The result is ascending, always
/// contains `len - 1` and never exceeds `max_points + 1` entries.
pub fn downsample_indices(len: usize, max_points: usize) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let step = len.div_ceil(max_points.max(1)).max(1);
    (0..len)
        .filter(|i| i % step == 0 || *i == len - 1)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Series {
    pub state: JobState,
    pub color: &'static str,
    pub values: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChartData {
    pub times: Vec<DateTime<Utc>>,
    pub series: Vec<Series>,
    pub y_min: u32,
}

impl ChartData {
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn series_for(&self, state: &JobState) -> Option<&Series> {
        self.series.iter().find(|s| &s.state == state)
    }

    /// Running totals across series, in series order, for stacked areas.
    pub fn stacked(&self) -> Vec<Series> {
        let mut totals = vec![0u32; self.times.len()];
        self.series
            .iter()
            .map(|series| {
                for (total, value) in totals.iter_mut().zip(&series.values) {
                    *total = total.saturating_add(*value);
                }
                Series {
                    state: series.state.clone(),
                    color: series.color,
                    values: totals.clone(),
                }
            })
            .collect()
    }
}

/// States to draw for `mode`, in display order.
///
/// `observed` is every state ever seen, in first-seen order.
pub fn visible_states(mode: SeriesMode, observed: &[JobState]) -> Vec<JobState> {
    match mode {
        SeriesMode::Exit => exit_states().to_vec(),
        SeriesMode::All => {
            let mut states = baseline_states().to_vec();
            for state in observed {
                if !states.contains(state) {
                    states.push(state.clone());
                }
            }
            states
        }
    }
}

/// Downsample `history` and split it into one series per visible state.
pub fn build_chart<'a>(
    history: impl ExactSizeIterator<Item = &'a HistoryEntry>,
    observed: &[JobState],
    mode: SeriesMode,
    max_points: usize,
) -> ChartData {
    let entries: Vec<&HistoryEntry> = history.collect();
    let picked: Vec<&HistoryEntry> = downsample_indices(entries.len(), max_points)
        .into_iter()
        .map(|i| entries[i])
        .collect();

    let series = visible_states(mode, observed)
        .into_iter()
        .map(|state| Series {
            color: state_color(&state),
            values: picked
                .iter()
                .map(|entry| count(&entry.counts, &state))
                .collect(),
            state,
        })
        .collect();

    ChartData {
        times: picked.iter().map(|entry| entry.time).collect(),
        series,
        y_min: 0,
    }
}

fn count(counts: &BTreeMap<JobState, u32>, state: &JobState) -> u32 {
    counts.get(state).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downsample_keeps_everything_when_short() {
        assert_eq!(downsample_indices(5, 30), vec![0, 1, 2, 3, 4]);
        assert!(downsample_indices(0, 30).is_empty());
        assert_eq!(downsample_indices(1, 30), vec![0]);
    }

    #[test]
    fn downsample_exact_multiple() {
        let picked = downsample_indices(60, 30);
        assert_eq!(picked.len(), 31);
        assert_eq!(picked[0], 0);
        assert_eq!(picked[1], 2);
        assert_eq!(*picked.last().unwrap(), 59);
    }

    #[test]
    fn downsample_bound_holds_for_all_lengths() {
        for len in 1..500 {
            for max in [1, 7, 30] {
                let picked = downsample_indices(len, max);
                assert!(picked.len() <= max + 1, "len={len} max={max}");
                assert_eq!(*picked.last().unwrap(), len - 1);
                assert!(picked.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }

    #[test]
    fn all_mode_adds_observed_states_after_baseline() {
        let observed = vec![JobState::Failed, JobState::Running];
        let states = visible_states(SeriesMode::All, &observed);
        assert_eq!(
            states,
            vec![
                JobState::Pending,
                JobState::Running,
                JobState::Completing,
                JobState::Failed
            ]
        );
    }

    #[test]
    fn unknown_states_get_default_color() {
        assert_eq!(
            state_color(&JobState::Other("PREEMPTED".to_string())),
            DEFAULT_COLOR
        );
        assert_ne!(state_color(&JobState::Running), DEFAULT_COLOR);
    }

    #[test]
    fn stacked_accumulates_in_series_order() {
        let chart = ChartData {
            times: vec![Utc::now(), Utc::now()],
            series: vec![
                Series {
                    state: JobState::Pending,
                    color: "a",
                    values: vec![1, 2],
                },
                Series {
                    state: JobState::Running,
                    color: "b",
                    values: vec![3, 0],
                },
            ],
            y_min: 0,
        };
        let stacked = chart.stacked();
        assert_eq!(stacked[0].values, vec![1, 2]);
        assert_eq!(stacked[1].values, vec![4, 2]);
    }

    #[test]
    fn series_mode_parses() {
        assert_eq!("exit".parse::<SeriesMode>().unwrap(), SeriesMode::Exit);
        assert_eq!("ALL".parse::<SeriesMode>().unwrap(), SeriesMode::All);
        assert!("some".parse::<SeriesMode>().is_err());
    }
}
