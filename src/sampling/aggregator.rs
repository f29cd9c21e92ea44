use std::collections::{BTreeMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, JobState, QueueSnapshot};
use crate::error::Result;
use crate::sampling::series::{build_chart, ChartData, SeriesMode};

/// Per-state job counts of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub time: DateTime<Utc>,
    pub counts: BTreeMap<JobState, u32>,
}

#[derive(Debug, Default)]
struct History {
    entries: VecDeque<HistoryEntry>,
    /// Every state ever seen, first-seen order
    observed: Vec<JobState>,
    total: u64,
}

/// Accumulates queue snapshots into a bounded time series.
///
/// Entries are appended in arrival order and never reordered or merged.
/// Once `capacity` is reached the oldest entry is evicted.
#[derive(Debug)]
pub struct SampleAggregator {
    capacity: usize,
    max_points: usize,
    history: RwLock<History>,
}

impl SampleAggregator {
    pub fn new(capacity: usize, max_points: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            max_points,
            history: RwLock::new(History::default()),
        }
    }

    /// Tally `snapshot` by state and append it.
    pub fn ingest(&self, snapshot: &QueueSnapshot) {
        let counts = snapshot.tally();
        let mut history = self.history.write().unwrap_or_else(|e| e.into_inner());
        for state in counts.keys() {
            if !history.observed.contains(state) {
                history.observed.push(state.clone());
            }
        }
        if history.entries.len() == self.capacity {
            history.entries.pop_front();
        }
        history.entries.push_back(HistoryEntry {
            time: snapshot.time,
            counts,
        });
        history.total += 1;
    }

    /// Retained entries.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots ingested over the aggregator's lifetime, evicted ones included.
    pub fn total_ingested(&self) -> u64 {
        self.read().total
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.read().entries.iter().cloned().collect()
    }

    pub fn observed_states(&self) -> Vec<JobState> {
        self.read().observed.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, History> {
        self.history.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Downsampled chart of the full retained history.
    pub fn chart(&self, mode: SeriesMode) -> ChartData {
        let history = self.read();
        build_chart(
            history.entries.iter(),
            &history.observed,
            mode,
            self.max_points,
        )
    }

    /// Fetch one snapshot from the backend and ingest it.
    pub async fn pull_once(&self, backend: &dyn Backend) -> Result<QueueSnapshot> {
        let snapshot = backend.get_squeue().await?;
        self.ingest(&snapshot);
        tracing::debug!(rows = snapshot.rows.len(), "Ingested pulled snapshot");
        Ok(snapshot)
    }
}

/// Ingest every snapshot pushed on `rx` until `token` is cancelled or the
/// sender goes away.
pub fn follow(
    aggregator: std::sync::Arc<SampleAggregator>,
    mut rx: broadcast::Receiver<QueueSnapshot>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("Snapshot follower stopped");
                    break;
                }
                received = rx.recv() => match received {
                    Ok(snapshot) => aggregator.ingest(&snapshot),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Snapshot follower lagged, samples dropped");
                    }
                    Err(RecvError::Closed) => {
                        tracing::debug!("Snapshot channel closed");
                        break;
                    }
                },
            }
        }
    })
}
