//! Sample aggregation and chart derivation tests.


use std::sync::Arc;
use std::time::Duration;

use hpc_monitor::backend::memory::{InMemoryBackend, Op};
use hpc_monitor::backend::JobState;
use hpc_monitor::error::MonitorError;
use hpc_monitor::sampling::{SampleAggregator, SeriesMode};
use test_harness::{assert_eventually, at, logged_in_client, snapshot};

#[test]
fn test_exit_mode_tracks_completions_only() {
    let aggregator = SampleAggregator::new(100, 30);
    aggregator.ingest(&snapshot(0, &[(JobState::Running, 2), (JobState::Pending, 1)]));
    aggregator.ingest(&snapshot(
        10,
        &[(JobState::Running, 1), (JobState::Completed, 1)],
    ));
    aggregator.ingest(&snapshot(20, &[(JobState::Completed, 3)]));

    let chart = aggregator.chart(SeriesMode::Exit);
    assert_eq!(chart.times, vec![at(0), at(10), at(20)]);
    assert!(chart.series_for(&JobState::Running).is_none());
    assert!(chart.series_for(&JobState::Pending).is_none());

    let completed = chart.series_for(&JobState::Completed).unwrap();
    assert_eq!(completed.values, vec![0, 1, 3]);
    // Exit states are always present, seen or not
    let failed = chart.series_for(&JobState::Failed).unwrap();
    assert_eq!(failed.values, vec![0, 0, 0]);
    assert_eq!(chart.y_min, 0);
}

#[test]
fn test_all_mode_adds_observed_states_after_baseline() {
    let aggregator = SampleAggregator::new(100, 30);
    aggregator.ingest(&snapshot(0, &[(JobState::Timeout, 1)]));
    aggregator.ingest(&snapshot(5, &[(JobState::Other("SUSPENDED".into()), 2)]));

    let chart = aggregator.chart(SeriesMode::All);
    let states: Vec<JobState> = chart.series.iter().map(|s| s.state.clone()).collect();
    assert_eq!(
        states,
        vec![
            JobState::Pending,
            JobState::Running,
            JobState::Completing,
            JobState::Timeout,
            JobState::Other("SUSPENDED".into()),
        ]
    );
    let suspended = chart
        .series_for(&JobState::Other("SUSPENDED".into()))
        .unwrap();
    assert_eq!(suspended.color, "#808080");
    assert_eq!(suspended.values, vec![0, 2]);
}

#[test]
fn test_history_keeps_arrival_order() {
    let aggregator = SampleAggregator::new(100, 30);
    // Out-of-order timestamps are kept as they arrive
    for secs in [30, 10, 20] {
        aggregator.ingest(&snapshot(secs, &[(JobState::Running, 1)]));
    }
    let times: Vec<_> = aggregator.entries().iter().map(|e| e.time).collect();
    assert_eq!(times, vec![at(30), at(10), at(20)]);
    assert_eq!(aggregator.len(), 3);
    assert_eq!(aggregator.total_ingested(), 3);
}

#[test]
fn test_empty_snapshot_is_still_an_entry() {
    let aggregator = SampleAggregator::new(100, 30);
    aggregator.ingest(&snapshot(0, &[]));
    assert_eq!(aggregator.len(), 1);
    assert!(aggregator.entries()[0].counts.is_empty());

    let chart = aggregator.chart(SeriesMode::All);
    assert_eq!(chart.times.len(), 1);
    assert_eq!(chart.series_for(&JobState::Running).unwrap().values, vec![0]);
}

#[test]
fn test_capacity_evicts_oldest() {
    let aggregator = SampleAggregator::new(5, 30);
    for secs in 0..8 {
        aggregator.ingest(&snapshot(secs, &[(JobState::Pending, 1)]));
    }
    assert_eq!(aggregator.len(), 5);
    assert_eq!(aggregator.total_ingested(), 8);
    assert_eq!(aggregator.entries()[0].time, at(3));
}

#[test]
fn test_long_history_is_downsampled_to_display_width() {
    let aggregator = SampleAggregator::new(10_000, 30);
    for secs in 0..100 {
        aggregator.ingest(&snapshot(secs, &[(JobState::Running, secs as usize % 4)]));
    }
    assert_eq!(aggregator.len(), 100);

    let chart = aggregator.chart(SeriesMode::All);
    assert!(chart.times.len() <= 31);
    assert_eq!(chart.times.first(), Some(&at(0)));
    assert_eq!(chart.times.last(), Some(&at(99)));
    for series in &chart.series {
        assert_eq!(series.values.len(), chart.times.len());
    }
    // Full history is untouched by the chart
    assert_eq!(aggregator.len(), 100);
}

#[test]
fn test_stacked_series_accumulate() {
    let aggregator = SampleAggregator::new(100, 30);
    aggregator.ingest(&snapshot(
        0,
        &[(JobState::Pending, 2), (JobState::Running, 3)],
    ));
    let stacked = aggregator.chart(SeriesMode::All).stacked();
    assert_eq!(stacked[0].state, JobState::Pending);
    assert_eq!(stacked[0].values, vec![2]);
    assert_eq!(stacked[1].values, vec![5]);
    assert_eq!(stacked[2].values, vec![5]);
}

#[tokio::test]
async fn test_pull_once_ingests_backend_snapshot() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.push_snapshot(snapshot(0, &[(JobState::Running, 4)]));
    let aggregator = SampleAggregator::new(100, 30);

    let pulled = aggregator.pull_once(backend.as_ref()).await.unwrap();
    assert_eq!(pulled.rows.len(), 4);
    assert_eq!(aggregator.len(), 1);
    assert_eq!(backend.calls(Op::GetSqueue), 1);
}

#[tokio::test]
async fn test_pull_failure_leaves_history_untouched() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.fail_next(Op::GetSqueue, "squeue: error: slurm_load_jobs");
    let aggregator = SampleAggregator::new(100, 30);

    assert!(matches!(
        aggregator.pull_once(backend.as_ref()).await,
        Err(MonitorError::Remote(_))
    ));
    assert!(aggregator.is_empty());
}

#[tokio::test]
async fn test_client_follows_pushed_snapshots() {
    let backend = Arc::new(InMemoryBackend::new());
    let client = logged_in_client(backend.clone()).await;
    client.start().await;

    backend.push_snapshot(snapshot(0, &[(JobState::Pending, 1)]));
    backend.push_snapshot(snapshot(5, &[(JobState::Running, 1)]));

    let aggregator = Arc::clone(&client.aggregator);
    assert_eventually(
        || {
            let aggregator = Arc::clone(&aggregator);
            async move { aggregator.len() == 2 }
        },
        Duration::from_secs(2),
        "pushed snapshots should be ingested",
    )
    .await;

    client.shutdown().await;
    backend.push_snapshot(snapshot(10, &[(JobState::Running, 1)]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.aggregator.len(), 2);
}

#[tokio::test]
async fn test_chart_requires_session() {
    let backend = Arc::new(InMemoryBackend::new());
    let client = test_harness::client_with(backend, test_harness::test_config());
    client.session.probe().await;

    assert!(matches!(
        client.chart(SeriesMode::All),
        Err(MonitorError::NotAuthenticated)
    ));
    assert!(matches!(
        client.pull_snapshot().await,
        Err(MonitorError::NotAuthenticated)
    ));
}
