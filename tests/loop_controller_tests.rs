//! Sampling-loop controller tests: interval checks, start/stop and status refresh.


use std::sync::Arc;
use std::time::Duration;

use hpc_monitor::backend::memory::{InMemoryBackend, Op};
use hpc_monitor::backend::Backend;
use hpc_monitor::error::MonitorError;
use hpc_monitor::notify::{Level, Notifier};
use hpc_monitor::sampling::{LoopController, LoopState};
use tokio_util::sync::CancellationToken;

fn controller(backend: Arc<InMemoryBackend>, min_refresh: Duration) -> (LoopController, Notifier) {
    let notifier = Notifier::new();
    (
        LoopController::new(backend, notifier.clone(), min_refresh),
        notifier,
    )
}

#[tokio::test]
async fn test_start_issues_remote_call_only_for_valid_intervals() {
    let backend = Arc::new(InMemoryBackend::new());
    let (loops, _notifier) = controller(backend.clone(), Duration::ZERO);

    for n in [-1, 0, 1, 2] {
        assert!(matches!(
            loops.start(n).await,
            Err(MonitorError::InvalidInterval(_))
        ));
    }
    for raw in ["2.5", "abc", "", "3s"] {
        assert!(matches!(
            loops.start_from_input(raw).await,
            Err(MonitorError::InvalidInterval(_))
        ));
    }
    assert_eq!(backend.calls(Op::StartLoop), 0);

    loops.start(3).await.unwrap();
    assert_eq!(backend.calls(Op::StartLoop), 1);
}

#[tokio::test]
async fn test_start_five_reports_running() {
    let backend = Arc::new(InMemoryBackend::new());
    let (loops, notifier) = controller(backend, Duration::ZERO);

    let state = loops.start(5).await.unwrap();
    match state {
        LoopState::Running(info) => {
            assert_eq!(info.interval_seconds, 5);
            assert!(info
                .output_path
                .to_string_lossy()
                .starts_with("squeue_results_"));
        }
        LoopState::Idle => panic!("loop should be running"),
    }
    assert!(loops.current().is_running());
    assert!(notifier.active().iter().any(|n| n.level == Level::Success));
}

#[tokio::test]
async fn test_start_failure_stays_idle() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.fail_next(Op::StartLoop, "No logged-in client available.");
    let (loops, notifier) = controller(backend, Duration::ZERO);

    let err = loops.start(5).await.unwrap_err();
    assert!(matches!(err, MonitorError::Remote(_)));
    assert_eq!(loops.current(), LoopState::Idle);
    assert!(notifier
        .active()
        .iter()
        .any(|n| n.level == Level::Error && n.message.contains("No logged-in client")));
}

#[tokio::test]
async fn test_stop_running_loop() {
    let backend = Arc::new(InMemoryBackend::new());
    let (loops, _notifier) = controller(backend.clone(), Duration::ZERO);
    loops.start(5).await.unwrap();

    assert_eq!(loops.stop().await.unwrap(), LoopState::Idle);
    assert_eq!(backend.calls(Op::StopLoop), 1);
    // Stop always refreshes afterwards
    assert_eq!(backend.calls(Op::GetLoopInfo), 2);
}

#[tokio::test]
async fn test_stop_without_loop_is_a_no_op() {
    let backend = Arc::new(InMemoryBackend::new());
    let (loops, notifier) = controller(backend.clone(), Duration::ZERO);

    assert_eq!(loops.stop().await.unwrap(), LoopState::Idle);
    assert_eq!(backend.calls(Op::StopLoop), 1);
    assert!(notifier.active().is_empty());
}

#[tokio::test]
async fn test_stop_failure_with_loop_still_running_is_surfaced() {
    let backend = Arc::new(InMemoryBackend::new());
    let (loops, notifier) = controller(backend.clone(), Duration::ZERO);
    loops.start(5).await.unwrap();
    backend.fail_next(Op::StopLoop, "ssh timeout");

    let err = loops.stop().await.unwrap_err();
    assert!(err.to_string().contains("ssh timeout"));
    assert!(loops.current().is_running());
    assert!(notifier
        .active()
        .iter()
        .any(|n| n.level == Level::Error && n.message.contains("ssh timeout")));
}

#[tokio::test]
async fn test_status_error_reads_as_idle() {
    let backend = Arc::new(InMemoryBackend::new());
    let (loops, _notifier) = controller(backend.clone(), Duration::ZERO);
    loops.start(5).await.unwrap();

    backend.fail_next(Op::GetLoopInfo, "No loop currently running");
    assert_eq!(loops.status().await, LoopState::Idle);
    assert!(loops.status().await.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_start_is_busy() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.delay_next(Op::StartLoop, Duration::from_secs(2));
    let (loops, _notifier) = controller(backend.clone(), Duration::ZERO);
    let loops = Arc::new(loops);

    let first = {
        let loops = Arc::clone(&loops);
        tokio::spawn(async move { loops.start(5).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(loops.is_loading());
    assert!(matches!(loops.stop().await, Err(MonitorError::Busy(_))));
    assert!(matches!(loops.start(5).await, Err(MonitorError::Busy(_))));

    first.await.unwrap().unwrap();
    assert!(!loops.is_loading());
    assert_eq!(backend.calls(Op::StartLoop), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_status_response_is_discarded() {
    let backend = Arc::new(InMemoryBackend::new());
    let (loops, _notifier) = controller(backend.clone(), Duration::ZERO);
    let loops = Arc::new(loops);

    // First fetch sees no loop but answers late
    backend.delay_next(Op::GetLoopInfo, Duration::from_secs(5));
    let slow = {
        let loops = Arc::clone(&loops);
        tokio::spawn(async move { loops.status().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    backend.start_squeue_loop(5).await.unwrap();
    assert!(loops.status().await.is_running());

    // The late Idle answer must not overwrite the newer Running one
    let returned = slow.await.unwrap();
    assert!(returned.is_running());
    assert!(loops.current().is_running());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_if_stale_debounces() {
    let backend = Arc::new(InMemoryBackend::new());
    let (loops, _notifier) = controller(backend.clone(), Duration::from_secs(1));

    loops.refresh_if_stale().await;
    loops.refresh_if_stale().await;
    loops.refresh_if_stale().await;
    assert_eq!(backend.calls(Op::GetLoopInfo), 1);

    tokio::time::advance(Duration::from_millis(1100)).await;
    loops.refresh_if_stale().await;
    assert_eq!(backend.calls(Op::GetLoopInfo), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refresher_runs_until_cancelled() {
    let backend = Arc::new(InMemoryBackend::new());
    let (loops, _notifier) = controller(backend.clone(), Duration::ZERO);
    let loops = Arc::new(loops);
    let token = CancellationToken::new();

    let handle = loops.spawn_refresher(Duration::from_secs(5), token.clone());
    tokio::time::sleep(Duration::from_secs(11)).await;
    let calls = backend.calls(Op::GetLoopInfo);
    assert_eq!(calls, 3);

    token.cancel();
    handle.await.unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(backend.calls(Op::GetLoopInfo), calls);
}
