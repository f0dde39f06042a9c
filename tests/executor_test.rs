//! Integration tests for executors and works started on a node

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{eventually, start_node};
use fleetdist::distribution::{DistributionError, ExecutorConfig, RunContext, SupervisorState};
use fleetdist::store::MemoryStore;

fn every(secs: u64) -> ExecutorConfig {
    ExecutorConfig::default().with_reset_interval(Duration::from_secs(secs))
}

#[tokio::test(start_paused = true)]
async fn test_executor_periodic_reset() {
    let store = MemoryStore::new();
    let (node, _) = start_node(&store, "a").await;
    let starts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&starts);
    node.start_executor("jobs", every(60), move |ctx: RunContext| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let worker = ctx.clone();
            ctx.spawn(async move { worker.cancelled().await });
            Ok(())
        }
    })
    .await
    .unwrap();

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(node.supervisor_state("jobs"), Some(SupervisorState::Running));

    tokio::time::sleep(Duration::from_secs(150)).await;
    assert_eq!(starts.load(Ordering::SeqCst), 3);

    node.shutdown().await;
    assert_eq!(node.supervisor_state("jobs"), Some(SupervisorState::Stopped));
}

#[tokio::test]
async fn test_executor_sees_new_assignment_after_join() {
    let store = MemoryStore::new();
    let (a, _) = start_node(&store, "a").await;
    let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));

    let recorded = Arc::clone(&seen);
    a.start_executor("jobs", every(3600), move |ctx: RunContext| {
        let recorded = Arc::clone(&recorded);
        async move {
            recorded.lock().unwrap().push(ctx.assigner().nodes());
            Ok(())
        }
    })
    .await
    .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![vec!["a".to_string()]]);

    let (b, _) = start_node(&store, "b").await;
    eventually(5, || seen.lock().unwrap().len() == 2).await;
    assert_eq!(seen.lock().unwrap()[1], vec!["a", "b"]);

    b.shutdown().await;
    eventually(5, || seen.lock().unwrap().len() == 3).await;
    assert_eq!(seen.lock().unwrap()[2], vec!["a"]);

    a.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_work_runs_never_overlap() {
    let store = MemoryStore::new();
    let (a, _) = start_node(&store, "a").await;
    let active = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));

    let (active_c, overlaps_c, runs_c) =
        (Arc::clone(&active), Arc::clone(&overlaps), Arc::clone(&runs));
    a.start_work("worker", every(10), move |ctx: RunContext| {
        let active = Arc::clone(&active_c);
        let overlaps = Arc::clone(&overlaps_c);
        let runs = Arc::clone(&runs_c);
        async move {
            if active.fetch_add(1, Ordering::SeqCst) > 0 {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            runs.fetch_add(1, Ordering::SeqCst);
            ctx.ready();
            ctx.cancelled().await;
            // Slow cleanup, the next run must still wait for it
            tokio::time::sleep(Duration::from_secs(3)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await
    .unwrap();

    let (b, _) = start_node(&store, "b").await;
    tokio::time::sleep(Duration::from_secs(45)).await;
    b.shutdown().await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(runs.load(Ordering::SeqCst) >= 4);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);

    a.shutdown().await;
    assert_eq!(active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_executor_first_run_error_is_returned() {
    let store = MemoryStore::new();
    let (node, _) = start_node(&store, "a").await;

    let result = node
        .start_executor("broken", every(60), |_ctx: RunContext| async {
            Err("cannot open the queue".into())
        })
        .await;

    match result {
        Err(DistributionError::Initialization { name, reason }) => {
            assert_eq!(name, "broken");
            assert_eq!(reason, "cannot open the queue");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(node.supervisor_state("broken"), None);

    // The name is free again after a failed start
    node.start_executor("broken", every(60), |_ctx: RunContext| async { Ok(()) })
        .await
        .unwrap();

    node.shutdown().await;
}

#[tokio::test]
async fn test_work_error_before_ready_is_returned() {
    let store = MemoryStore::new();
    let (node, _) = start_node(&store, "a").await;

    let result = node
        .start_work("worker", every(60), |_ctx: RunContext| async {
            Err("no credentials".into())
        })
        .await;
    assert!(matches!(result, Err(DistributionError::Initialization { .. })));

    node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_reset_is_retried() {
    let store = MemoryStore::new();
    let (node, _) = start_node(&store, "a").await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&attempts);
    node.start_executor("flaky", every(30), move |_ctx: RunContext| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 1 {
                return Err("temporary failure".into());
            }
            Ok(())
        }
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(node.supervisor_state("flaky"), Some(SupervisorState::ResetPending));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(node.supervisor_state("flaky"), Some(SupervisorState::Running));

    node.shutdown().await;
}

#[tokio::test]
#[should_panic(expected = "is already started")]
async fn test_duplicate_name_panics() {
    let store = MemoryStore::new();
    let (node, _) = start_node(&store, "a").await;

    node.start_executor("jobs", every(60), |_ctx: RunContext| async { Ok(()) })
        .await
        .unwrap();
    let _ = node
        .start_work("jobs", every(60), |_ctx: RunContext| async { Ok(()) })
        .await;
}

#[tokio::test]
async fn test_start_after_shutdown_is_rejected() {
    let store = MemoryStore::new();
    let (node, _) = start_node(&store, "a").await;
    node.shutdown().await;

    let result = node
        .start_executor("late", every(60), |_ctx: RunContext| async { Ok(()) })
        .await;
    assert!(matches!(result, Err(DistributionError::ShuttingDown)));
}

#[tokio::test]
async fn test_invalid_reset_interval() {
    let store = MemoryStore::new();
    let (node, _) = start_node(&store, "a").await;

    let result = node
        .start_executor(
            "jobs",
            ExecutorConfig::default().with_reset_interval(Duration::ZERO),
            |_ctx: RunContext| async { Ok(()) },
        )
        .await;
    assert!(matches!(result, Err(DistributionError::InvalidConfig { .. })));

    node.shutdown().await;
}
