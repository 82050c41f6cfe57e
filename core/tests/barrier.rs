//! Reduce dispatch and output finalization barriers

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use terasort_common::Storage;
use terasort_core::{CollectingReporter, JobEvent, JobId, OutputMode, SortError};
use tracing_test::traced_test;

fn position(events: &[JobEvent], wanted: impl Fn(&JobEvent) -> bool) -> Option<usize> {
    events.iter().position(wanted)
}

#[tokio::test]
async fn test_reducers_dispatch_at_threshold_and_wait_for_stragglers() {
    let inner = memory_storage().await;
    put_rows(
        inner.as_ref(),
        "input",
        &[("3", "c"), ("1", "a"), ("2", "b"), ("4", "d")],
    )
    .await;
    // Map 1 reads from offset 4 and lags behind.
    let storage: Arc<dyn Storage> = Arc::new(FaultyStorage::new(
        inner,
        Fault::ReadAt {
            offset: 4,
            delay: Duration::from_millis(150),
            fail: false,
        },
    ));

    let config = tiny_config("input", 2, 2, &["2"]).with_map_completion_threshold(0.5);
    let reporter = CollectingReporter::new();
    let summary = driver(storage.clone(), config)
        .with_reporter(Arc::new(reporter.clone()))
        .run_job(JobId::from("job-straggler"))
        .await
        .unwrap();

    let events = reporter.events();
    let ready = position(&events, |e| {
        matches!(
            e,
            JobEvent::ReduceDispatchReady {
                completed: 1,
                required: 1
            }
        )
    })
    .unwrap();
    let dispatched = position(&events, |e| matches!(e, JobEvent::ReducesDispatched { .. })).unwrap();
    let maps_done = position(&events, |e| matches!(e, JobEvent::MapsCompleted { .. })).unwrap();
    let finalized = position(&events, |e| matches!(e, JobEvent::OutputFinalized { .. })).unwrap();
    assert!(ready < dispatched);
    assert!(dispatched < maps_done);
    assert!(maps_done < finalized);

    // Reducers started before map 1 finished, so they had to poll.
    assert!(summary.red_data.iter().all(|r| r.result.manifest_polls > 0));
    assert_eq!(summary.execution_results.rows_out, 4);
}

#[tokio::test]
async fn test_full_threshold_dispatches_reducers_after_every_map() {
    let storage = memory_storage().await;
    put_rows(
        storage.as_ref(),
        "input",
        &[("3", "c"), ("1", "a"), ("2", "b"), ("4", "d")],
    )
    .await;

    let config = tiny_config("input", 2, 2, &["2"]).with_map_completion_threshold(1.0);
    let summary = driver(storage, config)
        .run_job(JobId::from("job-full"))
        .await
        .unwrap();

    assert!(summary.red_data.iter().all(|r| r.result.manifest_polls == 0));
}

#[tokio::test]
#[traced_test]
async fn test_map_failure_after_reduce_dispatch_fails_job() {
    let inner = memory_storage().await;
    put_rows(
        inner.as_ref(),
        "input",
        &[("3", "c"), ("1", "a"), ("2", "b"), ("4", "d")],
    )
    .await;
    let storage: Arc<dyn Storage> = Arc::new(FaultyStorage::new(
        inner.clone(),
        Fault::ReadAt {
            offset: 4,
            delay: Duration::from_millis(150),
            fail: true,
        },
    ));

    let config = tiny_config("input", 2, 2, &["2"])
        .with_map_completion_threshold(0.5)
        .with_output(OutputMode::Segmented, "out");
    let reporter = CollectingReporter::new();
    let err = driver(storage, config)
        .with_reporter(Arc::new(reporter.clone()))
        .run_job(JobId::from("job-lost-map"))
        .await
        .unwrap_err();

    match err {
        SortError::MissingMapResult { map_id, ref reason } => {
            assert_eq!(map_id, 1);
            assert!(reason.contains("input lost"), "{reason}");
        }
        other => panic!("unexpected error {other:?}"),
    }

    let events = reporter.events();
    assert!(events.contains(&JobEvent::ReducesDispatched { count: 2 }));
    assert!(!events.iter().any(|e| matches!(e, JobEvent::MapsCompleted { .. })));
    assert!(!events.iter().any(|e| matches!(e, JobEvent::OutputFinalized { .. })));
    assert!(matches!(
        events.last(),
        Some(JobEvent::JobFailed { kind, .. }) if kind == "MissingMapResult"
    ));

    // The output was never assembled and its segments were discarded.
    assert_eq!(inner.head("out/sorted").await.unwrap(), None);
    assert!(inner.list("out").await.unwrap().is_empty());
    // Nothing is cleaned up or summarized on failure.
    assert!(inner.list("logs").await.unwrap().is_empty());
    assert_eq!(
        inner.list("tmp/job-lost-map/manifests").await.unwrap().len(),
        1
    );
    assert!(logs_contain("Sort job failed"));
}

#[tokio::test]
async fn test_map_failure_before_threshold_never_dispatches_reducers() {
    let inner = memory_storage().await;
    put_rows(inner.as_ref(), "input", &[("3", "c"), ("1", "a")]).await;
    let storage: Arc<dyn Storage> = Arc::new(FaultyStorage::new(
        inner,
        Fault::ReadAt {
            offset: 0,
            delay: Duration::from_millis(1),
            fail: true,
        },
    ));

    let reporter = CollectingReporter::new();
    let err = driver(storage, tiny_config("input", 1, 2, &["2"]))
        .with_reporter(Arc::new(reporter.clone()))
        .run_job(JobId::from("job-early"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "MissingMapResult");
    assert!(
        !reporter
            .events()
            .iter()
            .any(|e| matches!(e, JobEvent::ReducesDispatched { .. }))
    );
}
