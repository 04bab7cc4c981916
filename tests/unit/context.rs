//! Unit tests for per-cluster failure tracking

use std::sync::Arc;
use std::time::Duration;

use postgres_ha_operator::controller::{Context, Error};
use postgres_ha_operator::reconcile;

use crate::common::*;

fn context() -> Context {
    Context::with_store(
        Arc::new(FakeStore::new()),
        Arc::new(RecordingEventSink::new()),
        None,
    )
}

fn transient() -> Error {
    Error::TransientError("api unavailable".to_string())
}

#[tokio::test(start_paused = true)]
async fn test_failures_accumulate_per_cluster() {
    let ctx = context();
    ctx.record_failure("default/a", &transient());
    ctx.record_failure("default/a", &transient());
    ctx.record_failure("default/b", &transient());

    assert_eq!(ctx.consecutive_failures("default/a"), 2);
    assert_eq!(ctx.consecutive_failures("default/b"), 1);
    assert_eq!(ctx.tracked_clusters(), 2);

    ctx.forget("default/a");
    assert_eq!(ctx.consecutive_failures("default/a"), 0);
    assert_eq!(ctx.tracked_clusters(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_clusters_that_stopped_failing_are_dropped() {
    let ctx = context();
    let window = ctx.backoff.max_delay * 2;
    ctx.record_failure("default/gone", &transient());

    tokio::time::advance(window + Duration::from_secs(1)).await;
    ctx.record_failure("default/other", &transient());

    assert_eq!(ctx.consecutive_failures("default/gone"), 0);
    assert_eq!(ctx.tracked_clusters(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cluster_still_failing_is_kept() {
    let ctx = context();
    ctx.record_failure("default/flaky", &transient());

    tokio::time::advance(ctx.backoff.max_delay).await;
    ctx.record_failure("default/other", &transient());

    assert_eq!(ctx.consecutive_failures("default/flaky"), 1);
    assert_eq!(ctx.tracked_clusters(), 2);
}

#[tokio::test]
async fn test_deleted_cluster_is_forgotten() {
    let ctx = Arc::new(context());
    let mut cluster = create_test_cluster("db", "default", 1);
    ctx.record_failure("default/db", &transient());

    cluster.metadata.deletion_timestamp =
        Some(serde_json::from_value(serde_json::json!("2026-03-01T12:00:00Z")).unwrap());
    reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();

    assert_eq!(ctx.consecutive_failures("default/db"), 0);
    assert_eq!(ctx.tracked_clusters(), 0);
}
