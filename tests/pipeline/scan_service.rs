use std::sync::Arc;
use std::time::Duration;

use crate::support::helpers::{
    assert_each_block_once, build_service, init_tracing, test_config, wait_for_idle_pool,
    wait_for_scan_complete, ScanRecorder,
};
use anyhow::{Context, Result};
use blockrange::{MemoryScanStore, ScanError, ScanMode, ScanStore};
use tokio::time::{sleep, timeout};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_to_end_scan_covers_every_block() -> Result<()> {
    init_tracing();
    let recorder = ScanRecorder::new();
    let service = build_service(
        ScanMode::Replay,
        test_config().build()?,
        Arc::new(MemoryScanStore::new()),
        &recorder,
    )?;

    service.create_scan("replay-0", 0, 10).await?;
    service.next(Some("replay-0")).await;

    wait_for_scan_complete(&service, "replay-0", Duration::from_secs(5)).await?;
    wait_for_idle_pool(&service, Duration::from_secs(5)).await?;

    assert_each_block_once(&recorder.blocks(), 10);
    assert_eq!(recorder.starts(), vec![0, 4, 8]);
    let snapshot = service.telemetry().snapshot();
    assert_eq!(snapshot.resolved_tasks, 3);
    assert_eq!(snapshot.rejected_tasks, 0);
    assert_eq!(snapshot.store_errors, 0);
    assert_eq!(service.scanner().get_next_scan_node("replay-0").await, None);

    service.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reclaimed_leaf_resumes_after_recorded_progress() -> Result<()> {
    init_tracing();
    let recorder = ScanRecorder::new();
    let config = test_config()
        .max_chunk_size(8)
        .claim_stale_after(Duration::from_millis(100))
        .build()?;
    let service = build_service(
        ScanMode::Default,
        config,
        Arc::new(MemoryScanStore::new()),
        &recorder,
    )?;

    service.create_scan("resume", 0, 8).await?;
    let abandoned = service
        .scanner()
        .get_next_scan_node("resume")
        .await
        .context("leaf should be claimable")?;
    assert_eq!(abandoned.resume_from(), 0);
    service.scanner().update_scan_progress("resume", 4).await;

    service.next(Some("resume")).await;
    sleep(Duration::from_millis(50)).await;
    assert!(recorder.starts().is_empty(), "fresh claim must not be taken over");

    sleep(Duration::from_millis(150)).await;
    service.next(None).await;
    wait_for_scan_complete(&service, "resume", Duration::from_secs(5)).await?;
    wait_for_idle_pool(&service, Duration::from_secs(5)).await?;

    assert_eq!(recorder.starts(), vec![5]);
    assert_eq!(recorder.blocks(), vec![5, 6, 7]);
    service.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn services_sharing_a_store_never_scan_a_block_twice() -> Result<()> {
    init_tracing();
    let recorder = ScanRecorder::new();
    let store: Arc<dyn ScanStore> = Arc::new(MemoryScanStore::new());
    let first = build_service(ScanMode::Default, test_config().build()?, store.clone(), &recorder)?;
    let second = build_service(ScanMode::Replay, test_config().build()?, store, &recorder)?;

    first.create_scan("shared", 0, 40).await?;
    let err = second
        .create_scan("shared", 100, 200)
        .await
        .expect_err("the key already has a tree");
    assert!(matches!(err, ScanError::DuplicateScan { .. }));

    tokio::join!(first.next(Some("shared")), second.next(Some("shared")));

    wait_for_scan_complete(&first, "shared", Duration::from_secs(10)).await?;
    wait_for_idle_pool(&first, Duration::from_secs(5)).await?;
    wait_for_idle_pool(&second, Duration::from_secs(5)).await?;

    assert_each_block_once(&recorder.blocks(), 40);
    let resolved = first.telemetry().snapshot().resolved_tasks
        + second.telemetry().snapshot().resolved_tasks;
    assert_eq!(resolved, 10);

    first.shutdown().await;
    second.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_leaf_stays_claimed_until_stale() -> Result<()> {
    init_tracing();
    let recorder = ScanRecorder::failing_first(1);
    let service = build_service(
        ScanMode::Replay,
        test_config().build()?,
        Arc::new(MemoryScanStore::new()),
        &recorder,
    )?;
    let mut rejections = service.rejections();

    service.create_scan("flaky", 0, 4).await?;
    service.next(Some("flaky")).await;

    let rejected = timeout(Duration::from_secs(5), rejections.recv())
        .await
        .context("rejection should be reported")?
        .context("rejection sink closed")?;
    assert_eq!(rejected.node.start(), 0);
    assert_eq!(rejected.mode, ScanMode::Replay);
    assert!(rejected.error.contains("transient failure"));

    wait_for_idle_pool(&service, Duration::from_secs(5)).await?;
    service.next(None).await;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(recorder.starts(), vec![0]);
    assert!(recorder.blocks().is_empty());
    assert!(service.scanner().has_unscanned_blocks("flaky", None).await);
    assert_eq!(service.telemetry().snapshot().rejected_tasks, 1);

    service.shutdown().await;
    Ok(())
}
