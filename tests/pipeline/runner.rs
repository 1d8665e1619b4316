use std::sync::Arc;
use std::time::Duration;

use crate::support::helpers::{
    assert_each_block_once, build_service, init_tracing, test_config, wait_for_idle_pool,
    wait_for_scan_complete, ScanRecorder,
};
use anyhow::{Context, Result};
use blockrange::{signal_channel, MemoryScanStore, Runner, ScanMode, ScanSignal};
use tokio::time::{sleep, timeout};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_scan_signal_drives_the_scheduler() -> Result<()> {
    init_tracing();
    let recorder = ScanRecorder::new();
    let service = build_service(
        ScanMode::Replay,
        test_config().poll_interval(Duration::from_secs(60)).build()?,
        Arc::new(MemoryScanStore::new()),
        &recorder,
    )?;
    let signals = signal_channel();
    let mut observer = signals.subscribe();

    let mut runner = Runner::new(service.clone(), signals.clone());
    runner.start().await?;

    let ready = timeout(Duration::from_secs(5), observer.recv())
        .await
        .context("listener should announce readiness")??;
    assert_eq!(
        ready,
        ScanSignal::Ready {
            mode: ScanMode::Replay
        }
    );

    service.create_scan("signal", 0, 12).await?;
    signals.send(ScanSignal::StartScan {
        scan_key: "signal".into(),
    })?;

    wait_for_scan_complete(&service, "signal", Duration::from_secs(5)).await?;
    wait_for_idle_pool(&service, Duration::from_secs(5)).await?;
    assert_each_block_once(&recorder.blocks(), 12);
    assert_eq!(service.scheduler().scan_key().as_deref(), Some("signal"));

    runner.shutdown().await?;
    assert_eq!(service.pool().live_count(), 0);
    assert!(runner.start().await.is_err(), "a shut down runner cannot restart");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tick_loop_retries_stale_rejected_leaf() -> Result<()> {
    init_tracing();
    let recorder = ScanRecorder::failing_first(1);
    let config = test_config()
        .claim_stale_after(Duration::from_millis(150))
        .build()?;
    let service = build_service(
        ScanMode::Default,
        config,
        Arc::new(MemoryScanStore::new()),
        &recorder,
    )?;
    let signals = signal_channel();
    let mut runner = Runner::new(service.clone(), signals.clone());

    service.create_scan("retry", 0, 4).await?;
    runner.start().await?;
    signals.send(ScanSignal::StartScan {
        scan_key: "retry".into(),
    })?;

    wait_for_scan_complete(&service, "retry", Duration::from_secs(5)).await?;
    wait_for_idle_pool(&service, Duration::from_secs(5)).await?;

    assert_eq!(recorder.starts(), vec![0, 0]);
    assert_each_block_once(&recorder.blocks(), 4);
    let snapshot = service.telemetry().snapshot();
    assert_eq!(snapshot.rejected_tasks, 1);
    assert_eq!(snapshot.resolved_tasks, 1);

    runner.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_can_restart_after_stop() -> Result<()> {
    init_tracing();
    let recorder = ScanRecorder::new();
    let service = build_service(
        ScanMode::Replay,
        test_config().build()?,
        Arc::new(MemoryScanStore::new()),
        &recorder,
    )?;
    let signals = signal_channel();
    let mut runner = Runner::new(service.clone(), signals.clone());

    service.create_scan("first", 0, 8).await?;
    runner.start().await?;
    signals.send(ScanSignal::StartScan {
        scan_key: "first".into(),
    })?;
    wait_for_scan_complete(&service, "first", Duration::from_secs(5)).await?;
    wait_for_idle_pool(&service, Duration::from_secs(5)).await?;
    runner.stop().await?;
    assert!(service.pool().live_count() > 0, "stop keeps idle workers");

    service.create_scan("second", 8, 16).await?;
    runner.start().await?;
    signals.send(ScanSignal::StartScan {
        scan_key: "second".into(),
    })?;
    wait_for_scan_complete(&service, "second", Duration::from_secs(5)).await?;
    wait_for_idle_pool(&service, Duration::from_secs(5)).await?;
    runner.shutdown().await?;

    assert_each_block_once(&recorder.blocks(), 16);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_the_token_ends_run_until_ctrl_c() -> Result<()> {
    init_tracing();
    let recorder = ScanRecorder::new();
    let service = build_service(
        ScanMode::Default,
        test_config().build()?,
        Arc::new(MemoryScanStore::new()),
        &recorder,
    )?;
    let mut runner = Runner::new(service.clone(), signal_channel());

    let token = runner.cancellation_token();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    timeout(Duration::from_secs(5), runner.run_until_ctrl_c())
        .await
        .context("runner should stop once its token is cancelled")??;
    assert_eq!(service.pool().live_count(), 0);
    Ok(())
}
