use crate::processor::service::BlockRangeService;
use crate::runtime::signals::{spawn_signal_listener, ScanSignal};
use crate::runtime::telemetry;
use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Drives a [`BlockRangeService`] from periodic ticks and scan signals, and
/// handles OS signals for graceful shutdowns.
pub struct Runner {
    service: Arc<BlockRangeService>,
    signals: broadcast::Sender<ScanSignal>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    started: bool,
    closed: bool,
}

impl Runner {
    pub fn new(service: Arc<BlockRangeService>, signals: broadcast::Sender<ScanSignal>) -> Self {
        Self {
            service,
            signals,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
            started: false,
            closed: false,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn service(&self) -> &Arc<BlockRangeService> {
        &self.service
    }

    /// Starts the tick loop, the signal listener and the metrics reporter.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        if self.closed {
            bail!("runner was shut down; its worker pool is closed");
        }

        let config = self.service.config();
        self.handles.push(spawn_tick_loop(
            self.service.clone(),
            config.poll_interval(),
            self.shutdown.clone(),
        ));
        self.handles.push(spawn_signal_listener(
            self.service.clone(),
            self.signals.clone(),
            self.shutdown.clone(),
        ));
        self.handles.push(telemetry::spawn_metrics_reporter(
            self.service.telemetry().clone(),
            self.shutdown.clone(),
            config.metrics_interval(),
        ));

        tracing::info!(mode = %self.service.mode(), "runner started");
        self.started = true;
        Ok(())
    }

    /// Cancels the background loops and waits for them. Workers stay alive, so
    /// the runner can be started again.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        self.shutdown.cancel();
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "runner task ended abnormally");
            }
        }
        self.started = false;
        self.shutdown = CancellationToken::new();
        tracing::info!(mode = %self.service.mode(), "runner stopped");
        Ok(())
    }

    /// Stops the runner and shuts the worker pool down for good.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stop().await?;
        if !self.closed {
            self.service.shutdown().await;
            self.closed = true;
        }
        Ok(())
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.shutdown().await
    }
}

fn spawn_tick_loop(
    service: Arc<BlockRangeService>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => service.next(None).await,
            }
        }

        tracing::info!("scan tick loop stopped");
    })
}
