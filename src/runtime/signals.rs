//! Broadcast boundary through which other components wake the scheduler.

use crate::processor::scheduler::ScanMode;
use crate::processor::service::BlockRangeService;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const SIGNAL_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanSignal {
    /// Switch the scheduler to `scan_key` and dispatch.
    StartScan { scan_key: String },
    /// Re-check capacity and unscanned blocks for the current key.
    Refresh,
    /// Published once by a listener after it subscribed.
    Ready { mode: ScanMode },
}

pub fn signal_channel() -> broadcast::Sender<ScanSignal> {
    broadcast::channel(SIGNAL_CHANNEL_CAPACITY).0
}

/// Subscribes to `signals`, announces readiness, and turns every wake-up
/// signal into a scheduler pass until `shutdown` is cancelled or the channel
/// closes.
pub fn spawn_signal_listener(
    service: Arc<BlockRangeService>,
    signals: broadcast::Sender<ScanSignal>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut receiver = signals.subscribe();
    let mode = service.mode();
    if signals.send(ScanSignal::Ready { mode }).is_err() {
        tracing::debug!(%mode, "no subscribers for ready signal");
    }

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = receiver.recv() => received,
            };

            match received {
                Ok(ScanSignal::StartScan { scan_key }) => {
                    tracing::debug!(scan_key = %scan_key, %mode, "start scan signal received");
                    service.next(Some(&scan_key)).await;
                }
                Ok(ScanSignal::Refresh) => service.next(None).await,
                Ok(ScanSignal::Ready { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, %mode, "scan signal listener lagged; refreshing");
                    service.next(None).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        tracing::info!(%mode, "scan signal listener stopped");
    })
}
