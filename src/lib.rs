pub mod pool;
pub mod processor;
pub mod range;
pub mod runtime;
pub mod scanner;
pub mod store;

pub use pool::{
    ProgressSender, TaskEvent, TaskRegistry, WorkerPool, WorkerPoolError, WorkerPoolOptions,
    WorkerTask,
};
pub use processor::inflight::InFlightRegistry;
pub use processor::scheduler::{
    RejectedScan, ReplayScheduler, ScanMode, ScanProgress, ScanTaskPayload,
};
pub use processor::service::{block_range_service, open_store, BlockRangeService};
pub use range::{NodeHash, RangeNode, RangePartitioner};
pub use runtime::config::{ScanConfig, ScanConfigBuilder, ScanConfigParams};
pub use runtime::runner::Runner;
pub use runtime::signals::{signal_channel, spawn_signal_listener, ScanSignal};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use scanner::BlockRangeScanner;
pub use store::{MemoryScanStore, ScanError, ScanFilter, ScanRepository, ScanStore};
#[cfg(feature = "postgres")]
pub use store::PostgresScanStore;
