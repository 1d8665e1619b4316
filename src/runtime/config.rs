use crate::range::RangePartitioner;
use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::time::Duration;

const DEFAULT_RESERVED_THREADS: usize = 1;
const DEFAULT_CLAIM_STALE_AFTER_SECS: u64 = 60;
const DEFAULT_LIFECYCLE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Runtime configuration for a block range scanning service.
///
/// All instances must be constructed via [`ScanConfig::builder`] or [`ScanConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    thread_count: usize,
    reserved_threads: usize,
    max_chunk_size: u64,
    branch_width: Option<u64>,
    claim_stale_after: Duration,
    lifecycle_timeout: Duration,
    poll_interval: Duration,
    metrics_interval: Duration,
    task_pointer: Option<String>,
    database_url: Option<String>,
}

pub struct ScanConfigParams {
    pub thread_count: usize,
    pub reserved_threads: usize,
    pub max_chunk_size: u64,
    pub branch_width: Option<u64>,
    pub claim_stale_after: Duration,
    pub lifecycle_timeout: Duration,
    pub poll_interval: Duration,
    pub metrics_interval: Duration,
    pub task_pointer: Option<String>,
    pub database_url: Option<String>,
}

impl ScanConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> ScanConfigBuilder {
        ScanConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: ScanConfigParams) -> Result<Self> {
        let ScanConfigParams {
            thread_count,
            reserved_threads,
            max_chunk_size,
            branch_width,
            claim_stale_after,
            lifecycle_timeout,
            poll_interval,
            metrics_interval,
            task_pointer,
            database_url,
        } = params;

        let config = Self {
            thread_count,
            reserved_threads,
            max_chunk_size,
            branch_width,
            claim_stale_after,
            lifecycle_timeout,
            poll_interval,
            metrics_interval,
            task_pointer: task_pointer.map(trimmed_string),
            database_url: database_url.map(trimmed_string),
        };

        config.validate()?;
        Ok(config)
    }

    /// Upper bound on worker threads requested by the operator.
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Host threads kept free for the scheduler and store I/O.
    pub fn reserved_threads(&self) -> usize {
        self.reserved_threads
    }

    /// Widest leaf the partitioner produces.
    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }

    pub fn branch_width(&self) -> Option<u64> {
        self.branch_width
    }

    /// Age after which an unfinished claim may be taken over by another worker.
    pub fn claim_stale_after(&self) -> Duration {
        self.claim_stale_after
    }

    /// Bound on each setup/load/dispose round trip with a worker thread.
    pub fn lifecycle_timeout(&self) -> Duration {
        self.lifecycle_timeout
    }

    /// Interval between periodic scheduler wakeups in the runner.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Default task every worker loads when no pointer is requested.
    pub fn task_pointer(&self) -> Option<&str> {
        self.task_pointer.as_deref()
    }

    pub fn database_url(&self) -> Option<&str> {
        self.database_url.as_deref()
    }

    /// Builds the partitioner described by `max_chunk_size` and `branch_width`.
    pub fn partitioner(&self) -> Result<RangePartitioner> {
        let partitioner = RangePartitioner::new(self.max_chunk_size)?;
        match self.branch_width {
            Some(width) => Ok(partitioner.with_branch_width(width)?),
            None => Ok(partitioner),
        }
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            bail!("thread_count must be greater than 0");
        }

        if self.max_chunk_size == 0 {
            bail!("max_chunk_size must be greater than 0");
        }

        if let Some(width) = self.branch_width {
            if width < self.max_chunk_size {
                bail!(
                    "branch_width ({width}) must be at least max_chunk_size ({})",
                    self.max_chunk_size
                );
            }
        }

        if self.claim_stale_after.is_zero() {
            bail!("claim_stale_after must be greater than 0");
        }

        if self.lifecycle_timeout.is_zero() {
            bail!("lifecycle_timeout must be greater than 0");
        }

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if let Some(pointer) = &self.task_pointer {
            ensure_not_empty(pointer, "task_pointer")?;
        }

        if let Some(url) = &self.database_url {
            validate_database_url(url)?;
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct ScanConfigBuilder {
    thread_count: Option<usize>,
    reserved_threads: Option<usize>,
    max_chunk_size: Option<u64>,
    branch_width: Option<u64>,
    claim_stale_after: Option<Duration>,
    lifecycle_timeout: Option<Duration>,
    poll_interval: Option<Duration>,
    metrics_interval: Option<Duration>,
    task_pointer: Option<String>,
    database_url: Option<String>,
}

impl ScanConfigBuilder {
    pub fn thread_count(mut self, count: usize) -> Self {
        self.thread_count = Some(count);
        self
    }

    pub fn reserved_threads(mut self, count: usize) -> Self {
        self.reserved_threads = Some(count);
        self
    }

    pub fn max_chunk_size(mut self, blocks: u64) -> Self {
        self.max_chunk_size = Some(blocks);
        self
    }

    pub fn branch_width(mut self, blocks: u64) -> Self {
        self.branch_width = Some(blocks);
        self
    }

    pub fn claim_stale_after(mut self, window: Duration) -> Self {
        self.claim_stale_after = Some(window);
        self
    }

    pub fn lifecycle_timeout(mut self, timeout: Duration) -> Self {
        self.lifecycle_timeout = Some(timeout);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn task_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.task_pointer = Some(pointer.into());
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn build(self) -> Result<ScanConfig> {
        let params = ScanConfigParams {
            thread_count: self.thread_count.context("thread_count is required")?,
            reserved_threads: self.reserved_threads.unwrap_or(DEFAULT_RESERVED_THREADS),
            max_chunk_size: self.max_chunk_size.context("max_chunk_size is required")?,
            branch_width: self.branch_width,
            claim_stale_after: self
                .claim_stale_after
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_CLAIM_STALE_AFTER_SECS)),
            lifecycle_timeout: self
                .lifecycle_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_LIFECYCLE_TIMEOUT_SECS)),
            poll_interval: self
                .poll_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            task_pointer: self.task_pointer,
            database_url: self.database_url,
        };

        ScanConfig::new(params)
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn validate_database_url(url: &str) -> Result<()> {
    if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
        bail!("database_url must start with postgres:// or postgresql://");
    }
    Ok(())
}
