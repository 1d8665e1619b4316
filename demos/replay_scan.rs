use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use blockrange::{
    block_range_service, open_store, signal_channel, ProgressSender, Runner, ScanConfig,
    ScanMode, ScanProgress, ScanSignal, ScanTaskPayload, TaskRegistry, WorkerTask,
};
use futures::future::LocalBoxFuture;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde_json::{json, Value};
use tokio::time::sleep;

const DEFAULT_SCAN_KEY: &str = "demo";
const DEFAULT_START_BLOCK: u64 = 0;
const DEFAULT_END_BLOCK: u64 = 2_000;
const DEFAULT_THREAD_COUNT: usize = 4;
const DEFAULT_CHUNK_SIZE: u64 = 100;
const DEFAULT_BLOCK_DELAY_MS: u64 = 2;
const DEFAULT_LOG_DIRECTIVE: &str = "warn";
const SIMULATED_TASK: &str = "simulated";

#[tokio::main]
async fn main() -> Result<()> {
    init_demo_tracing();

    let args = DemoArgs::from_env()?;
    let bar = build_progress_bar(args.end_block - args.start_block);
    bar.println(format!(
        "Scanning {} blocks [{}, {}) for key {} in {} mode with up to {} workers",
        args.end_block - args.start_block,
        args.start_block,
        args.end_block,
        args.scan_key,
        args.mode,
        args.thread_count
    ));

    let config = args.to_scan_config()?;
    let store = open_store(&config).await?;
    let tasks = simulated_tasks(bar.clone(), Duration::from_millis(args.block_delay_ms));
    let service = Arc::new(block_range_service(args.mode, config, store, tasks)?);

    if service.scanner().has_scan_key(&args.scan_key, None).await {
        bar.println(format!("Resuming existing scan tree for {}", args.scan_key));
    } else {
        service
            .create_scan(&args.scan_key, args.start_block, args.end_block)
            .await?;
    }

    let signals = signal_channel();
    let mut runner = Runner::new(service.clone(), signals.clone());
    runner.start().await?;
    signals
        .send(ScanSignal::StartScan {
            scan_key: args.scan_key.clone(),
        })
        .context("signal listener is not running")?;

    let started_at = Instant::now();
    let watcher = {
        let service = service.clone();
        let scan_key = args.scan_key.clone();
        let token = runner.cancellation_token();
        tokio::spawn(async move {
            while service.scanner().has_unscanned_blocks(&scan_key, None).await {
                sleep(Duration::from_millis(100)).await;
            }
            token.cancel();
        })
    };

    let run_result = runner.run_until_ctrl_c().await;
    watcher.abort();

    let complete = !service
        .scanner()
        .has_unscanned_blocks(&args.scan_key, None)
        .await;
    bar.finish_with_message(if complete { "scan complete" } else { "stopped by Ctrl-C" });
    print_summary(&bar, &service.telemetry().snapshot(), started_at.elapsed());
    run_result
}

fn init_demo_tracing() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", DEFAULT_LOG_DIRECTIVE);
    }
    blockrange::init_tracing();
}

fn build_progress_bar(blocks: u64) -> ProgressBar {
    let bar = ProgressBar::with_draw_target(Some(blocks.max(1)), ProgressDrawTarget::stdout_with_hz(12));
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} blocks ({per_sec:.2} blk/s) ETA {eta_precise}",
    ) {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn print_summary(bar: &ProgressBar, snapshot: &blockrange::TelemetrySnapshot, elapsed: Duration) {
    bar.println(format!(
        "Claimed {} leaves, resolved {}, rejected {}, {} progress updates, {} store errors in {:.2}s",
        snapshot.claimed_nodes,
        snapshot.resolved_tasks,
        snapshot.rejected_tasks,
        snapshot.progress_updates,
        snapshot.store_errors,
        elapsed.as_secs_f64()
    ));
}

fn simulated_tasks(bar: ProgressBar, block_delay: Duration) -> TaskRegistry {
    TaskRegistry::new().with_task(SIMULATED_TASK, move |_| {
        Ok(Box::new(SimulatedScan {
            bar: bar.clone(),
            block_delay,
        }) as Box<dyn WorkerTask>)
    })
}

/// Pretends to decode each block, sleeping `block_delay` per block.
struct SimulatedScan {
    bar: ProgressBar,
    block_delay: Duration,
}

impl WorkerTask for SimulatedScan {
    fn run(&mut self, payload: Value, progress: ProgressSender) -> LocalBoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let payload = ScanTaskPayload::from_value(payload)?;
            for block in payload.blocks() {
                sleep(self.block_delay).await;
                progress.report(&ScanProgress {
                    block_number: block,
                })?;
                self.bar.inc(1);
            }
            Ok(json!({ "scanned": payload.end_block - payload.start_block }))
        })
    }
}

struct DemoArgs {
    scan_key: String,
    mode: ScanMode,
    start_block: u64,
    end_block: u64,
    thread_count: usize,
    chunk_size: u64,
    block_delay_ms: u64,
    database_url: Option<String>,
}

impl DemoArgs {
    fn from_env() -> Result<Self> {
        let scan_key = read_env_or_default("BLOCKRANGE_SCAN_KEY", DEFAULT_SCAN_KEY);
        let mode = match read_env_or_default("BLOCKRANGE_MODE", "replay").as_str() {
            "default" => ScanMode::Default,
            _ => ScanMode::Replay,
        };
        let start_block =
            parse_env_with_default::<u64>("BLOCKRANGE_START_BLOCK", DEFAULT_START_BLOCK)?;
        let end_block = parse_env_with_default::<u64>("BLOCKRANGE_END_BLOCK", DEFAULT_END_BLOCK)?;
        let thread_count =
            parse_env_with_default::<usize>("BLOCKRANGE_THREAD_COUNT", DEFAULT_THREAD_COUNT)?;
        let chunk_size = parse_env_with_default::<u64>("BLOCKRANGE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        let block_delay_ms =
            parse_env_with_default::<u64>("BLOCKRANGE_BLOCK_DELAY_MS", DEFAULT_BLOCK_DELAY_MS)?;
        let database_url = env::var("BLOCKRANGE_DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        ensure!(
            end_block > start_block,
            "BLOCKRANGE_END_BLOCK must be greater than BLOCKRANGE_START_BLOCK"
        );

        Ok(Self {
            scan_key,
            mode,
            start_block,
            end_block,
            thread_count,
            chunk_size,
            block_delay_ms,
            database_url,
        })
    }

    fn to_scan_config(&self) -> Result<ScanConfig> {
        let mut builder = ScanConfig::builder()
            .thread_count(self.thread_count)
            .max_chunk_size(self.chunk_size)
            .task_pointer(SIMULATED_TASK)
            .poll_interval(Duration::from_secs(1));
        if let Some(url) = &self.database_url {
            builder = builder.database_url(url.clone());
        }
        builder.build()
    }
}

fn read_env_or_default(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn parse_env_with_default<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("failed to parse {key}='{value}'")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("failed to read {key}")),
    }
}
