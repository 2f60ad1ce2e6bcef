use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slidegate::config::SlidegateConfig;
use slidegate::driver::{self, OutputFormat, SimulationOptions};
use slidegate::ratelimit::{Clock, OutOfOrderPolicy, RateLimiter, UnixClock};
use slidegate::sweeper::Sweeper;

/// Sliding window log rate limiter harness.
#[derive(Debug, Parser)]
#[command(name = "slidegate", version, about)]
struct Cli {
    /// Configuration file (YAML); SLIDEGATE__* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a recorded trace of `<timestamp> <key>` lines
    Replay(ReplayArgs),
    /// Drive the limiter with synthetic concurrent load
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
struct LimitOverrides {
    /// Window length in clock units
    #[arg(long)]
    window: Option<u64>,

    /// Accepted requests per key per window
    #[arg(long)]
    max_requests: Option<usize>,

    /// Handling of timestamps that go backwards for a key
    #[arg(long, value_enum)]
    out_of_order: Option<PolicyArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Reject,
    Insert,
}

impl From<PolicyArg> for OutOfOrderPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Reject => OutOfOrderPolicy::Reject,
            PolicyArg::Insert => OutOfOrderPolicy::Insert,
        }
    }
}

#[derive(Debug, Args)]
struct ReplayArgs {
    /// Trace file to read; defaults to stdin
    #[arg(long)]
    input: Option<PathBuf>,

    /// Emit one JSON object per event
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    limits: LimitOverrides,
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Number of distinct keys
    #[arg(long, default_value_t = 16)]
    keys: usize,

    /// Number of concurrent workers
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Seconds to run before stopping
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Milliseconds between requests from one worker
    #[arg(long, default_value_t = 5)]
    pace_ms: u64,

    #[command(flatten)]
    limits: LimitOverrides,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = SlidegateConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Replay(args) => run_replay(config, args),
        Command::Simulate(args) => run_simulate(config, args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Build the limiter from configuration, applying command-line overrides.
fn build_limiter(
    mut config: SlidegateConfig,
    overrides: &LimitOverrides,
) -> anyhow::Result<(SlidegateConfig, RateLimiter<String>)> {
    if let Some(window) = overrides.window {
        config.limiter.window = window;
    }
    if let Some(max_requests) = overrides.max_requests {
        config.limiter.max_requests = max_requests;
    }
    if let Some(policy) = overrides.out_of_order {
        config.limiter.out_of_order = policy.into();
    }

    let limiter = RateLimiter::new(config.limiter.to_limit_config()?);
    let limit = limiter.config();
    info!(
        window = limit.window(),
        max_requests = limit.max_requests(),
        out_of_order = ?limit.out_of_order(),
        "Rate limiter initialized"
    );
    Ok((config, limiter))
}

fn run_replay(config: SlidegateConfig, args: ReplayArgs) -> anyhow::Result<()> {
    let (_, limiter) = build_limiter(config, &args.limits)?;

    let input: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(io::stdin().lock()),
    };
    let format = if args.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let summary = driver::replay(&limiter, input, io::stdout().lock(), format)?;
    info!(
        accepted = summary.accepted,
        rejected = summary.rejected,
        out_of_order = summary.out_of_order,
        pruned_keys = summary.pruned_keys,
        "Replay complete"
    );
    Ok(())
}

async fn run_simulate(config: SlidegateConfig, args: SimulateArgs) -> anyhow::Result<()> {
    let (config, limiter) = build_limiter(config, &args.limits)?;
    let limiter = Arc::new(limiter);
    let unix_clock = UnixClock::new(config.clock);
    info!(unit = ?unix_clock.unit(), "Using wall clock");
    let clock: Arc<dyn Clock> = Arc::new(unix_clock);

    let sweeper = if config.sweeper.enabled {
        Some(Sweeper::spawn(
            Arc::clone(&limiter),
            Arc::clone(&clock),
            config.sweeper.interval(),
        )?)
    } else {
        None
    };

    let options = SimulationOptions {
        keys: args.keys,
        workers: args.workers,
        duration: Duration::from_secs(args.duration_secs),
        pace: Duration::from_millis(args.pace_ms),
    };
    let stats = driver::simulate(limiter, clock, options, shutdown_signal()).await;

    if let Some(sweeper) = sweeper {
        if let Some(report) = sweeper.last_report() {
            info!(sweeps = sweeper.sweep_count(), last_removed = report.removed, "Sweeper summary");
        }
        sweeper.shutdown().await;
    }

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
