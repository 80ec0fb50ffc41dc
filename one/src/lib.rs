//! Replica One runs the blob replication engine as a single binary.
#![warn(missing_docs)]

mod simulate;

use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use replica_metrics::{config::Config as MetricsConfig, MetricsHandle};
use replica_replication::Config;
use signal_hook_tokio::Signals;
use tokio::sync::oneshot;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replicate blobs from a swarm of simulated peers
    Simulate(SimulateOpts),
}

#[derive(Args, Debug)]
struct ReplicationOpts {
    /// Maximum number of simultaneous downloads.
    #[arg(long, default_value_t = 5, env = "REPLICA_ONE_DOWNLOAD_CONCURRENCY")]
    download_concurrency: usize,

    /// Base delay in milliseconds before the download job retries, jittered by +-50%.
    #[arg(long, default_value_t = 300, env = "REPLICA_ONE_DOWNLOAD_DELAY_MS")]
    download_delay_ms: u64,

    /// Links from messages further than this many days from now are ignored.
    #[arg(long, default_value_t = 30, env = "REPLICA_ONE_MAX_LINK_AGE_DAYS")]
    max_link_age_days: u64,

    /// Upper bound of the per blob count of negative answers.
    #[arg(
        long,
        default_value_t = replica_replication::MAX_NOTFOUNDS,
        env = "REPLICA_ONE_MAX_NOTFOUNDS"
    )]
    max_notfounds: u8,

    /// Capacity of the peer event bus.
    #[arg(long, default_value_t = 1024, env = "REPLICA_ONE_EVENT_BUFFER")]
    event_buffer: usize,
}

impl ReplicationOpts {
    fn config(&self) -> Config {
        Config {
            download_concurrency: self.download_concurrency,
            download_delay: Duration::from_millis(self.download_delay_ms),
            max_link_age: Duration::from_secs(self.max_link_age_days * 24 * 60 * 60),
            max_notfounds: self.max_notfounds,
            event_buffer: self.event_buffer,
        }
    }
}

#[derive(Args, Debug)]
struct SimulateOpts {
    #[command(flatten)]
    replication: ReplicationOpts,

    #[command(flatten)]
    log_opts: LogOpts,

    /// Number of simulated peers.
    #[arg(long, default_value_t = 8, env = "REPLICA_ONE_PEERS")]
    peers: usize,

    /// Number of blobs linked from the feed and held by some peers.
    #[arg(long, default_value_t = 100, env = "REPLICA_ONE_BLOBS")]
    blobs: usize,

    /// Size of each blob in bytes.
    #[arg(long, default_value_t = 4096, env = "REPLICA_ONE_BLOB_SIZE")]
    blob_size: usize,

    /// Number of peers holding each blob.
    #[arg(long, default_value_t = 2, env = "REPLICA_ONE_REPLICAS")]
    replicas: usize,

    /// Number of blobs linked before any peer has them, acquired by a peer once it is connected.
    #[arg(long, default_value_t = 5, env = "REPLICA_ONE_LATE_BLOBS")]
    late_blobs: usize,

    /// Percentage of links published by messages too old to be followed.
    #[arg(long, default_value_t = 10, env = "REPLICA_ONE_STALE_PERCENT")]
    stale_percent: u32,

    /// Number of peers whose transfers always fail.
    #[arg(long, default_value_t = 1, env = "REPLICA_ONE_FLAKY_PEERS")]
    flaky_peers: usize,

    /// Delay in milliseconds between peer connections.
    #[arg(long, default_value_t = 20, env = "REPLICA_ONE_CONNECT_INTERVAL_MS")]
    connect_interval_ms: u64,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 30, env = "REPLICA_ONE_TIMEOUT_SECS")]
    timeout_secs: u64,

    /// Seed of the simulation, random when not set.
    #[arg(long, env = "REPLICA_ONE_SEED")]
    seed: Option<u64>,

    /// Print the metrics in the prometheus text format when done.
    #[arg(long, default_value_t = false, env = "REPLICA_ONE_PRINT_METRICS")]
    print_metrics: bool,
}

#[derive(Args, Debug)]
struct LogOpts {
    /// Specify the format of log events.
    #[arg(long, default_value = "multi-line", env = "REPLICA_ONE_LOG_FORMAT")]
    log_format: LogFormat,
}

impl LogOpts {
    fn format(&self) -> replica_metrics::config::LogFormat {
        match self.log_format {
            LogFormat::SingleLine => replica_metrics::config::LogFormat::SingleLine,
            LogFormat::MultiLine => replica_metrics::config::LogFormat::MultiLine,
            LogFormat::Json => replica_metrics::config::LogFormat::Json,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Default)]
enum LogFormat {
    /// Format log events on multiple lines using ANSI colors.
    #[default]
    MultiLine,
    /// Format log events on a single line using ANSI colors.
    SingleLine,
    /// Format log events newline delimited JSON objects.
    /// No ANSI colors are used.
    Json,
}

/// Run the command given on the command line.
pub async fn run() -> Result<()> {
    let args = Cli::parse();
    match args.command {
        Command::Simulate(opts) => {
            let info = Info::new();
            let metrics_config = info
                .apply_to_metrics_config(MetricsConfig::default())
                .with_log_format(opts.log_opts.format());
            // The handle only describes the process, keeping it alive is not required.
            MetricsHandle::new(metrics_config).map_err(|err| anyhow!(err.to_string()))?;
            simulate::run(opts).await
        }
    }
}

/// Static information about the current process.
#[derive(Debug, Clone)]
pub struct Info {
    /// Name of the service.
    pub service_name: String,
    /// Semantic version of the build.
    pub version: String,
    /// Description of git commit.
    pub build: String,
    /// Unique name generated for this invocation of the process.
    pub instance_id: String,
}

impl Info {
    fn new() -> Self {
        Self {
            service_name: env!("CARGO_PKG_NAME").to_string(),
            build: git_version::git_version!(
                prefix = "git:",
                cargo_prefix = "cargo:",
                fallback = "unknown"
            )
            .to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: names::Generator::default()
                .next()
                .unwrap_or_else(|| "unnamed".to_string()),
        }
    }

    fn apply_to_metrics_config(&self, cfg: MetricsConfig) -> MetricsConfig {
        MetricsConfig {
            instance_id: self.instance_id.clone(),
            ..cfg
        }
        .with_service_name(self.service_name.clone())
        .with_build(self.build.clone())
        .with_version(self.version.clone())
    }
}

async fn handle_signals(mut signals: Signals, shutdown: oneshot::Sender<()>) {
    let mut shutdown = Some(shutdown);
    while let Some(signal) = signals.next().await {
        debug!(?signal, "signal received");
        if let Some(shutdown) = shutdown.take() {
            info!("sending shutdown message");
            if shutdown.send(()).is_err() {
                debug!("nothing left to shut down");
            }
        }
    }
}
