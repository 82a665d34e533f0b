//! burner CLI
//!
//! Creates load on a cluster control plane, measures it, scrapes
//! time-series endpoints, evaluates alert profiles and indexes results.
//! The process exit code reflects the run outcome.

mod commands;
mod config;
mod output;

use burner_lib::config::parse_duration;
use burner_lib::models::AlertSeverity;
use burner_lib::Outcome;
use clap::{Args, Parser, Subcommand, ValueEnum};
use commands::{cluster, init, measure, metrics};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Cluster control-plane benchmark engine
#[derive(Parser)]
#[command(name = "burner")]
#[command(author, version, about = "Cluster control-plane benchmark engine", long_about = None)]
pub struct Cli {
    /// Path to kubeconfig file (uses default lookup if not specified)
    #[arg(long, global = true, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true)]
    pub kube_context: Option<String>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Log format
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a benchmark spec end to end
    Init(InitArgs),

    /// Collect measurements over objects created outside burner
    Measure(MeasureArgs),

    /// Delete every resource labelled with a run id
    Destroy {
        /// Run id to clean up
        #[arg(long)]
        uuid: String,

        /// Give up after this long
        #[arg(long, default_value = "4h", value_parser = parse_duration)]
        timeout: Duration,
    },

    /// Check that every node reports Ready
    HealthCheck,

    /// Scrape a time window and index the samples
    Index(IndexArgs),

    /// Evaluate alert profiles over a time window
    CheckAlerts(CheckAlertsArgs),

    /// Replay an archive into an indexer
    Import(ImportArgs),
}

#[derive(Args)]
pub struct InitArgs {
    /// Benchmark spec file
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Run id; generated when omitted
    #[arg(long)]
    pub uuid: Option<String>,

    /// Overall run deadline, overrides global.timeout
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// YAML list of metrics endpoints replacing those of the benchmark spec
    #[arg(long)]
    pub metrics_endpoint: Option<PathBuf>,

    /// Prometheus URL used with --metrics-profile/--alert-profile
    #[arg(long, short = 'u')]
    pub prometheus_url: Option<String>,

    /// Bearer token for --prometheus-url
    #[arg(long, env = "BURNER_PROMETHEUS_TOKEN")]
    pub token: Option<String>,

    /// Metric profile files for a single endpoint
    #[arg(long, short = 'm', value_delimiter = ',')]
    pub metrics_profile: Vec<PathBuf>,

    /// Alert profile files for a single endpoint
    #[arg(long, short = 'a', value_delimiter = ',')]
    pub alert_profile: Vec<PathBuf>,

    /// Skip TLS verification of metrics endpoints
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub skip_tls_verify: bool,

    /// YAML map merged into every job summary
    #[arg(long)]
    pub user_metadata: Option<PathBuf>,

    /// Run against an in-memory cluster
    #[arg(long)]
    pub dry_run: bool,

    /// Write self-metrics in Prometheus text format here on exit
    #[arg(long)]
    pub metrics_dump: Option<PathBuf>,
}

#[derive(Args)]
pub struct MeasureArgs {
    /// Spec providing measurements and indexer; must not contain jobs
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Run id; generated when omitted
    #[arg(long)]
    pub uuid: Option<String>,

    /// Namespaces to observe
    #[arg(long, short = 'n', value_delimiter = ',')]
    pub namespaces: Vec<String>,

    /// Namespace label selector, key=value[,key=value]
    #[arg(long, short = 'l', default_value = "")]
    pub selector: String,

    /// Job name attached to the samples
    #[arg(long, short = 'j', default_value = "burner-measure")]
    pub job_name: String,

    /// Kinds to observe as apiVersion/kind
    #[arg(long, short = 'k', value_delimiter = ',', default_value = "v1/Pod")]
    pub kinds: Vec<String>,
}

/// Time window of a scrape or evaluation
#[derive(Args, Clone)]
pub struct WindowArgs {
    /// Window start, epoch seconds; defaults to one hour before the end
    #[arg(long)]
    pub start: Option<i64>,

    /// Window end, epoch seconds; defaults to now
    #[arg(long)]
    pub end: Option<i64>,

    /// Range query resolution
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub step: Duration,
}

/// Destination of indexed records
#[derive(Args, Clone, Default)]
pub struct IndexerArgs {
    /// Search servers to bulk-index into
    #[arg(long, value_delimiter = ',')]
    pub es_server: Vec<String>,

    /// Search index name
    #[arg(long)]
    pub es_index: Option<String>,

    /// Directory for local JSON-lines files
    #[arg(long)]
    pub metrics_directory: Option<PathBuf>,

    /// Bundle local files into this archive
    #[arg(long)]
    pub tarball_name: Option<String>,
}

/// Connection to a Prometheus endpoint
#[derive(Args, Clone)]
pub struct PrometheusArgs {
    /// Prometheus URL
    #[arg(long, short = 'u')]
    pub prometheus_url: String,

    /// Bearer token
    #[arg(long, env = "BURNER_PROMETHEUS_TOKEN")]
    pub token: Option<String>,

    /// Basic auth username, ignored when a token is given
    #[arg(long)]
    pub username: Option<String>,

    /// Basic auth password
    #[arg(long, env = "BURNER_PROMETHEUS_PASSWORD")]
    pub password: Option<String>,

    /// Skip TLS verification
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub skip_tls_verify: bool,
}

#[derive(Args)]
pub struct IndexArgs {
    #[command(flatten)]
    pub prometheus: PrometheusArgs,

    /// Metric profile files
    #[arg(long, short = 'm', value_delimiter = ',', required = true)]
    pub metrics_profile: Vec<PathBuf>,

    /// Run id stamped on the samples; generated when omitted
    #[arg(long)]
    pub uuid: Option<String>,

    /// Job name stamped on the samples
    #[arg(long, short = 'j', default_value = "burner-indexing")]
    pub job_name: String,

    #[command(flatten)]
    pub window: WindowArgs,

    #[command(flatten)]
    pub indexer: IndexerArgs,
}

#[derive(Args)]
pub struct CheckAlertsArgs {
    #[command(flatten)]
    pub prometheus: PrometheusArgs,

    /// Alert profile files
    #[arg(long, short = 'a', value_delimiter = ',', required = true)]
    pub alert_profile: Vec<PathBuf>,

    /// Lowest severity whose breach fails the command
    #[arg(long, default_value = "error")]
    pub fail_severity: AlertSeverity,

    /// Run id stamped on the verdicts; generated when omitted
    #[arg(long)]
    pub uuid: Option<String>,

    #[command(flatten)]
    pub window: WindowArgs,

    /// Index the verdicts when a destination is given
    #[command(flatten)]
    pub indexer: IndexerArgs,
}

#[derive(Args)]
pub struct ImportArgs {
    /// Archive produced by a local indexer
    #[arg(long)]
    pub tarball: PathBuf,

    #[command(flatten)]
    pub indexer: IndexerArgs,
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(std::io::stderr)).init(),
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<Outcome> {
    let connect = config::ConnectArgs::new(cli.kubeconfig, cli.kube_context);
    match cli.command {
        Commands::Init(args) => init::run(&connect, args).await,
        Commands::Measure(args) => measure::run(&connect, args).await,
        Commands::Destroy { uuid, timeout } => cluster::destroy(&connect, &uuid, timeout).await,
        Commands::HealthCheck => cluster::health_check(&connect).await,
        Commands::Index(args) => metrics::index(args).await,
        Commands::CheckAlerts(args) => metrics::check_alerts(args).await,
        Commands::Import(args) => metrics::import(args).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    let outcome = match dispatch(cli).await {
        Ok(outcome) => outcome,
        Err(e) => {
            output::print_error(&format!("{e:#}"));
            Outcome::Fatal
        }
    };
    output::print_outcome(outcome);
    std::process::exit(outcome.exit_code());
}
