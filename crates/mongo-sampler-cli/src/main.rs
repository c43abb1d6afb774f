//! mongo-sampler CLI - statistical equivalence verification between two
//! MongoDB deployments.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use bson::doc;
use chrono::{DateTime, SecondsFormat, Utc};
use clap::Parser;
use mongo_sampler::{connect, util, Comparer, Config, MongoOptions, SamplerError};
use mongodb::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser, Debug)]
#[command(name = "mongo-sampler")]
#[command(about = "Statistical equivalence verification between two MongoDB deployments")]
#[command(version)]
struct Cli {
    /// Source connection string
    #[arg(long, help_heading = "Required")]
    src: String,

    /// Target connection string
    #[arg(long, help_heading = "Required")]
    tgt: String,

    /// Meta connection string, defaults to the target
    #[arg(long, help_heading = "Optional")]
    meta: Option<String>,

    /// Meta database name
    #[arg(long, default_value = "sampler", help_heading = "Optional")]
    metadbname: String,

    /// Namespace to check, pass this flag multiple times to check multiple
    /// namespaces
    #[arg(long = "ns", help_heading = "Optional")]
    ns: Vec<String>,

    /// Path to a filter file mapping namespaces to extended-JSON filters
    /// (e.g. { "test.test": { "ts": { "$gt": { "$date": ... } } } })
    #[arg(long, help_heading = "Optional")]
    filter: Option<PathBuf>,

    /// Z-score for Cochran's sample size. Don't touch unless you know what
    /// you're doing
    #[arg(long, default_value_t = 2.58, help_heading = "Optional")]
    zscore: f64,

    /// Error rate for Cochran's sample size. Don't touch unless you know
    /// what you're doing
    #[arg(long = "errRate", default_value_t = 0.01, help_heading = "Optional")]
    err_rate: f64,

    /// Override the sampling logic with a fixed number of documents to check
    #[arg(long = "forceSampleSize", default_value_t = 0, help_heading = "Optional")]
    force_sample_size: u64,

    /// Log level [ error | warn | info | debug | trace ]
    #[arg(long, default_value = "info", help_heading = "Optional")]
    verbosity: String,

    /// Directory for the log file; the file is named sampler-{datetime}.log
    /// per run. No file is generated when unset
    #[arg(long, help_heading = "Optional")]
    log: Option<PathBuf>,

    /// Drop the metadata database before the run
    #[arg(long, help_heading = "Optional")]
    clean: bool,

    /// Store the whole documents in the metadata docs collection; adds time
    /// and uses additional disk space on the destination
    #[arg(long, help_heading = "Optional")]
    fulldoc: bool,

    /// Only report estimated document counts, skip all comparisons
    #[arg(long, help_heading = "Optional")]
    dryrun: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        let target = MongoOptions::new(self.tgt);
        Config {
            source: MongoOptions::new(self.src),
            meta: MongoOptions::new(self.meta.unwrap_or_else(|| target.uri.clone())),
            target,
            compare: mongo_sampler::CompareOptions {
                zscore: self.zscore,
                error_rate: self.err_rate,
                force_sample_size: self.force_sample_size,
            },
            meta_db_name: self.metadbname,
            include_ns: self.ns,
            filter: self.filter,
            verbosity: self.verbosity,
            log_dir: self.log,
            clean_meta: self.clean,
            report_full_doc: self.fulldoc,
            dry_run: self.dryrun,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), SamplerError> {
    let start_time = Utc::now();
    let cli = Cli::parse();
    let config = cli.into_config();
    config.validate()?;

    setup_logging(&config.verbosity, config.log_dir.as_deref(), start_time)?;
    debug!(?config, "configuration loaded");

    let cancel = setup_signal_handler();

    let (source, target, meta) = connect_all(&config).await?;
    let comparer = Comparer::new(config, source, target, meta, start_time).await?;
    comparer.compare(cancel).await
}

/// Connect all three clients and verify each answers a ping; any cluster
/// being unreachable at startup is fatal.
async fn connect_all(config: &Config) -> Result<(Client, Client, Client), SamplerError> {
    let source = connect(&config.source).await?;
    ping(&source, "source").await?;
    let target = connect(&config.target).await?;
    ping(&target, "target").await?;
    let meta = connect(&config.meta).await?;
    ping(&meta, "meta").await?;
    Ok((source, target, meta))
}

async fn ping(client: &Client, which: &str) -> Result<(), SamplerError> {
    client
        .database("admin")
        .run_command(doc! { "ping": 1 }, None)
        .await?;
    info!("connected to {}", which);
    Ok(())
}

fn setup_logging(
    verbosity: &str,
    log_dir: Option<&Path>,
    start_time: DateTime<Utc>,
) -> Result<(), SamplerError> {
    let level = match verbosity {
        "error" => LevelFilter::ERROR,
        "warn" => LevelFilter::WARN,
        "info" => LevelFilter::INFO,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    };
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            let dir = PathBuf::from(util::clean_path(&dir.to_string_lossy()));
            let stamp = start_time.to_rfc3339_opts(SecondsFormat::Secs, true);
            let file = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(dir.join(format!("sampler-{}.log", stamp)))?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(file));
            tracing_subscriber::registry()
                .with(level)
                .with(stdout_layer)
                .with(file_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(level)
                .with(stdout_layer)
                .init();
        }
    }
    Ok(())
}

/// Cancellation on SIGINT and SIGTERM; workers abort at their next
/// suspension point and the reporter still drains.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(_) => return,
        };
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Shutting down gracefully...");
        token.cancel();
    });

    let token = cancel.clone();
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(_) => return,
        };
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Shutting down gracefully...");
        token.cancel();
    });

    cancel
}

#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
        }
    });
    cancel
}
