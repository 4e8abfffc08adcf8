//! # Build Log Indexer CLI (`build-log-indexer`)
//!
//! ## Usage
//!
//! ```bash
//! build-log-indexer [--config ./config/indexer.toml] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `backfill` | Index every not-yet-indexed build in the cache |
//! | `inspect <key>` | Show how a descriptor key parses |
//! | `index-name` | Print the index partition name for a date |
//!
//! Endpoints and credentials normally come from the environment
//! (`OPENSEARCH_ENDPOINT`, `OPENSEARCH_USERNAME`, `OPENSEARCH_PASSWORD`,
//! `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`).
//!
//! `backfill` exits 0 even when individual items fail; failures are in the
//! logs, keyed by descriptor key.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use build_log_indexer::backfill::{Backfill, RunOptions};
use build_log_indexer::config::{self, Config};
use build_log_indexer::key::KeyParser;
use build_log_indexer::object_store::{AwsCredentials, S3Store};
use build_log_indexer::progress::ProgressMode;
use build_log_indexer::search::{index_name, OpenSearchClient};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};

/// Build Log Indexer: index build-cache metadata and build logs into
/// date-partitioned OpenSearch indices.
#[derive(Parser)]
#[command(
    name = "build-log-indexer",
    about = "Index build-cache metadata and build logs into OpenSearch",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Optional. Without it, built-in defaults plus environment overrides
    /// are used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` wins.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Progress output on stderr. Defaults to human when stderr is a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Index every build in the cache that is not already indexed.
    ///
    /// Lists all descriptor keys, creates today's index partition, and
    /// processes keys on a bounded worker pool. Per-item failures are
    /// logged and counted; they do not change the exit status.
    Backfill {
        /// Worker pool size. Defaults to `[backfill].concurrency`, then the
        /// number of CPUs.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Process only the first N listed keys.
        #[arg(long)]
        limit: Option<usize>,

        /// List and parse keys only; create, download, and write nothing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Parse one descriptor key and show the bundle it resolves to.
    Inspect {
        /// Full descriptor key, e.g.
        /// `develop/build_cache/linux-x86_64-gcc-9.3.0-zlib-abc1234.spec.json.sig`.
        key: String,
    },

    /// Print the index partition name for a date.
    IndexName {
        /// Date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match cli.verbose {
        0 => "build_log_indexer=info",
        1 => "build_log_indexer=debug",
        _ => "build_log_indexer=trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let cfg = config::load_config(cli.config.as_deref())?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Backfill {
            concurrency,
            limit,
            dry_run,
        } => {
            run_backfill(&cfg, progress, concurrency, limit, dry_run).await?;
        }
        Commands::Inspect { key } => {
            inspect(&cfg, &key)?;
        }
        Commands::IndexName { date } => {
            println!(
                "{}",
                index_name(&cfg.search.index_prefix, date.unwrap_or_else(today))
            );
        }
    }

    Ok(())
}

async fn run_backfill(
    cfg: &Config,
    progress: ProgressMode,
    concurrency: Option<usize>,
    limit: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if concurrency == Some(0) {
        bail!("--concurrency must be >= 1");
    }
    if !dry_run {
        cfg.require_search_endpoint()?;
    }

    let store = S3Store::new(&cfg.object_store, AwsCredentials::from_env())?;
    if store.is_anonymous() {
        tracing::info!("no AWS credentials in environment, reading the bucket anonymously");
    }
    // A dry run never talks to the search backend, so skip the mapping file.
    let search = if dry_run {
        OpenSearchClient::new(
            &cfg.search.endpoint,
            &cfg.search.index_prefix,
            Duration::from_secs(cfg.search.timeout_secs),
        )?
    } else {
        OpenSearchClient::from_config(&cfg.search)?
    };

    let mut options = RunOptions::from_config(cfg, today());
    if let Some(n) = concurrency {
        options.concurrency = n;
    }
    options.limit = limit;
    options.dry_run = dry_run;

    let backfill = Backfill::new(Arc::new(store), Arc::new(search), options)?
        .with_progress(progress.reporter());
    let summary = backfill.run().await?;

    let source = format!("s3://{}/{}", cfg.object_store.bucket, cfg.object_store.prefix);
    if dry_run {
        println!("backfill {} (dry-run)", source);
        println!("  listed: {} keys", summary.listed);
        println!("  would process: {}", summary.planned);
        println!("  unparsable: {}", summary.failed);
    } else {
        println!("backfill {} -> {}", source, backfill.index());
        println!("  listed: {} keys", summary.listed);
        println!("  written: {}", summary.written);
        println!("  skipped: {}", summary.skipped);
        println!("  failed: {}", summary.failed);
    }
    println!("ok");
    Ok(())
}

fn inspect(cfg: &Config, key: &str) -> Result<()> {
    let parser = KeyParser::new(
        &cfg.object_store.prefix,
        &cfg.object_store.descriptor_suffix,
    )?;
    let artifact = parser.parse(key)?;

    println!("platform: {}", artifact.platform);
    println!("compiler: {}", artifact.compiler);
    println!("package:  {}", artifact.package);
    println!("hash:     {}", artifact.hash);
    println!("bundle:   {}", parser.bundle_path(&artifact));
    println!("metadata: {}/.spack/", artifact.bundle_root());
    Ok(())
}
