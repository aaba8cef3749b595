use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use pvh_pipeline::{aggregate_dumps, download_dumps, Collector, CollectorConfig, DUMPS_BASE_URL};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pvh-cli")]
#[command(about = "Wikipedia yearly pageview harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch yearly pageview totals for every batch in the input directory.
    Collect(CollectArgs),
    /// Sum raw hourly dump files into a per-article totals CSV.
    Aggregate(AggregateArgs),
    /// Download hourly pageview dump files for a date range.
    Download(DownloadArgs),
}

#[derive(Debug, Args, Default)]
struct CollectArgs {
    /// Directory of batch input files (JSON arrays of article records).
    #[arg(long)]
    input_dir: Option<PathBuf>,
    /// Directory for per-article result artifacts.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Path of the audit CSV.
    #[arg(long)]
    audit_file: Option<PathBuf>,
    /// Path of the batch completion log.
    #[arg(long)]
    completion_log: Option<PathBuf>,
    /// Year to collect pageviews for.
    #[arg(long)]
    year: Option<u16>,
    /// Cap on simultaneous batches and in-flight article fetches.
    #[arg(long)]
    concurrency: Option<usize>,
    /// Retries beyond the first attempt for transient failures.
    #[arg(long)]
    retries: Option<usize>,
    /// Per-request timeout in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl CollectArgs {
    fn into_config(self) -> CollectorConfig {
        let mut config = CollectorConfig::from_env();
        if let Some(dir) = self.input_dir {
            config.input_dir = dir;
        }
        if let Some(dir) = self.output_dir {
            config.artifacts_dir = dir;
        }
        if let Some(path) = self.audit_file {
            config.audit_path = path;
        }
        if let Some(path) = self.completion_log {
            config.completion_log_path = path;
        }
        if let Some(year) = self.year {
            config.year = year;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(retries) = self.retries {
            config.backoff.max_retries = retries;
        }
        if let Some(secs) = self.timeout_secs {
            config.api.timeout = Duration::from_secs(secs);
        }
        config
    }
}

#[derive(Debug, Args)]
struct AggregateArgs {
    /// Directory holding raw hourly dump files.
    #[arg(long, default_value = "./pageview_dumps")]
    dumps_dir: PathBuf,
    /// Output CSV of per-article totals.
    #[arg(long, default_value = "./pageview_totals.csv")]
    output: PathBuf,
    /// Keep only lines whose project column starts with this prefix.
    #[arg(long, default_value = "en")]
    project_prefix: String,
}

#[derive(Debug, Args)]
struct DownloadArgs {
    /// First day of the range (YYYY-MM-DD).
    #[arg(long)]
    from: NaiveDate,
    /// Last day of the range, inclusive (YYYY-MM-DD).
    #[arg(long)]
    to: NaiveDate,
    /// Directory to save dump files into.
    #[arg(long, default_value = "./pageview_dumps")]
    dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("pvh_pipeline=info".parse()?)
                .add_directive("pvh_wikimedia=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli
        .command
        .unwrap_or_else(|| Commands::Collect(CollectArgs::default()))
    {
        Commands::Collect(args) => {
            let config = args.into_config();
            let collector = Collector::new(config).await?;
            let summary = collector.run().await?;
            println!(
                "collection complete: run_id={} batches {} completed / {} skipped / {} aborted, articles {} ok / {} failed / {} errored",
                summary.run_id,
                summary.batches_completed,
                summary.batches_skipped,
                summary.batches_aborted,
                summary.articles_succeeded,
                summary.articles_failed,
                summary.articles_errored
            );
        }
        Commands::Aggregate(args) => {
            let summary = aggregate_dumps(&args.dumps_dir, &args.output, &args.project_prefix)?;
            println!(
                "aggregation complete: {} files scanned, {} articles, {} total views -> {}",
                summary.files_scanned,
                summary.articles,
                summary.total_views,
                args.output.display()
            );
        }
        Commands::Download(args) => {
            let api = CollectorConfig::from_env().api;
            let client = reqwest::Client::builder()
                .user_agent(api.user_agent)
                .connect_timeout(Duration::from_secs(30))
                .build()?;
            let saved = download_dumps(&client, DUMPS_BASE_URL, args.from, args.to, &args.dir).await?;
            println!("download complete: {} dump files saved to {}", saved, args.dir.display());
        }
    }

    Ok(())
}
