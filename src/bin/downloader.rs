//! The downloader turns the CDX index files collected for one site into a WARC file
//! and/or rows in Postgres.
//!
//! CDX files are expected under `{data_dir}/cdx/{key}/{key}-{crawl}.cdx.gz`. Every
//! line names a byte range inside one of Common Crawl's WARC files:
//!
//! ```json
//! com,example)/path 20240722120756
//! {
//!     "url": "https://example.com/path",
//!     "mime": "text/html",
//!     "status": "200",
//!     "length": "16650",
//!     "offset": "64016172",
//!     "filename": "crawl-data/CC-MAIN-2024-30/segments/1720763518115.82/warc/CC-MAIN-20240723194208-20240723224208-00279.warc.gz"
//! }
//! ```
//!
//! Lines that are not HTML, did not return 200, or point at a URL already seen are
//! dropped. The remaining ranges are fetched a batch at a time and written to
//! `{data_dir}/warc/{key}-{crawl}-{worker:04}-of-{num_workers:04}.warc.gz`
//! (`--write-warcfile`) and/or loaded into Postgres (`--load-pg`).
//!
//! Several workers can split one site between them with `--worker` and
//! `--num-workers`. Progress is stored per worker in the `source` table; re-running a
//! crashed command continues after the last committed batch, and re-running a
//! finished one does nothing.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cc_ingest::{
    cdx::CdxFilters,
    commoncrawl::{HttpRangeFetcher, DEFAULT_BASE_URL},
    lexical::{EmbeddingSet, MAX_EMBEDDING_WORDS},
    metadata::HtmlMetadataExtractor,
    pipeline::{download, Loader, PipelineConfig, SourceOutcome, DEFAULT_DATA_DIR},
    scheduler::SchedulerConfig,
    segment::RecordFilter,
    store::PgStore,
    tracing_and_metrics::{run_metrics_server, setup_tracing},
};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download (and optionally load) all useful captures of one site
    DownloadWarc(DownloadArgs),
}

#[derive(clap::Args, Debug)]
struct DownloadArgs {
    /// Site key the CDX files were collected for, e.g. `com,example)`
    key: String,

    /// Index of this worker, in `0..num_workers`
    #[arg(long, default_value_t = 0)]
    worker: u32,

    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    num_workers: u32,

    /// Only read this crawl, e.g. `CC-MAIN-2024-30`; all crawls when omitted
    #[arg(long)]
    crawl: Option<String>,

    #[arg(long, env = "CC_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    #[arg(long, env = "CC_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Write the fetched segments to a WARC file
    #[arg(long)]
    write_warcfile: bool,

    /// Load the fetched records into Postgres
    #[arg(long)]
    load_pg: bool,

    /// Overwrite an existing WARC file
    #[arg(long)]
    force: bool,

    /// Only filter and count candidates; no network or database access
    #[arg(long)]
    dryrun: bool,

    /// Postgres connection string, required with `--load-pg`
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Stop after this many accepted candidates (across all workers)
    #[arg(long)]
    max_urls: Option<u64>,

    /// Prefer the newest capture of a URL instead of the oldest
    #[arg(long)]
    newest_first: bool,

    /// Maximum number of concurrent range requests
    #[arg(long, default_value_t = 100)]
    concurrency: usize,

    #[arg(long, default_value_t = 100)]
    fetch_batch_size: usize,

    #[arg(long, default_value_t = 100)]
    ingest_batch_size: usize,

    /// Keep arrival order within a batch instead of sorting by URL
    #[arg(long = "no-sort-batches", action = clap::ArgAction::SetFalse)]
    sort_batches: bool,

    /// Only load successful HTML responses
    #[arg(long)]
    strict_records: bool,

    /// Directory of per-language word vectors (`{lang}.vec`, text format) used to
    /// compute context vectors
    #[arg(long)]
    embeddings_dir: Option<PathBuf>,

    /// Fall back to the whole body when a page has no article or main element
    #[arg(long)]
    max_recall: bool,

    #[arg(long, default_value_t = 60)]
    request_timeout_secs: u64,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,
}

impl DownloadArgs {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            key: self.key.clone(),
            worker: self.worker,
            num_workers: self.num_workers,
            crawl: self.crawl.clone(),
            data_dir: self.data_dir.clone(),
            newest_first: self.newest_first,
            write_warcfile: self.write_warcfile,
            force: self.force,
            dryrun: self.dryrun,
            filters: CdxFilters {
                max_candidates: self.max_urls,
                ..CdxFilters::default()
            },
            scheduler: SchedulerConfig {
                concurrency: self.concurrency,
                batch_size: self.fetch_batch_size,
                sort_by_url: self.sort_batches,
            },
            ingest_batch_size: self.ingest_batch_size,
            record_filter: if self.strict_records {
                RecordFilter::Strict
            } else {
                RecordFilter::Relaxed
            },
        }
    }
}

#[tokio::main]
async fn main() {
    let run_result = match Cli::parse().command {
        Command::DownloadWarc(args) => run(args).await,
    };
    if let Err(e) = run_result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: DownloadArgs) -> Result<()> {
    setup_tracing();
    if let Some(port) = args.metrics_port {
        tokio::task::spawn(run_metrics_server(port));
    }

    let config = args.pipeline_config();
    let fetcher = Arc::new(
        HttpRangeFetcher::new(&args.base_url, Duration::from_secs(args.request_timeout_secs))
            .context("failed to build HTTP client")?,
    );

    let mut store = match (&args.database_url, args.load_pg && !args.dryrun) {
        (Some(url), true) => {
            let store = PgStore::connect(url)
                .await
                .context("Looks like Postgres is not available.")?;
            store
                .ensure_schema()
                .await
                .context("failed to create database schema")?;
            Some(store)
        }
        (None, true) => anyhow::bail!("--load-pg requires DATABASE_URL"),
        _ => None,
    };
    let embeddings = args
        .embeddings_dir
        .as_deref()
        .map(|dir| EmbeddingSet::load_dir(dir, Some(MAX_EMBEDDING_WORDS)))
        .transpose()?;
    let extractor = HtmlMetadataExtractor::new(args.max_recall);
    let loader = store.as_mut().map(|store| Loader {
        store,
        extractor: &extractor,
        embeddings: embeddings.as_ref(),
    });

    match download(&config, fetcher, loader).await? {
        SourceOutcome::Skipped { finished_at } => {
            tracing::info!(%finished_at, "nothing to do");
        }
        SourceOutcome::DryRun { candidates, stats } => {
            tracing::info!(candidates, %stats, "dry run");
        }
        SourceOutcome::Finished {
            candidates,
            ingest,
            stats,
        } => {
            tracing::info!(candidates, ingest = ?ingest, %stats, "done");
        }
    }
    Ok(())
}
