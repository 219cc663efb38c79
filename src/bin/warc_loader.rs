//! Loads `.warc.gz` files that are already on disk into Postgres.
//!
//! Only `response` records with a 2xx status and an HTML or text content type are
//! kept. Each file is its own source in the `source` table, so files that were loaded
//! completely are skipped and partially loaded ones continue where they stopped.
use std::path::PathBuf;

use anyhow::{Context, Result};
use cc_ingest::{
    lexical::{EmbeddingSet, MAX_EMBEDDING_WORDS},
    metadata::HtmlMetadataExtractor,
    pipeline::{load_warc_file, Loader, SourceOutcome},
    store::PgStore,
    tracing_and_metrics::{run_metrics_server, setup_tracing},
};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// WARC files to load, in order
    #[arg(required = true)]
    warc_paths: Vec<PathBuf>,

    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Directory of per-language word vectors (`{lang}.vec`, text format) used to
    /// compute context vectors
    #[arg(long)]
    embeddings_dir: Option<PathBuf>,

    /// Fall back to the whole body when a page has no article or main element
    #[arg(long)]
    max_recall: bool,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let run_result = run(Args::parse()).await;
    if let Err(e) = run_result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    setup_tracing();
    if let Some(port) = args.metrics_port {
        tokio::task::spawn(run_metrics_server(port));
    }

    let mut store = PgStore::connect(&args.database_url)
        .await
        .context("Looks like Postgres is not available.")?;
    store
        .ensure_schema()
        .await
        .context("failed to create database schema")?;
    let embeddings = args
        .embeddings_dir
        .as_deref()
        .map(|dir| EmbeddingSet::load_dir(dir, Some(MAX_EMBEDDING_WORDS)))
        .transpose()?;
    let extractor = HtmlMetadataExtractor::new(args.max_recall);

    for path in &args.warc_paths {
        let loader = Loader {
            store: &mut store,
            extractor: &extractor,
            embeddings: embeddings.as_ref(),
        };
        match load_warc_file(path, loader, args.batch_size).await? {
            SourceOutcome::Finished { candidates, .. } => {
                tracing::info!(path = %path.display(), records = candidates, "loaded");
            }
            outcome => tracing::info!(path = %path.display(), ?outcome, "not loaded"),
        }
    }
    Ok(())
}
