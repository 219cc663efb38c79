//! This crate consists of two binaries, called [downloader](../downloader/index.html) and
//! [warc_loader](../warc_loader/index.html).
//!
//! The downloader reads the CDX index files collected for one site, selects HTML
//! captures, fetches their archive segments from Common Crawl with byte-range requests
//! and loads them into Postgres. The warc_loader loads `.warc.gz` files that are
//! already on disk. Both record their progress per source, so an interrupted run
//! is resumed by running the same command again.
pub mod backoff;
pub mod cdx;
pub mod commoncrawl;
pub mod ingest;
pub mod lexical;
pub mod metadata;
pub mod pipeline;
pub mod scheduler;
pub mod segment;
pub mod sink;
pub mod store;
pub mod surt;
pub mod tracing_and_metrics;
