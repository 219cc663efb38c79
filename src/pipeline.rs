//! Per-source orchestration: CDX candidates to fetched segments to stored rows.
//!
//! A source is one `(key, crawl, worker, num_workers)` combination, named after its
//! archive path. Its ledger row decides what happens on start:
//!
//! * no row yet, or a row without `finished_at`: process, skipping the first
//!   `urls_inserted` candidates of this worker's shard;
//! * a row with `finished_at`: nothing to do.
//!
//! A crash leaves the ledger at the last committed batch, so re-running the same
//! command resumes where it stopped. When an archive is written alongside the ingest,
//! a segment reaches it only once its batch is committed, and a resumed run appends.
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use warc::WarcReader;

use crate::cdx::{CandidateRecord, CdxError, CdxFilters, CdxStream, FilterStats};
use crate::commoncrawl::RangeFetch;
use crate::ingest::{IngestSummary, Ingester};
use crate::lexical::EmbeddingSet;
use crate::metadata::MetadataExtractor;
use crate::scheduler::{BatchScheduler, SchedulerConfig};
use crate::segment::{ArchiveRecord, RecordFilter, SegmentDecoder};
use crate::sink::{archive_file_name, ArchiveSink};
use crate::store::IngestStore;

pub const DEFAULT_DATA_DIR: &str = "/data/common-crawl";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Site key the CDX files were collected for, e.g. `com,example)`.
    pub key: String,
    pub worker: u32,
    pub num_workers: u32,
    /// Single crawl to read; all crawls under the data directory when `None`.
    pub crawl: Option<String>,
    pub data_dir: PathBuf,
    pub newest_first: bool,
    pub write_warcfile: bool,
    pub force: bool,
    pub dryrun: bool,
    pub filters: CdxFilters,
    pub scheduler: SchedulerConfig,
    pub ingest_batch_size: usize,
    pub record_filter: RecordFilter,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            worker: 0,
            num_workers: 1,
            crawl: None,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            newest_first: false,
            write_warcfile: false,
            force: false,
            dryrun: false,
            filters: CdxFilters::default(),
            scheduler: SchedulerConfig::default(),
            ingest_batch_size: 100,
            record_filter: RecordFilter::Relaxed,
        }
    }
}

impl PipelineConfig {
    /// `{data_dir}/warc/{key}-{crawl}-{worker:04}-of-{num_workers:04}.warc.gz`, also
    /// used as the ledger's source name.
    pub fn archive_path(&self) -> PathBuf {
        self.data_dir.join("warc").join(archive_file_name(
            &self.key,
            self.crawl.as_deref(),
            self.worker,
            self.num_workers,
        ))
    }

    /// CDX files to read, in the order their candidates take precedence.
    ///
    /// Without an explicit crawl every file under `{data_dir}/cdx/{key}/` is used,
    /// oldest crawl first unless `newest_first` is set.
    pub fn cdx_paths(&self) -> Result<Vec<PathBuf>> {
        let dir = self.data_dir.join("cdx").join(&self.key);
        if let Some(crawl) = &self.crawl {
            return Ok(vec![dir.join(format!("{}-{crawl}.cdx.gz", self.key))]);
        }
        let mut paths = fs::read_dir(&dir)
            .with_context(|| format!("failed to list cdx directory {}", dir.display()))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("failed to list cdx directory {}", dir.display()))?;
        paths.retain(|p| p.is_file());
        paths.sort();
        if self.newest_first {
            paths.reverse();
        }
        Ok(paths)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    /// The ledger already marked the source finished.
    Skipped { finished_at: DateTime<Utc> },
    /// Candidates counted without fetching anything.
    DryRun { candidates: u64, stats: FilterStats },
    /// All candidates consumed. `ingest` is `None` when nothing was loaded.
    Finished {
        candidates: u64,
        ingest: Option<IngestSummary>,
        stats: FilterStats,
    },
}

/// Candidates assigned to `worker` out of `num_workers`, after the first `skip`.
pub fn shard<I>(
    candidates: I,
    worker: u32,
    num_workers: u32,
    skip: usize,
) -> impl Iterator<Item = Result<CandidateRecord, CdxError>>
where
    I: Iterator<Item = Result<CandidateRecord, CdxError>>,
{
    let num_workers = num_workers.max(1) as usize;
    let worker = worker as usize;
    candidates
        .enumerate()
        .filter(move |(i, _)| i % num_workers == worker)
        .map(|(_, candidate)| candidate)
        .skip(skip)
}

/// Everything [download] needs to load into a store.
pub struct Loader<'a, S: IngestStore> {
    pub store: &'a mut S,
    pub extractor: &'a dyn MetadataExtractor,
    pub embeddings: Option<&'a EmbeddingSet>,
}

/// Runs one source: filter CDX candidates, fetch them batch by batch, optionally
/// write them to the archive file and load them into the store.
pub async fn download<F, S>(
    config: &PipelineConfig,
    fetcher: Arc<F>,
    loader: Option<Loader<'_, S>>,
) -> Result<SourceOutcome>
where
    F: RangeFetch + 'static,
    S: IngestStore,
{
    anyhow::ensure!(
        config.worker < config.num_workers.max(1),
        "worker {} out of range for {} workers",
        config.worker,
        config.num_workers
    );
    let archive_path = config.archive_path();
    let source_name = archive_path.display().to_string();
    let cdx_paths = config.cdx_paths()?;
    let mut stream = CdxStream::new(&cdx_paths, config.filters);

    if config.dryrun {
        let mut candidates = 0u64;
        for candidate in shard(stream.by_ref(), config.worker, config.num_workers, 0) {
            candidate?;
            candidates += 1;
        }
        tracing::info!(source = %source_name, candidates, "dry run finished");
        return Ok(SourceOutcome::DryRun {
            candidates,
            stats: stream.stats().clone(),
        });
    }

    let mut ingester = match loader {
        Some(loader) => {
            let progress = loader
                .store
                .get_or_create_source(&source_name)
                .await
                .with_context(|| format!("failed to look up source {source_name}"))?;
            if let Some(finished_at) = progress.finished_at {
                tracing::info!(source = %source_name, %finished_at, "source already finished, skipping");
                return Ok(SourceOutcome::Skipped { finished_at });
            }
            tracing::info!(
                source = %source_name,
                source_id = progress.id,
                urls_inserted = progress.urls_inserted,
                "processing source"
            );
            Some(Ingester::new(
                loader.store,
                &progress,
                config.ingest_batch_size,
                loader.extractor,
                loader.embeddings,
            ))
        }
        None => None,
    };

    let skip = ingester.as_ref().map_or(0, |i| i.urls_inserted().max(0) as usize);
    if skip > 0 {
        tracing::info!(skip, "resuming after already inserted candidates");
    }

    // a resumed run continues the archive of the committed candidates
    let mut sink = if !config.write_warcfile {
        None
    } else if ingester.is_some() && (skip > 0 || is_empty_file(&archive_path)) {
        Some(ArchiveSink::append(&archive_path)?)
    } else {
        Some(ArchiveSink::create(&archive_path, config.force)?)
    };
    // segments fetched but not yet covered by a ledger advance
    let mut pending: VecDeque<Bytes> = VecDeque::new();
    let mut candidates = shard(stream.by_ref(), config.worker, config.num_workers, skip);
    let mut scheduler = BatchScheduler::new(fetcher, config.scheduler);
    let mut decoder = SegmentDecoder::new(config.record_filter);
    let mut fetched = 0u64;

    while let Some(batch) = scheduler.next_batch(&mut candidates).await? {
        fetched += batch.len() as u64;
        for segment in batch {
            let Some(ingester) = ingester.as_mut() else {
                if let Some(sink) = sink.as_mut() {
                    sink.write_segment(&segment.bytes)?;
                }
                continue;
            };
            let record = decoder.decode(&segment.url, &segment.bytes);
            if sink.is_some() {
                pending.push_back(segment.bytes);
            }
            match record {
                Some(record) => ingester.push(record).await?,
                None => ingester.push_skipped().await?,
            }
            if let Some(sink) = sink.as_mut() {
                let committed = ingester.urls_inserted().max(0) as usize - skip;
                let written = sink.segments_written() as usize;
                write_pending(sink, &mut pending, committed.saturating_sub(written))?;
            }
        }
    }
    drop(candidates);

    let ingest = match ingester {
        Some(ingester) => Some(ingester.finish().await?),
        None => None,
    };
    if let Some(sink) = sink.as_mut() {
        let remaining = pending.len();
        write_pending(sink, &mut pending, remaining)?;
    }
    let decode_stats = decoder.stats();
    tracing::info!(
        source = %source_name,
        fetched,
        decoded = decode_stats.decoded,
        corrupt = decode_stats.corrupt,
        filtered = decode_stats.filtered,
        "candidate stream exhausted"
    );
    Ok(SourceOutcome::Finished {
        candidates: fetched,
        ingest,
        stats: stream.stats().clone(),
    })
}

fn write_pending(sink: &mut ArchiveSink, pending: &mut VecDeque<Bytes>, count: usize) -> Result<()> {
    for segment in pending.drain(..count.min(pending.len())) {
        sink.write_segment(&segment)?;
    }
    Ok(())
}

fn is_empty_file(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() == 0)
}

/// Loads a `.warc.gz` file from disk, keeping successful HTML responses only.
///
/// The file path is the source name. Resume skips the first `urls_inserted` kept
/// records, which is safe because the file does not change between runs.
pub async fn load_warc_file<S: IngestStore>(
    path: &Path,
    loader: Loader<'_, S>,
    batch_size: usize,
) -> Result<SourceOutcome> {
    let source_name = path.display().to_string();
    tracing::info!(path = %source_name, "loading warc file");
    let progress = loader
        .store
        .get_or_create_source(&source_name)
        .await
        .with_context(|| format!("failed to look up source {source_name}"))?;
    if let Some(finished_at) = progress.finished_at {
        tracing::info!(source = %source_name, %finished_at, "source already finished, skipping");
        return Ok(SourceOutcome::Skipped { finished_at });
    }

    let reader = WarcReader::from_path_gzip(path)
        .with_context(|| format!("failed to open {source_name}"))?;
    let skip = progress.urls_inserted.max(0) as u64;
    let mut ingester = Ingester::new(
        loader.store,
        &progress,
        batch_size,
        loader.extractor,
        loader.embeddings,
    );

    let mut kept = 0u64;
    for record in reader.iter_records() {
        let record = record.with_context(|| format!("failed to read record from {source_name}"))?;
        let record = ArchiveRecord::from_warc(&record);
        if !RecordFilter::Strict.accepts(&record) {
            tracing::debug!(
                url = ?record.url,
                record_type = %record.record_type,
                status = ?record.http_status,
                "skip record"
            );
            continue;
        }
        kept += 1;
        if kept <= skip {
            continue;
        }
        ingester.push(record).await?;
    }

    let ingest = ingester.finish().await?;
    Ok(SourceOutcome::Finished {
        candidates: kept,
        ingest: Some(ingest),
        stats: FilterStats::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(i: u64) -> Result<CandidateRecord, CdxError> {
        Ok(CandidateRecord {
            filename: "f".into(),
            offset: i,
            length: 1,
            mime: "text/html".into(),
            status: "200".into(),
            url: format!("https://example.com/{i}"),
        })
    }

    fn offsets(iter: impl Iterator<Item = Result<CandidateRecord, CdxError>>) -> Vec<u64> {
        iter.map(|c| c.unwrap().offset).collect()
    }

    #[test]
    fn shards_are_disjoint_and_skip_within_the_shard() {
        assert_eq!(offsets(shard((0..10).map(candidate), 1, 3, 0)), vec![1, 4, 7]);
        assert_eq!(offsets(shard((0..10).map(candidate), 0, 3, 2)), vec![6, 9]);
        assert_eq!(offsets(shard((0..4).map(candidate), 0, 1, 0)), vec![0, 1, 2, 3]);
    }

    #[test]
    fn archive_path_is_named_after_the_shard() {
        let config = PipelineConfig {
            key: "com,example)".into(),
            crawl: Some("CC-MAIN-2024-30".into()),
            worker: 2,
            num_workers: 8,
            data_dir: PathBuf::from("/tmp/cc"),
            ..PipelineConfig::default()
        };
        assert_eq!(
            config.archive_path(),
            PathBuf::from("/tmp/cc/warc/com,example)-CC-MAIN-2024-30-0002-of-0008.warc.gz")
        );
        assert_eq!(
            config.cdx_paths().unwrap(),
            vec![PathBuf::from(
                "/tmp/cc/cdx/com,example)/com,example)-CC-MAIN-2024-30.cdx.gz"
            )]
        );
    }

    #[test]
    fn discovers_crawls_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let cdx_dir = dir.path().join("cdx").join("key");
        fs::create_dir_all(&cdx_dir).unwrap();
        for name in ["key-CC-MAIN-2023-50.cdx.gz", "key-CC-MAIN-2021-04.cdx.gz"] {
            fs::write(cdx_dir.join(name), b"").unwrap();
        }
        let mut config = PipelineConfig {
            key: "key".into(),
            data_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let names = |paths: Vec<PathBuf>| -> Vec<String> {
            paths
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect()
        };
        assert_eq!(
            names(config.cdx_paths().unwrap()),
            vec!["key-CC-MAIN-2021-04.cdx.gz", "key-CC-MAIN-2023-50.cdx.gz"]
        );
        config.newest_first = true;
        assert_eq!(
            names(config.cdx_paths().unwrap()),
            vec!["key-CC-MAIN-2023-50.cdx.gz", "key-CC-MAIN-2021-04.cdx.gz"]
        );
    }
}
