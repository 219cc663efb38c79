//! Batched, bounded-concurrency download of candidate segments.
use std::sync::Arc;

use bytes::Bytes;
use sysinfo::{Pid, System};
use tokio::sync::{AcquireError, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

use crate::cdx::{CandidateRecord, CdxError};
use crate::commoncrawl::{FetchError, RangeFetch};

const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of range requests in flight at once.
    pub concurrency: usize,
    /// Number of candidates taken from the stream per batch.
    pub batch_size: usize,
    /// Stable-sort each finished batch by source URL instead of keeping arrival order.
    pub sort_by_url: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 100,
            batch_size: 100,
            sort_by_url: true,
        }
    }
}

/// Raw bytes of one archive segment and the URL it was captured from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSegment {
    pub url: String,
    pub bytes: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Cdx(#[from] CdxError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("fetch task failed: {0}")]
    Task(#[from] JoinError),
    #[error("fetch admission closed: {0}")]
    Admission(#[from] AcquireError),
}

/// Running totals used for the per-batch log line.
struct BatchTelemetry {
    batches: u64,
    urls_downloaded: u64,
    bytes_downloaded: u64,
    last_bytes: u64,
    last_time: Instant,
    system: System,
    pid: Option<Pid>,
}

impl BatchTelemetry {
    fn new() -> Self {
        Self {
            batches: 0,
            urls_downloaded: 0,
            bytes_downloaded: 0,
            last_bytes: 0,
            last_time: Instant::now(),
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    fn resident_mb(&mut self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        self.system.refresh_process(pid);
        self.system
            .process(pid)
            .map(|p| p.memory() as f64 / MB)
            .unwrap_or(0.0)
    }

    fn record(&mut self, segments: &[FetchedSegment]) -> BatchReport {
        self.batches += 1;
        self.urls_downloaded += segments.len() as u64;
        self.bytes_downloaded += segments.iter().map(|s| s.bytes.len() as u64).sum::<u64>();

        let now = Instant::now();
        let elapsed_s = now.duration_since(self.last_time).as_secs_f64();
        let batch_mb = (self.bytes_downloaded - self.last_bytes) as f64 / MB;
        let report = BatchReport {
            batch: self.batches - 1,
            urls_downloaded: self.urls_downloaded,
            elapsed_s,
            batch_mb,
            mb_downloaded: self.bytes_downloaded as f64 / MB,
            rate_mb_s: if elapsed_s > 0.0 { batch_mb / elapsed_s } else { 0.0 },
            mem_mb: self.resident_mb(),
        };
        tracing::info!(
            batch = report.batch,
            urls_downloaded = report.urls_downloaded,
            elapsed_s = %format!("{:.2}", report.elapsed_s),
            batch_mb = %format!("{:.2}", report.batch_mb),
            mem_mb = %format!("{:.2}", report.mem_mb),
            mb_downloaded = %format!("{:.2}", report.mb_downloaded),
            rate_mb_s = %format!("{:.2}", report.rate_mb_s),
            "batch fetched"
        );
        self.last_time = now;
        self.last_bytes = self.bytes_downloaded;
        report
    }
}

/// Figures logged after each fetched batch.
#[derive(Debug, Clone, Copy, PartialEq)]
struct BatchReport {
    batch: u64,
    urls_downloaded: u64,
    elapsed_s: f64,
    batch_mb: f64,
    mb_downloaded: f64,
    rate_mb_s: f64,
    mem_mb: f64,
}

/// Drains a candidate stream batch by batch.
///
/// Every batch is a barrier: all of its fetches finish before the next batch is read
/// from the stream, so the number of candidates consumed always equals the number of
/// segments handed downstream. Any fetch error that the fetcher itself did not retry
/// aborts the batch.
pub struct BatchScheduler<F> {
    fetcher: Arc<F>,
    admission: Arc<Semaphore>,
    config: SchedulerConfig,
    telemetry: BatchTelemetry,
}

impl<F: RangeFetch + 'static> BatchScheduler<F> {
    pub fn new(fetcher: Arc<F>, config: SchedulerConfig) -> Self {
        Self {
            fetcher,
            admission: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
            telemetry: BatchTelemetry::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Fetches the next batch; `Ok(None)` once the stream is exhausted.
    pub async fn next_batch<I>(
        &mut self,
        candidates: &mut I,
    ) -> Result<Option<Vec<FetchedSegment>>, SchedulerError>
    where
        I: Iterator<Item = Result<CandidateRecord, CdxError>>,
    {
        let batch = candidates
            .by_ref()
            .take(self.config.batch_size.max(1))
            .collect::<Result<Vec<_>, _>>()?;
        if batch.is_empty() {
            return Ok(None);
        }

        let mut tasks = JoinSet::new();
        for candidate in batch {
            let permit = self.admission.clone().acquire_owned().await?;
            let fetcher = self.fetcher.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let bytes = fetcher
                    .fetch_range(&candidate.filename, candidate.offset, candidate.length)
                    .await?;
                Ok::<_, FetchError>(FetchedSegment {
                    url: candidate.url,
                    bytes,
                })
            });
        }

        let mut segments = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            segments.push(joined??);
        }
        if self.config.sort_by_url {
            segments.sort_by(|a, b| a.url.cmp(&b.url));
        }

        self.telemetry.record(&segments);
        Ok(Some(segments))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct CountingFetcher {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RangeFetch for CountingFetcher {
        async fn fetch_range(
            &self,
            object: &str,
            offset: u64,
            _length: u64,
        ) -> Result<Bytes, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            // later candidates finish first
            tokio::time::sleep(Duration::from_millis(100 - offset)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if object == "permanent" {
                return Err(FetchError::Status {
                    url: object.to_string(),
                    status: 403,
                });
            }
            Ok(Bytes::from(format!("{object}:{offset}")))
        }
    }

    fn candidate(i: u64) -> Result<CandidateRecord, CdxError> {
        Ok(CandidateRecord {
            filename: "segment".to_string(),
            offset: i,
            length: 10,
            mime: "text/html".to_string(),
            status: "200".to_string(),
            url: format!("https://example.com/{i:02}"),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn batches_respect_size_and_concurrency() {
        let fetcher = Arc::new(CountingFetcher::default());
        let config = SchedulerConfig {
            concurrency: 3,
            batch_size: 10,
            sort_by_url: true,
        };
        let mut scheduler = BatchScheduler::new(fetcher.clone(), config);
        let mut stream = (0..25).map(candidate);

        let mut sizes = vec![];
        while let Some(batch) = scheduler.next_batch(&mut stream).await.unwrap() {
            let urls: Vec<_> = batch.iter().map(|s| s.url.clone()).collect();
            let mut sorted = urls.clone();
            sorted.sort();
            assert_eq!(urls, sorted);
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 25);
        assert!(fetcher.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unsorted_batches_keep_arrival_order() {
        let fetcher = Arc::new(CountingFetcher::default());
        let config = SchedulerConfig {
            concurrency: 10,
            batch_size: 5,
            sort_by_url: false,
        };
        let mut scheduler = BatchScheduler::new(fetcher, config);
        let mut stream = (0..5).map(candidate);
        let batch = scheduler.next_batch(&mut stream).await.unwrap().unwrap();
        let offsets: Vec<_> = batch
            .iter()
            .map(|s| String::from_utf8_lossy(&s.bytes).into_owned())
            .collect();
        assert_eq!(
            offsets,
            vec!["segment:4", "segment:3", "segment:2", "segment:1", "segment:0"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_aborts_the_batch() {
        let fetcher = Arc::new(CountingFetcher::default());
        let mut scheduler = BatchScheduler::new(fetcher, SchedulerConfig::default());
        let mut stream = vec![
            candidate(1),
            Ok(CandidateRecord {
                filename: "permanent".to_string(),
                ..candidate(2).unwrap()
            }),
        ]
        .into_iter();
        let result = scheduler.next_batch(&mut stream).await;
        assert!(matches!(result, Err(SchedulerError::Fetch(FetchError::Status { status: 403, .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_reports_per_batch_time_and_size() {
        let segment = |len: usize| FetchedSegment {
            url: "https://example.com/".to_string(),
            bytes: Bytes::from(vec![0u8; len]),
        };
        let mut telemetry = BatchTelemetry::new();

        tokio::time::advance(Duration::from_secs(2)).await;
        let first = telemetry.record(&[segment(1 << 20), segment(1 << 20)]);
        assert_eq!(first.batch, 0);
        assert_eq!(first.urls_downloaded, 2);
        assert_eq!(first.elapsed_s, 2.0);
        assert_eq!(first.batch_mb, 2.0);
        assert_eq!(first.rate_mb_s, 1.0);

        tokio::time::advance(Duration::from_secs(4)).await;
        let second = telemetry.record(&[segment(1 << 19)]);
        assert_eq!(second.batch, 1);
        assert_eq!(second.elapsed_s, 4.0);
        assert_eq!(second.batch_mb, 0.5);
        assert_eq!(second.mb_downloaded, 2.5);
    }

    #[tokio::test]
    async fn empty_stream_terminates() {
        let fetcher = Arc::new(CountingFetcher::default());
        let mut scheduler = BatchScheduler::new(fetcher, SchedulerConfig::default());
        let mut stream = std::iter::empty();
        assert!(scheduler.next_batch(&mut stream).await.unwrap().is_none());
    }
}
