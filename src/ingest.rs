//! Batched, transactional loading of decoded records.
//!
//! Records accumulate in an [IngestBatch]. A full batch (or the remainder at the end
//! of a source) is turned into rows and committed together with the ledger advance.
//! Conflicting transactions are retried from scratch with jittered backoff until they
//! succeed.
use chrono::{DateTime, Utc};

use crate::backoff::RetryPolicy;
use crate::lexical::{context_vectors, lemmatize, EmbeddingSet, EmbeddingTable};
use crate::metadata::{extract_or_exception, MetadataDocument, MetadataExtractor};
use crate::segment::ArchiveRecord;
use crate::store::{
    BatchRows, ContextVectorRow, IngestStore, MetaRow, SourceProgress, StoreError, ViewRow,
};
use crate::surt::{canonical_host_key, canonical_hostpath_key};

/// Neighbouring positions on each side that contribute to a context vector.
pub const CONTEXT_WINDOW: usize = 2;

#[derive(Debug)]
pub struct BatchEntry {
    pub accessed_at: DateTime<Utc>,
    pub url: String,
    pub metadata: MetadataDocument,
}

/// Records waiting for the next flush.
///
/// `attempted` counts every candidate handed to the ingester, including records
/// that were dropped, so the ledger advances by candidates consumed.
#[derive(Debug, Default)]
pub struct IngestBatch {
    pub entries: Vec<BatchEntry>,
    pub attempted: u64,
}

impl IngestBatch {
    pub fn is_empty(&self) -> bool {
        self.attempted == 0
    }
}

/// The searchable view of an article, or `None` for anything that is not one.
pub fn view_row(url: &str, doc: &MetadataDocument) -> Option<ViewRow> {
    let language: String = doc.best_string("language")?.chars().take(2).collect();
    if language.is_empty() {
        return None;
    }
    let published_at = doc.best_timestamp_lo()?;
    let title = doc.best_string("title")?;
    let description = doc.best_string("description")?;
    let content = doc.best_content_html()?;
    let text = doc.best_content_text()?;
    Some(ViewRow {
        host_key: canonical_host_key(url).ok()?,
        hostpath_key: canonical_hostpath_key(url).ok()?,
        title_tokens: lemmatize(&language, title),
        content_tokens: lemmatize(&language, text),
        language,
        published_at,
        title: title.to_string(),
        description: description.to_string(),
        content: content.to_string(),
    })
}

pub fn context_vector_rows(view: &ViewRow, embeddings: &EmbeddingTable) -> Vec<ContextVectorRow> {
    context_vectors(embeddings, &view.content_tokens, CONTEXT_WINDOW)
        .into_iter()
        .map(|cv| ContextVectorRow {
            host_key: view.host_key.clone(),
            hostpath_key: view.hostpath_key.clone(),
            published_at: view.published_at,
            context: cv.vector,
            weight: 1.0,
            focus: cv.focus,
            language: view.language.clone(),
        })
        .collect()
}

/// Builds every row a batch writes. Entries without article fields still get a
/// [MetaRow]; views get context vectors only when their language has a table.
pub fn derive_rows(batch: IngestBatch, embeddings: Option<&EmbeddingSet>) -> BatchRows {
    let mut rows = BatchRows {
        attempted: batch.attempted,
        ..BatchRows::default()
    };
    for entry in batch.entries {
        match view_row(&entry.url, &entry.metadata) {
            Some(view) => {
                if let Some(table) = embeddings.and_then(|set| set.get(&view.language)) {
                    rows.context_vectors
                        .extend(context_vector_rows(&view, table));
                }
                rows.views.push(view);
            }
            None => tracing::debug!(url = %entry.url, "no article fields"),
        }
        rows.meta.push(MetaRow {
            accessed_at: entry.accessed_at,
            url: entry.url,
            metadata: entry.metadata.into_json(),
        });
    }
    rows
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub attempted: u64,
    pub rows: u64,
    pub batches: u64,
    pub urls_inserted: i64,
}

/// Loads one source's records into an [IngestStore].
pub struct Ingester<'a, S: IngestStore> {
    store: &'a mut S,
    source_id: i64,
    batch_size: u64,
    extractor: &'a dyn MetadataExtractor,
    embeddings: Option<&'a EmbeddingSet>,
    policy: RetryPolicy,
    batch: IngestBatch,
    summary: IngestSummary,
}

impl<'a, S: IngestStore> Ingester<'a, S> {
    pub fn new(
        store: &'a mut S,
        source: &SourceProgress,
        batch_size: usize,
        extractor: &'a dyn MetadataExtractor,
        embeddings: Option<&'a EmbeddingSet>,
    ) -> Self {
        Self {
            store,
            source_id: source.id,
            batch_size: batch_size.max(1) as u64,
            extractor,
            embeddings,
            policy: RetryPolicy::flush(),
            batch: IngestBatch::default(),
            summary: IngestSummary {
                urls_inserted: source.urls_inserted,
                ..IngestSummary::default()
            },
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn urls_inserted(&self) -> i64 {
        self.summary.urls_inserted
    }

    /// Adds a decoded record, flushing when the batch is full.
    ///
    /// Records missing a URL, capture date or body are dropped but still counted.
    pub async fn push(&mut self, record: ArchiveRecord) -> Result<(), StoreError> {
        match record.into_capture() {
            Ok(capture) => {
                tracing::debug!(url = %capture.url, "processing url");
                let metadata = extract_or_exception(self.extractor, &capture.html, &capture.url);
                self.batch.entries.push(BatchEntry {
                    accessed_at: capture.accessed_at,
                    url: capture.url,
                    metadata,
                });
            }
            Err(e) => tracing::error!(error = %e, "dropping invalid record"),
        }
        self.count_attempt().await
    }

    /// Accounts for a candidate that produced no record (corrupt or filtered out).
    pub async fn push_skipped(&mut self) -> Result<(), StoreError> {
        self.count_attempt().await
    }

    async fn count_attempt(&mut self) -> Result<(), StoreError> {
        self.batch.attempted += 1;
        if self.batch.attempted >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        let batch = std::mem::take(&mut self.batch);
        if batch.is_empty() {
            return Ok(());
        }
        let rows = derive_rows(batch, self.embeddings);
        let urls_inserted = self.commit(&rows).await?;
        self.summary.attempted += rows.attempted;
        self.summary.rows += rows.meta.len() as u64;
        self.summary.batches += 1;
        self.summary.urls_inserted = urls_inserted;
        Ok(())
    }

    async fn commit(&mut self, rows: &BatchRows) -> Result<i64, StoreError> {
        let mut failures = 0u32;
        loop {
            match self.store.commit_batch(self.source_id, rows).await {
                Ok(urls_inserted) => return Ok(urls_inserted),
                Err(e) if e.is_conflict() && !self.policy_exhausted(failures + 1) => {
                    let sleep_time = self.policy.delay(failures);
                    failures += 1;
                    tracing::warn!(
                        source_id = self.source_id,
                        failures,
                        error = %e,
                        sleep_secs = sleep_time.as_secs_f64(),
                        "batch commit conflicted, retrying"
                    );
                    tokio::time::sleep(sleep_time).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn policy_exhausted(&self, failures: u32) -> bool {
        self.policy.max_attempts().is_some_and(|max| failures >= max)
    }

    /// Flushes the remainder and marks the source finished.
    pub async fn finish(mut self) -> Result<IngestSummary, StoreError> {
        self.flush().await?;
        self.store.finish_source(self.source_id).await?;
        tracing::info!(
            source_id = self.source_id,
            attempted = self.summary.attempted,
            rows = self.summary.rows,
            batches = self.summary.batches,
            urls_inserted = self.summary.urls_inserted,
            "source finished"
        );
        Ok(self.summary)
    }
}
