//! Durable destination of ingested rows and the per-source progress ledger.
//!
//! The ledger has one row per source name. Its `urls_inserted` counter only moves
//! inside the transaction that commits the matching batch of rows, so after a crash
//! the counter says exactly how many candidates are already accounted for.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::error::SqlState;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceProgress {
    pub id: i64,
    pub urls_inserted: i64,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SourceProgress {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Raw metadata for one capture (`metahtml`).
#[derive(Debug, Clone, PartialEq)]
pub struct MetaRow {
    pub accessed_at: DateTime<Utc>,
    pub url: String,
    pub metadata: serde_json::Value,
}

/// Searchable article view (`metahtml_view`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewRow {
    pub host_key: String,
    pub hostpath_key: String,
    pub language: String,
    pub published_at: DateTime<Utc>,
    pub title: String,
    pub description: String,
    pub content: String,
    pub title_tokens: String,
    pub content_tokens: String,
}

/// One focus token's context vector (`contextvector`).
#[derive(Debug, Clone, PartialEq)]
pub struct ContextVectorRow {
    pub host_key: String,
    pub hostpath_key: String,
    pub published_at: DateTime<Utc>,
    pub context: Vec<f32>,
    pub weight: f32,
    pub focus: String,
    pub language: String,
}

/// Everything one flush writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchRows {
    /// Candidates accounted for by this batch, including dropped ones.
    pub attempted: u64,
    pub meta: Vec<MetaRow>,
    pub views: Vec<ViewRow>,
    pub context_vectors: Vec<ContextVectorRow>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    #[error("source {0} does not exist")]
    MissingSource(i64),
    #[error("write conflict")]
    Conflict,
    #[error("connection lost")]
    Disconnected,
}

impl StoreError {
    /// Deadlocks, serialization failures and internal errors abort the transaction
    /// but succeed when the whole batch is retried.
    pub fn is_conflict(&self) -> bool {
        match self {
            StoreError::Db(e) => e.code().is_some_and(|code| {
                *code == SqlState::T_R_DEADLOCK_DETECTED
                    || *code == SqlState::T_R_SERIALIZATION_FAILURE
                    || *code == SqlState::INTERNAL_ERROR
            }),
            StoreError::Conflict => true,
            StoreError::MissingSource(_) | StoreError::Disconnected => false,
        }
    }
}

#[async_trait]
pub trait IngestStore: Send {
    /// Inserts a ledger row for `name`, or returns the existing one if another run
    /// (possibly a concurrent one) created it first.
    async fn get_or_create_source(&mut self, name: &str) -> Result<SourceProgress, StoreError>;

    /// Atomically advances the ledger by `rows.attempted` and appends all rows.
    /// Returns the new `urls_inserted`.
    async fn commit_batch(&mut self, source_id: i64, rows: &BatchRows) -> Result<i64, StoreError>;

    async fn finish_source(&mut self, source_id: i64) -> Result<(), StoreError>;
}
