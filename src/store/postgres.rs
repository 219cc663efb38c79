use async_trait::async_trait;
use autometrics::autometrics;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Transaction};

use super::{BatchRows, IngestStore, SourceProgress, StoreError};

const SCHEMA: &str = "
CREATE EXTENSION IF NOT EXISTS vector;

CREATE TABLE IF NOT EXISTS source (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    urls_inserted BIGINT NOT NULL DEFAULT 0,
    finished_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS metahtml (
    id BIGSERIAL PRIMARY KEY,
    accessed_at TIMESTAMPTZ NOT NULL,
    source_id BIGINT NOT NULL REFERENCES source(id),
    url TEXT NOT NULL,
    metadata JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS metahtml_view (
    id BIGSERIAL PRIMARY KEY,
    host_key TEXT NOT NULL,
    hostpath_key TEXT NOT NULL,
    language TEXT NOT NULL,
    published_at TIMESTAMPTZ NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    content TEXT NOT NULL,
    title_tokens TSVECTOR NOT NULL,
    content_tokens TSVECTOR NOT NULL
);

CREATE TABLE IF NOT EXISTS contextvector (
    id BIGSERIAL PRIMARY KEY,
    host_key TEXT NOT NULL,
    hostpath_key TEXT NOT NULL,
    published_at TIMESTAMPTZ NOT NULL,
    context VECTOR NOT NULL,
    weight REAL NOT NULL,
    focus TEXT NOT NULL,
    language TEXT NOT NULL
);
";

const INSERT_META: &str =
    "INSERT INTO metahtml (accessed_at, source_id, url, metadata) VALUES ($1, $2, $3, $4)";
const INSERT_VIEW: &str = "INSERT INTO metahtml_view \
    (host_key, hostpath_key, language, published_at, title, description, content, title_tokens, content_tokens) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8::text::tsvector, $9::text::tsvector)";
const INSERT_CONTEXT_VECTOR: &str = "INSERT INTO contextvector \
    (host_key, hostpath_key, published_at, context, weight, focus, language) \
    VALUES ($1, $2, $3, $4, $5, $6, $7)";

/// [IngestStore] backed by one Postgres connection, created once per run.
pub struct PgStore {
    client: Client,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "postgres connection error");
            }
        });
        Ok(Self { client })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.client.batch_execute(SCHEMA).await?;
        Ok(())
    }

    async fn select_source(&self, name: &str) -> Result<SourceProgress, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT id, urls_inserted, finished_at FROM source WHERE name = $1",
                &[&name],
            )
            .await?;
        Ok(SourceProgress {
            id: row.get(0),
            urls_inserted: row.get(1),
            finished_at: row.get::<_, Option<DateTime<Utc>>>(2),
        })
    }

    #[autometrics]
    async fn commit_rows(&mut self, source_id: i64, rows: &BatchRows) -> Result<i64, StoreError> {
        let tx = self.client.transaction().await?;
        let urls_inserted = advance(&tx, source_id, rows.attempted as i64).await?;
        tracing::info!(
            source_id,
            urls_inserted,
            attempted = rows.attempted,
            meta = rows.meta.len(),
            views = rows.views.len(),
            context_vectors = rows.context_vectors.len(),
            "committing batch"
        );

        if !rows.meta.is_empty() {
            let statement = tx.prepare(INSERT_META).await?;
            for row in &rows.meta {
                tx.execute(
                    &statement,
                    &[&row.accessed_at, &source_id, &row.url, &row.metadata],
                )
                .await?;
            }
        }
        if !rows.views.is_empty() {
            let statement = tx.prepare(INSERT_VIEW).await?;
            for row in &rows.views {
                tx.execute(
                    &statement,
                    &[
                        &row.host_key,
                        &row.hostpath_key,
                        &row.language,
                        &row.published_at,
                        &row.title,
                        &row.description,
                        &row.content,
                        &row.title_tokens,
                        &row.content_tokens,
                    ],
                )
                .await?;
            }
        }
        if !rows.context_vectors.is_empty() {
            let statement = tx.prepare(INSERT_CONTEXT_VECTOR).await?;
            for row in &rows.context_vectors {
                let context = Vector::from(row.context.clone());
                tx.execute(
                    &statement,
                    &[
                        &row.host_key,
                        &row.hostpath_key,
                        &row.published_at,
                        &context,
                        &row.weight,
                        &row.focus,
                        &row.language,
                    ],
                )
                .await?;
            }
        }

        tx.commit().await?;
        Ok(urls_inserted)
    }
}

/// Locks the ledger row and adds `delta` to `urls_inserted` inside `tx`.
async fn advance(tx: &Transaction<'_>, source_id: i64, delta: i64) -> Result<i64, StoreError> {
    let row = tx
        .query_opt(
            "SELECT urls_inserted FROM source WHERE id = $1 FOR UPDATE",
            &[&source_id],
        )
        .await?
        .ok_or(StoreError::MissingSource(source_id))?;
    let urls_inserted: i64 = row.get(0);
    let updated = urls_inserted + delta;
    tx.execute(
        "UPDATE source SET urls_inserted = $2 WHERE id = $1",
        &[&source_id, &updated],
    )
    .await?;
    Ok(updated)
}

#[async_trait]
impl IngestStore for PgStore {
    async fn get_or_create_source(&mut self, name: &str) -> Result<SourceProgress, StoreError> {
        let inserted = self
            .client
            .query_one("INSERT INTO source (name) VALUES ($1) RETURNING id", &[&name])
            .await;
        let progress = match inserted {
            Ok(row) => SourceProgress {
                id: row.get(0),
                urls_inserted: 0,
                finished_at: None,
            },
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                tracing::debug!(name, "source exists");
                self.select_source(name).await?
            }
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(name, source_id = progress.id, "resolved source");
        Ok(progress)
    }

    async fn commit_batch(&mut self, source_id: i64, rows: &BatchRows) -> Result<i64, StoreError> {
        self.commit_rows(source_id, rows).await
    }

    async fn finish_source(&mut self, source_id: i64) -> Result<(), StoreError> {
        self.client
            .execute(
                "UPDATE source SET finished_at = now() WHERE id = $1",
                &[&source_id],
            )
            .await?;
        Ok(())
    }
}
