//! Byte-range downloads of archive segments from the Common Crawl bucket.
//!
//! A CDX entry points at `length` bytes starting at `offset` inside a large WARC file.
//! Only that slice is requested, using an HTTP `Range` header.
use std::time::Duration;

use async_trait::async_trait;
use autometrics::autometrics;
use bytes::Bytes;

use crate::backoff::{retry, RetryPolicy};

pub const DEFAULT_BASE_URL: &str = "https://data.commoncrawl.org/";
const USER_AGENT: &str = concat!("cc-ingest/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("unexpected status {status} fetching {url}")]
    Status { url: String, status: u16 },
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
}

impl FetchError {
    /// Connection failures and timeouts are retried forever; everything else aborts the run.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Connect { .. } | FetchError::Timeout { .. })
    }

    pub fn classify(url: &str, error: reqwest::Error) -> Self {
        let url = url.to_string();
        if error.is_timeout() {
            FetchError::Timeout { url }
        } else if error.is_connect() {
            FetchError::Connect {
                url,
                message: error.to_string(),
            }
        } else {
            FetchError::Request {
                url,
                message: error.to_string(),
            }
        }
    }
}

/// Value of the `Range` header for `length` bytes starting at `offset` (inclusive end).
pub fn range_header(offset: u64, length: u64) -> String {
    format!("bytes={}-{}", offset, offset + length.saturating_sub(1))
}

/// Source of raw archive-segment bytes.
#[async_trait]
pub trait RangeFetch: Send + Sync {
    /// Returns exactly `length` bytes of `object` starting at `offset`.
    async fn fetch_range(&self, object: &str, offset: u64, length: u64)
        -> Result<Bytes, FetchError>;
}

/// [RangeFetch] over HTTP with unbounded exponential backoff on transient failures.
#[derive(Debug, Clone)]
pub struct HttpRangeFetcher {
    client: reqwest::Client,
    base_url: String,
    policy: RetryPolicy,
}

impl HttpRangeFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::classify(base_url, e))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        let base_url = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        Self {
            client,
            base_url,
            policy: RetryPolicy::fetch(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn object_url(&self, object: &str) -> String {
        format!("{}{}", self.base_url, object.trim_start_matches('/'))
    }

    #[autometrics]
    async fn fetch_range_once(&self, url: &str, offset: u64, length: u64) -> Result<Bytes, FetchError> {
        let res = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, range_header(offset, length))
            .send()
            .await
            .map_err(|e| FetchError::classify(url, e))?;
        match res.status() {
            reqwest::StatusCode::PARTIAL_CONTENT => {
                let body = res.bytes().await.map_err(|e| FetchError::classify(url, e))?;
                tracing::debug!(url, offset, length, received = body.len(), "fetched range");
                Ok(body)
            }
            status => Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

#[async_trait]
impl RangeFetch for HttpRangeFetcher {
    async fn fetch_range(
        &self,
        object: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, FetchError> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let url = self.object_url(object);
        let url = url.as_str();
        retry(&self.policy, url, FetchError::is_transient, move || {
            self.fetch_range_once(url, offset, length)
        })
        .await
    }
}
