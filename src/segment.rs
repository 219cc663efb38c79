//! Decoding of downloaded archive segments into [ArchiveRecord]s.
//!
//! Each CDX range is a single gzip member holding one WARC record. Decoding is best
//! effort: a blob that does not gunzip or does not parse as WARC is logged and skipped.
use std::io::Read;

use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use warc::{BufferedBody, Record, WarcHeader, WarcReader};

/// A decoded WARC record with its HTTP envelope split off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub record_type: String,
    pub url: Option<String>,
    pub accessed_at: Option<DateTime<Utc>>,
    pub http_status: Option<u16>,
    pub content_type: Option<String>,
    /// Payload after the HTTP headers; the whole block for non-HTTP records.
    pub content: Option<Vec<u8>>,
}

/// The fields every stored record needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub url: String,
    pub accessed_at: DateTime<Utc>,
    pub html: Vec<u8>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MalformedRecord {
    #[error("record has no target URI")]
    MissingUrl,
    #[error("record for {0} has no capture date")]
    MissingTimestamp(String),
    #[error("record for {0} has no content")]
    MissingContent(String),
}

impl ArchiveRecord {
    pub fn from_warc(record: &Record<BufferedBody>) -> Self {
        let header = |name: WarcHeader| record.header(name).map(|v| v.to_string());
        let (http_status, content_type, content) = split_http(record.body());
        Self {
            record_type: header(WarcHeader::WarcType).unwrap_or_default(),
            url: header(WarcHeader::TargetURI),
            accessed_at: header(WarcHeader::Date).and_then(|d| {
                DateTime::parse_from_rfc3339(&d)
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            }),
            http_status,
            content_type,
            content,
        }
    }

    /// A successful HTML (or untyped text) response, as kept by [RecordFilter::Strict].
    pub fn is_html_response(&self) -> bool {
        if self.record_type != "response" {
            return false;
        }
        if !self.http_status.is_some_and(|s| (200..300).contains(&s)) {
            return false;
        }
        match self.content_type.as_deref() {
            None | Some("") => true,
            Some(ct) => ct.contains("html") || ct.contains("text"),
        }
    }

    pub fn into_capture(self) -> Result<Capture, MalformedRecord> {
        let url = self.url.ok_or(MalformedRecord::MissingUrl)?;
        let Some(accessed_at) = self.accessed_at else {
            return Err(MalformedRecord::MissingTimestamp(url));
        };
        let Some(html) = self.content else {
            return Err(MalformedRecord::MissingContent(url));
        };
        Ok(Capture {
            url,
            accessed_at,
            html,
        })
    }
}

/// Splits an `application/http` block into status, content type and payload.
fn split_http(block: &[u8]) -> (Option<u16>, Option<String>, Option<Vec<u8>>) {
    if !block.starts_with(b"HTTP/") {
        return (None, None, Some(block.to_vec()));
    }
    let (head, payload) = match find(block, b"\r\n\r\n") {
        Some(i) => (&block[..i], &block[i + 4..]),
        None => match find(block, b"\n\n") {
            Some(i) => (&block[..i], &block[i + 2..]),
            None => (block, &[][..]),
        },
    };
    let head = String::from_utf8_lossy(head);
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|status_line| status_line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok());
    let content_type = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-type")
            .then(|| value.trim().to_string())
    });
    (status, content_type, Some(payload.to_vec()))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Which decoded records are passed downstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordFilter {
    /// Everything that decodes; the CDX filters already selected HTML 200 captures.
    #[default]
    Relaxed,
    /// Only successful HTML responses.
    Strict,
}

impl RecordFilter {
    pub fn accepts(&self, record: &ArchiveRecord) -> bool {
        match self {
            RecordFilter::Relaxed => true,
            RecordFilter::Strict => record.is_html_response(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub decoded: u64,
    pub corrupt: u64,
    pub filtered: u64,
}

#[derive(Debug, Default)]
pub struct SegmentDecoder {
    filter: RecordFilter,
    stats: DecodeStats,
}

impl SegmentDecoder {
    pub fn new(filter: RecordFilter) -> Self {
        Self {
            filter,
            stats: DecodeStats::default(),
        }
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Gunzips and parses one segment. Corrupt segments and records rejected by the
    /// filter yield `None`; neither is an error.
    pub fn decode(&mut self, url: &str, blob: &[u8]) -> Option<ArchiveRecord> {
        let record = match decode_segment(blob) {
            Ok(record) => record,
            Err(e) => {
                self.stats.corrupt += 1;
                tracing::warn!(url, error = %e, "skipping corrupt segment");
                return None;
            }
        };
        if !self.filter.accepts(&record) {
            self.stats.filtered += 1;
            tracing::debug!(
                url,
                record_type = %record.record_type,
                status = ?record.http_status,
                content_type = ?record.content_type,
                "skipping record"
            );
            return None;
        }
        self.stats.decoded += 1;
        Some(record)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("gzip decoding failed: {0}")]
    Gzip(#[from] std::io::Error),
    #[error("WARC parsing failed: {0}")]
    Warc(#[from] warc::Error),
    #[error("segment holds no WARC record")]
    Empty,
}

/// Decodes the first WARC record of a gzipped segment.
pub fn decode_segment(blob: &[u8]) -> Result<ArchiveRecord, SegmentError> {
    let mut raw = Vec::new();
    MultiGzDecoder::new(blob).read_to_end(&mut raw)?;
    let record = WarcReader::new(raw.as_slice())
        .iter_records()
        .next()
        .ok_or(SegmentError::Empty)??;
    Ok(ArchiveRecord::from_warc(&record))
}
