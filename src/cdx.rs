//! Reading and filtering of gzipped CDX index files.
//!
//! Every line in a CDX file looks like this (split over several lines for readability):
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
//! The first field is the SURT key, the second the capture timestamp and the rest is JSON.
//! [CdxStream] turns a list of such files into a lazy sequence of [CandidateRecord]s,
//! dropping lines that fail the configured filters and counting why.
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use serde_aux::prelude::deserialize_number_from_string;

use crate::surt::canonical_hostpath_key;

/// Only the first few malformed lines of a run are logged individually.
const MALFORMED_LINES_LOGGED: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum CdxError {
    #[error("failed to open CDX file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read CDX file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed CDX line: {0}")]
    Malformed(String),
}

/// The JSON part of a CDX line.
#[derive(Debug, Deserialize, Serialize)]
pub struct CdxMetadata {
    pub url: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub length: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub offset: u64,
    pub filename: String,
    #[serde(default)]
    pub languages: Option<String>,
}

/// Represents a line in a cdx index file.
#[derive(Debug, Deserialize, Serialize)]
pub struct CdxEntry {
    pub surt_url: String,
    pub timestamp: String,
    pub metadata: CdxMetadata,
}

/// Splits off the SURT key and timestamp and deserializes the JSON remainder.
pub fn parse_cdx_line(line: &str) -> Result<CdxEntry, CdxError> {
    let mut parts = line.splitn(3, ' ');
    let (Some(surt_url), Some(timestamp), Some(json)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(CdxError::Malformed(format!(
            "expected three space separated fields in {line:?}"
        )));
    };
    let metadata = serde_json::from_str(json).map_err(|e| CdxError::Malformed(e.to_string()))?;
    Ok(CdxEntry {
        surt_url: surt_url.to_string(),
        timestamp: timestamp.to_string(),
        metadata,
    })
}

/// One archive segment selected for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRecord {
    /// Object key relative to the crawl bucket.
    pub filename: String,
    pub offset: u64,
    pub length: u64,
    pub mime: String,
    pub status: String,
    pub url: String,
}

impl From<CdxMetadata> for CandidateRecord {
    fn from(meta: CdxMetadata) -> Self {
        Self {
            filename: meta.filename,
            offset: meta.offset,
            length: meta.length,
            mime: meta.mime.unwrap_or_default(),
            status: meta.status.unwrap_or_default(),
            url: meta.url,
        }
    }
}

/// Which filters [CdxStream] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdxFilters {
    pub filter_mime: bool,
    pub filter_status: bool,
    pub filter_duplicates: bool,
    pub max_candidates: Option<u64>,
}

impl Default for CdxFilters {
    fn default() -> Self {
        Self {
            filter_mime: true,
            filter_status: true,
            filter_duplicates: true,
            max_candidates: None,
        }
    }
}

/// Per-reason counters for one pass over the CDX files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub accepted: u64,
    pub filter_mime: u64,
    pub filter_status: u64,
    /// Duplicate of an earlier line in the same file.
    pub filter_duplicates_cdx: u64,
    /// Duplicate of a line in a previously read file.
    pub filter_duplicates_all: u64,
    pub malformed: u64,
}

impl FilterStats {
    pub fn total(&self) -> u64 {
        self.accepted
            + self.filter_mime
            + self.filter_status
            + self.filter_duplicates_cdx
            + self.filter_duplicates_all
            + self.malformed
    }

    fn entries(&self) -> [(&'static str, u64); 6] {
        [
            ("filter_duplicates_all", self.filter_duplicates_all),
            ("filter_duplicates_cdx", self.filter_duplicates_cdx),
            ("filter_mime", self.filter_mime),
            ("filter_status", self.filter_status),
            ("malformed", self.malformed),
            ("no_filter", self.accepted),
        ]
    }

    /// Logs one line per reason with its share of all lines seen.
    pub fn log_summary(&self) {
        let total = self.total();
        for (reason, count) in self.entries() {
            let percent = if total == 0 {
                0.0
            } else {
                100.0 * count as f64 / total as f64
            };
            tracing::info!(reason, count, percent = %format!("{percent:.2}"), "cdx filter summary");
        }
    }
}

impl fmt::Display for FilterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .entries()
            .iter()
            .map(|(reason, count)| format!("{reason}={count}"))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

type CdxLines = Lines<BufReader<MultiGzDecoder<File>>>;

struct OpenFile {
    path: PathBuf,
    lines: CdxLines,
    hostpaths: HashSet<String>,
}

/// Lazy, single-pass iterator over the accepted candidates of several CDX files.
///
/// Files are read in the given order and lines in file order. When duplicate
/// filtering is on, a canonical host+path key seen earlier in the same file or in any
/// earlier file rejects the line, so earlier files win.
pub struct CdxStream {
    pending: VecDeque<PathBuf>,
    current: Option<OpenFile>,
    hostpaths_all: HashSet<String>,
    filters: CdxFilters,
    stats: FilterStats,
    finished: bool,
}

impl CdxStream {
    pub fn new<P: AsRef<Path>>(paths: &[P], filters: CdxFilters) -> Self {
        Self {
            pending: paths.iter().map(|p| p.as_ref().to_path_buf()).collect(),
            current: None,
            hostpaths_all: HashSet::new(),
            filters,
            stats: FilterStats::default(),
            finished: false,
        }
    }

    /// Counters so far; final once the iterator has returned `None`.
    pub fn stats(&self) -> &FilterStats {
        &self.stats
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.current = None;
            self.stats.log_summary();
        }
    }

    fn limit_reached(&self) -> bool {
        self.filters
            .max_candidates
            .is_some_and(|max| self.stats.accepted >= max)
    }

    fn open_next(&mut self) -> Result<bool, CdxError> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(false);
        };
        tracing::info!(cdxfile = %path.display(), "reading cdx file");
        let file = File::open(&path).map_err(|source| CdxError::Open {
            path: path.clone(),
            source,
        })?;
        self.current = Some(OpenFile {
            lines: BufReader::new(MultiGzDecoder::new(file)).lines(),
            path,
            hostpaths: HashSet::new(),
        });
        Ok(true)
    }

    /// Applies the filters to one line; `None` means rejected.
    fn accept_line(&mut self, line: &str) -> Option<CandidateRecord> {
        let entry = match parse_cdx_line(line) {
            Ok(entry) => entry,
            Err(e) => {
                self.stats.malformed += 1;
                if self.stats.malformed <= MALFORMED_LINES_LOGGED {
                    tracing::warn!(error = %e, "skipping malformed cdx line");
                }
                return None;
            }
        };
        let meta = entry.metadata;

        if self.filters.filter_mime && meta.mime.as_deref() != Some("text/html") {
            self.stats.filter_mime += 1;
            return None;
        }
        if self.filters.filter_status && meta.status.as_deref() != Some("200") {
            self.stats.filter_status += 1;
            return None;
        }
        if self.filters.filter_duplicates {
            let hostpath = match canonical_hostpath_key(&meta.url) {
                Ok(key) => key,
                Err(e) => {
                    self.stats.malformed += 1;
                    tracing::debug!(error = %e, "skipping cdx line with malformed url");
                    return None;
                }
            };
            let file = self.current.as_mut()?;
            if file.hostpaths.contains(&hostpath) {
                self.stats.filter_duplicates_cdx += 1;
                return None;
            }
            if self.hostpaths_all.contains(&hostpath) {
                self.stats.filter_duplicates_all += 1;
                return None;
            }
            file.hostpaths.insert(hostpath.clone());
            self.hostpaths_all.insert(hostpath);
        }

        self.stats.accepted += 1;
        Some(CandidateRecord::from(meta))
    }
}

impl Iterator for CdxStream {
    type Item = Result<CandidateRecord, CdxError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.limit_reached() {
                tracing::info!(
                    accepted = self.stats.accepted,
                    "stopped cdx stream after reaching max candidates"
                );
                self.finish();
                return None;
            }

            let Some(file) = self.current.as_mut() else {
                match self.open_next() {
                    Ok(true) => continue,
                    Ok(false) => {
                        self.finish();
                        return None;
                    }
                    Err(e) => {
                        self.finish();
                        return Some(Err(e));
                    }
                }
            };

            match file.lines.next() {
                None => self.current = None,
                Some(Err(source)) => {
                    let path = file.path.clone();
                    self.finish();
                    return Some(Err(CdxError::Read { path, source }));
                }
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Some(candidate) = self.accept_line(&line) {
                        return Some(Ok(candidate));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_parse_cdx_line_with_numeric_strings() {
        let line = r#"0,100,59,139)/ 20240723213521 {"url": "https://139.59.100.0/", "mime": "text/html", "mime-detected": "text/html", "status": "200", "digest": "5JOQMMSNM6N7UCLGGYXDSPSB3FYAQS2C", "length": "16650", "offset": "64016172", "filename": "crawl-data/CC-MAIN-2024-30/segments/1720763518115.82/warc/CC-MAIN-20240723194208-20240723224208-00279.warc.gz", "charset": "UTF-8", "languages": "ind,eng"}"#;
        let entry = parse_cdx_line(line).unwrap();
        assert_eq!(entry.surt_url, "0,100,59,139)/");
        assert_eq!(entry.timestamp, "20240723213521");
        assert_eq!(entry.metadata.length, 16650);
        assert_eq!(entry.metadata.offset, 64016172);
        assert_eq!(entry.metadata.status.as_deref(), Some("200"));
        assert_eq!(entry.metadata.languages.as_deref(), Some("ind,eng"));
    }

    #[test]
    fn rejects_lines_without_json() {
        assert!(matches!(
            parse_cdx_line("com,example)/ 20240101000000"),
            Err(CdxError::Malformed(_))
        ));
        assert!(matches!(
            parse_cdx_line("com,example)/ 20240101000000 {not json"),
            Err(CdxError::Malformed(_))
        ));
    }

    #[test]
    fn stats_display_lists_every_reason() {
        let stats = FilterStats {
            accepted: 3,
            filter_mime: 1,
            ..FilterStats::default()
        };
        assert_eq!(stats.total(), 4);
        let text = stats.to_string();
        assert!(text.contains("no_filter=3"));
        assert!(text.contains("filter_mime=1"));
        assert!(text.contains("filter_duplicates_cdx=0"));
    }
}
