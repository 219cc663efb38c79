//! Writes fetched segments to a local `.warc.gz` file.
//!
//! Segments are already gzip members, so appending them back to back yields a valid
//! multi-member WARC file that [crate::pipeline::load_warc_file] can read later.
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("archive {0} already exists; pass --force to overwrite it")]
    Exists(PathBuf),
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to open archive {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write archive {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// `{key}-{crawl}-{worker:04}-of-{num_workers:04}.warc.gz`
pub fn archive_file_name(key: &str, crawl: Option<&str>, worker: u32, num_workers: u32) -> String {
    let crawl = crawl.unwrap_or("all");
    format!("{key}-{crawl}-{worker:04}-of-{num_workers:04}.warc.gz")
}

fn create_parent(path: &Path) -> Result<(), SinkError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|source| SinkError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

pub struct ArchiveSink {
    path: PathBuf,
    file: File,
    segments: u64,
    bytes: u64,
}

impl ArchiveSink {
    /// Opens `path` for writing, creating its parent directory.
    ///
    /// Without `force` an existing file is an error; with it the file is truncated.
    pub fn create(path: &Path, force: bool) -> Result<Self, SinkError> {
        create_parent(path)?;
        let mut options = OpenOptions::new();
        options.write(true);
        if force {
            if path.exists() {
                tracing::warn!(path = %path.display(), "archive exists, truncating");
            }
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::AlreadyExists {
                SinkError::Exists(path.to_path_buf())
            } else {
                SinkError::Open {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Ok(Self::from_file(path, file))
    }

    /// Opens `path` for appending, creating it if missing. Used when resuming a
    /// source whose earlier run already wrote part of the archive.
    pub fn append(path: &Path) -> Result<Self, SinkError> {
        create_parent(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| SinkError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::info!(path = %path.display(), "appending to existing archive");
        Ok(Self::from_file(path, file))
    }

    fn from_file(path: &Path, file: File) -> Self {
        Self {
            path: path.to_path_buf(),
            file,
            segments: 0,
            bytes: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn segments_written(&self) -> u64 {
        self.segments
    }

    /// Appends one segment and flushes it to disk.
    pub fn write_segment(&mut self, segment: &[u8]) -> Result<(), SinkError> {
        self.file
            .write_all(segment)
            .and_then(|_| self.file.flush())
            .map_err(|source| SinkError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.segments += 1;
        self.bytes += segment.len() as u64;
        Ok(())
    }
}

impl Drop for ArchiveSink {
    fn drop(&mut self) {
        tracing::debug!(
            path = %self.path.display(),
            segments = self.segments,
            bytes = self.bytes,
            "closed archive"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_deterministic_per_shard() {
        assert_eq!(
            archive_file_name("com,example)", Some("CC-MAIN-2024-30"), 3, 16),
            "com,example)-CC-MAIN-2024-30-0003-of-0016.warc.gz"
        );
        assert_eq!(
            archive_file_name("com,example)", None, 0, 1),
            "com,example)-all-0000-of-0001.warc.gz"
        );
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.warc.gz");

        let mut sink = ArchiveSink::create(&path, false).unwrap();
        sink.write_segment(b"abc").unwrap();
        sink.write_segment(b"def").unwrap();
        assert_eq!(sink.segments_written(), 2);
        drop(sink);
        assert_eq!(fs::read(&path).unwrap(), b"abcdef");

        assert!(matches!(
            ArchiveSink::create(&path, false),
            Err(SinkError::Exists(_))
        ));

        let mut sink = ArchiveSink::create(&path, true).unwrap();
        sink.write_segment(b"xyz").unwrap();
        drop(sink);
        assert_eq!(fs::read(&path).unwrap(), b"xyz");
    }

    #[test]
    fn append_keeps_earlier_segments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.warc.gz");

        let mut sink = ArchiveSink::append(&path).unwrap();
        sink.write_segment(b"abc").unwrap();
        drop(sink);
        let mut sink = ArchiveSink::append(&path).unwrap();
        sink.write_segment(b"def").unwrap();
        assert_eq!(sink.segments_written(), 1);
        drop(sink);
        assert_eq!(fs::read(&path).unwrap(), b"abcdef");
    }
}
