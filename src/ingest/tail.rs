//! Rotation- and truncation-safe log tailer
//!
//! Polls a growing newline-delimited file and yields each complete, trimmed,
//! non-empty line exactly once. Rotation and truncation are detected from
//! file metadata on every poll, since log rotators either replace the inode
//! or rewrite-and-truncate in place:
//!
//! - inode changed → file replaced, restart from offset 0
//! - size < offset → truncated, restart from offset 0
//! - mtime/ctime changed without growth past the offset → rewritten in place
//!
//! Reads are bounded by the size observed at stat time so the cursor offset
//! never runs ahead of the metadata it was compared against.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::Stream;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TailError {
    #[error("stat {path} failed: {source}")]
    Stat {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("read {path} failed: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Observability counters; not used for correctness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailStats {
    pub lines: u64,
    pub bytes_read: u64,
    pub resets: u64,
}

/// Metadata fields compared between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    inode: Option<u64>,
    size: u64,
    modified: Option<(i64, i64)>,
    changed: Option<(i64, i64)>,
}

impl FileIdentity {
    #[cfg(unix)]
    fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            inode: Some(meta.ino()),
            size: meta.len(),
            modified: Some((meta.mtime(), meta.mtime_nsec())),
            changed: Some((meta.ctime(), meta.ctime_nsec())),
        }
    }

    #[cfg(not(unix))]
    fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| (d.as_secs() as i64, i64::from(d.subsec_nanos())));
        Self {
            inode: None,
            size: meta.len(),
            modified,
            changed: modified,
        }
    }
}

/// Per-file read position and partial-line buffer.
#[derive(Debug, Default)]
struct TailCursor {
    offset: u64,
    inode: Option<u64>,
    modified: Option<(i64, i64)>,
    changed: Option<(i64, i64)>,
    partial: Vec<u8>,
    tracking: bool,
}

impl TailCursor {
    fn reset(&mut self, stats: &mut TailStats) {
        self.offset = 0;
        self.partial.clear();
        stats.resets += 1;
    }
}

/// Incremental reader over one appended-to file.
pub struct LogTailer {
    path: PathBuf,
    poll_interval: Duration,
    cursor: TailCursor,
    stats: TailStats,
    ready: VecDeque<String>,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>, poll_interval_ms: u64) -> Self {
        Self {
            path: path.into(),
            poll_interval: Duration::from_millis(poll_interval_ms.max(1)),
            cursor: TailCursor::default(),
            stats: TailStats::default(),
            ready: VecDeque::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> TailStats {
        self.stats
    }

    /// Wait for the next newly appended line.
    ///
    /// Sleeps one poll interval between checks; transient errors are logged
    /// and retried on the next poll.
    pub async fn next_line(&mut self) -> String {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return line;
            }
            tokio::time::sleep(self.poll_interval).await;
            match self.poll().await {
                Ok(lines) => self.ready.extend(lines),
                Err(e) => warn!(path = %self.path.display(), error = %e, "Tail poll failed, will retry"),
            }
        }
    }

    /// Consume the tailer as an infinite stream of lines.
    pub fn into_lines(self) -> impl Stream<Item = String> {
        futures::stream::unfold(self, |mut tailer| async move {
            let line = tailer.next_line().await;
            Some((line, tailer))
        })
    }

    /// Run one poll cycle immediately and return the complete lines found.
    ///
    /// A missing file is not an error; the cycle is skipped.
    pub async fn poll(&mut self) -> Result<Vec<String>, TailError> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(TailError::Stat {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let current = FileIdentity::from_metadata(&meta);
        self.check_rotation(&current);

        if current.size <= self.cursor.offset {
            return Ok(Vec::new());
        }
        self.read_new(current.size).await
    }

    fn check_rotation(&mut self, current: &FileIdentity) {
        let cursor = &mut self.cursor;

        if !cursor.tracking || cursor.inode != current.inode {
            if cursor.tracking {
                debug!(path = %self.path.display(), "Inode changed, file rotated");
            }
            cursor.tracking = true;
            cursor.inode = current.inode;
            cursor.modified = current.modified;
            cursor.changed = current.changed;
            cursor.reset(&mut self.stats);
        }

        if current.size < cursor.offset {
            debug!(
                path = %self.path.display(),
                size = current.size,
                offset = cursor.offset,
                "File truncated"
            );
            cursor.reset(&mut self.stats);
        }

        let times_changed = cursor.modified != current.modified || cursor.changed != current.changed;
        if times_changed && current.size <= cursor.offset && cursor.offset > 0 {
            debug!(path = %self.path.display(), "File rewritten in place");
            cursor.reset(&mut self.stats);
        }

        cursor.modified = current.modified;
        cursor.changed = current.changed;
    }

    async fn read_new(&mut self, size: u64) -> Result<Vec<String>, TailError> {
        let read_err = |source| TailError::Read {
            path: self.path.clone(),
            source,
        };
        let mut file = tokio::fs::File::open(&self.path).await.map_err(read_err)?;
        file.seek(SeekFrom::Start(self.cursor.offset))
            .await
            .map_err(read_err)?;

        let mut chunk = Vec::new();
        file.take(size - self.cursor.offset)
            .read_to_end(&mut chunk)
            .await
            .map_err(read_err)?;
        if chunk.is_empty() {
            return Ok(Vec::new());
        }

        self.cursor.offset += chunk.len() as u64;
        self.stats.bytes_read += chunk.len() as u64;
        self.cursor.partial.extend_from_slice(&chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.cursor.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.cursor.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let cleaned = line.trim();
            if !cleaned.is_empty() {
                self.stats.lines += 1;
                lines.push(cleaned.to_string());
            }
        }
        Ok(lines)
    }
}
