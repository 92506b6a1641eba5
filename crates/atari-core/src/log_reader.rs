use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::error::{AtariError, Result};
use crate::event::{self, Decoded, Event};

/// Lines longer than this are truncated before decoding.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;
pub const TRUNCATION_MARKER: &str = "...[TRUNCATED]";

// ---------------------------------------------------------------------------
// LogReader
// ---------------------------------------------------------------------------

/// Read-only tail-style reader over the event log.
///
/// Tracks `(inode, size)` between calls and notices rotation when the inode
/// changes or the file shrank; every query re-reads the current file, so a
/// rotation simply means the next query sees the fresh log. Undecodable
/// lines are logged and skipped.
pub struct LogReader {
    path: PathBuf,
    mark: Mutex<Option<FileMark>>,
    rotations: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileMark {
    inode: u64,
    size: u64,
}

impl LogReader {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_owned(),
            mark: Mutex::new(None),
            rotations: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mark(&self) -> MutexGuard<'_, Option<FileMark>> {
        self.mark.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rotations observed across the reader's lifetime.
    pub fn rotation_count(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    /// Read and decode every event currently in the log.
    pub fn read_events(&self) -> Result<Vec<Event>> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AtariError::LogNotFound(self.path.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        if meta.len() == 0 {
            return Err(AtariError::LogEmpty(self.path.clone()));
        }

        let current = FileMark {
            inode: inode_of(&meta),
            size: meta.len(),
        };
        {
            let mut mark = self.mark();
            if let Some(previous) = *mark {
                if previous.inode != current.inode || current.size < previous.size {
                    self.rotations.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(path = %self.path.display(), "log rotation detected");
                }
            }
            *mark = Some(current);
        }

        let file = File::open(&self.path)?;
        let mut events = Vec::new();
        for line in read_capped_lines(file)? {
            if line.is_empty() {
                continue;
            }
            match event::decode_line(&line) {
                Ok(Decoded::Event(event)) => events.push(event),
                Ok(Decoded::Unknown) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable log line");
                }
            }
        }
        Ok(events)
    }

    /// The last `n` events, chronologically.
    pub fn recent(&self, n: usize) -> Result<Vec<Event>> {
        let mut events = self.read_events()?;
        if events.len() > n {
            events.drain(..events.len() - n);
        }
        Ok(events)
    }

    /// All events whose extracted bead id matches.
    pub fn by_bead(&self, bead_id: &str) -> Result<Vec<Event>> {
        Ok(self
            .read_events()?
            .into_iter()
            .filter(|e| e.bead_id() == bead_id)
            .collect())
    }

    /// All events strictly after `since`.
    pub fn after(&self, since: DateTime<Utc>) -> Result<Vec<Event>> {
        Ok(self
            .read_events()?
            .into_iter()
            .filter(|e| e.timestamp > since)
            .collect())
    }
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata) -> u64 {
    0
}

// ---------------------------------------------------------------------------
// Capped line reading
// ---------------------------------------------------------------------------

/// Read lines with a [`MAX_LINE_BYTES`] cap. An oversize line is truncated,
/// suffixed with [`TRUNCATION_MARKER`], and the remainder of the physical
/// line is discarded without buffering it.
fn read_capped_lines(file: File) -> std::io::Result<Vec<String>> {
    let mut reader = BufReader::new(file);
    let mut lines = Vec::new();

    loop {
        let mut buf = Vec::new();
        let n = (&mut reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }

        let oversize = buf.len() > MAX_LINE_BYTES && !buf.ends_with(b"\n");
        if oversize {
            buf.truncate(MAX_LINE_BYTES);
            let mut line = String::from_utf8_lossy(&buf).into_owned();
            line.push_str(TRUNCATION_MARKER);
            lines.push(line);
            skip_to_newline(&mut reader)?;
            continue;
        }

        while buf.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
            buf.pop();
        }
        lines.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Ok(lines)
}

fn skip_to_newline(reader: &mut impl BufRead) -> std::io::Result<()> {
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(());
        }
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            reader.consume(pos + 1);
            return Ok(());
        }
        let len = buf.len();
        reader.consume(len);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
