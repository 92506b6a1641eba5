use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::event::{self, Event};
use crate::router::Subscription;

/// Rotated `.bak` files larger than this trigger a cleanup hint on stderr.
const ROTATED_WARN_BYTES: u64 = 100 * 1024 * 1024;

// ---------------------------------------------------------------------------
// LogSink
// ---------------------------------------------------------------------------

/// Append-only JSON-lines audit trail at `.atari/atari.log`.
///
/// On open, an existing non-empty log is rotated to
/// `<path>.<YYYY-MM-DDTHH-MM-SS>.bak` (local time) so every supervisor run
/// starts a fresh file while history stays greppable. Write errors are
/// reported to stderr and never terminate the drain.
pub struct LogSink {
    path: PathBuf,
    file: File,
}

impl LogSink {
    /// Rotate if needed and open the log in append mode.
    ///
    /// This is the one startup-time IO failure that aborts the supervisor;
    /// the caller decides what to do with it.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if let Ok(meta) = std::fs::metadata(path) {
            if meta.len() > 0 {
                let stamp = Local::now().format("%Y-%m-%dT%H-%M-%S");
                let rotated = PathBuf::from(format!("{}.{stamp}.bak", path.display()));
                std::fs::rename(path, &rotated)?;
                if meta.len() > ROTATED_WARN_BYTES {
                    eprintln!(
                        "warning: rotated log {} is {} MiB; consider cleaning up old .bak files",
                        rotated.display(),
                        meta.len() / (1024 * 1024)
                    );
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_owned(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encode and append one event. Failures go to stderr; the drain
    /// continues without its audit line.
    pub fn append(&mut self, event: &Event) {
        let line = match event::encode_line(event) {
            Ok(line) => line,
            Err(e) => {
                eprintln!("warning: failed to encode {} event: {e}", event.type_name());
                return;
            }
        };
        if let Err(e) = writeln!(self.file, "{line}").and_then(|_| self.file.flush()) {
            eprintln!("warning: failed to append to {}: {e}", self.path.display());
        }
    }

    /// Consume the subscription until it closes or `cancel` fires, then
    /// drain whatever is already queued and close the file.
    pub async fn run(mut self, mut sub: Subscription, cancel: CancellationToken) {
        loop {
            tokio::select! {
                event = sub.recv() => match event {
                    Some(event) => self.append(&event),
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        while let Some(event) = sub.try_recv() {
            self.append(&event);
        }
        // File closes on drop; everything was flushed per append.
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
