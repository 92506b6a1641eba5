use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AtariError, Result};

// ---------------------------------------------------------------------------
// Bead
// ---------------------------------------------------------------------------

/// One tracked issue, as reported by `bd ready --json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub issue_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

/// Where the drain gets its candidates.
///
/// Implementations must be cheap to call repeatedly; the controller polls
/// with backoff while the queue is empty.
pub trait WorkQueue: Send + Sync {
    /// The next candidate not in `skip`, or `None` when the queue is empty.
    fn next_bead(&self, skip: &HashSet<String>) -> Result<Option<Bead>>;
}

// ---------------------------------------------------------------------------
// BdClient
// ---------------------------------------------------------------------------

/// Synchronous client for the issue-tracker binary.
///
/// Tracker failures are never fatal to the drain; callers log and move on.
pub struct BdClient {
    binary: String,
    workdir: PathBuf,
}

impl BdClient {
    pub fn new(binary: impl Into<String>, workdir: &Path) -> Self {
        Self {
            binary: binary.into(),
            workdir: workdir.to_owned(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = std::process::Command::new(&self.binary)
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .map_err(|e| AtariError::Tracker(format!("failed to run {}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AtariError::Tracker(format!(
                "{} {} failed ({}): {}",
                self.binary,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Beads ready to be worked, in the tracker's priority order.
    pub fn ready(&self) -> Result<Vec<Bead>> {
        let out = self.run(&["ready", "--json"])?;
        parse_ready(&out)
    }

    /// Raw `bd show` text for a bead.
    pub fn show(&self, bead_id: &str) -> Result<String> {
        self.run(&["show", bead_id])
    }

    /// Close a bead. Normally the assistant does this itself; the drain
    /// only calls it from operator tooling.
    pub fn close(&self, bead_id: &str) -> Result<()> {
        self.run(&["close", bead_id]).map(|_| ())
    }
}

fn parse_ready(json: &str) -> Result<Vec<Bead>> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(trimmed)?)
}

// ---------------------------------------------------------------------------
// BdWorkQueue
// ---------------------------------------------------------------------------

/// Adapts [`BdClient::ready`] to the [`WorkQueue`] contract. Tracker errors
/// are logged and reported as an empty queue so the drain keeps polling.
pub struct BdWorkQueue {
    client: BdClient,
}

impl BdWorkQueue {
    pub fn new(client: BdClient) -> Self {
        Self { client }
    }
}

impl WorkQueue for BdWorkQueue {
    fn next_bead(&self, skip: &HashSet<String>) -> Result<Option<Bead>> {
        let beads = match self.client.ready() {
            Ok(beads) => beads,
            Err(e) => {
                tracing::warn!(error = %e, "issue tracker query failed");
                return Ok(None);
            }
        };
        Ok(beads.into_iter().find(|b| !skip.contains(&b.id)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
