use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Snapshot schema version. Bumped on incompatible changes; older or
/// unversioned files are moved aside on load.
pub const CURRENT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// BeadHistory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeadStatus {
    Pending,
    Working,
    Completed,
    Failed,
    Abandoned,
}

/// Per-bead progress record. `attempts` is monotonic over the drain's
/// lifetime; status transitions follow
/// pending→working→{completed,failed}, failed→working (retry),
/// failed→abandoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeadHistory {
    pub id: String,
    pub status: BeadStatus,
    pub attempts: u32,
    pub last_attempt: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session_id: Option<String>,
}

// ---------------------------------------------------------------------------
// DrainState
// ---------------------------------------------------------------------------

/// The crash-resumable drain snapshot, persisted as pretty JSON at
/// `.atari/state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrainState {
    #[serde(default)]
    pub version: u32,
    pub status: String,
    pub iteration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_bead: Option<String>,
    #[serde(default)]
    pub history: BTreeMap<String, BeadHistory>,
    pub total_cost: f64,
    pub total_turns: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_top_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_top_level_title: Option<String>,
}

impl Default for DrainState {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainState {
    pub fn new() -> Self {
        Self {
            version: CURRENT_VERSION,
            status: "idle".into(),
            iteration: 0,
            current_bead: None,
            history: BTreeMap::new(),
            total_cost: 0.0,
            total_turns: 0,
            updated_at: Utc::now(),
            active_top_level: None,
            active_top_level_title: None,
        }
    }

    /// Attempts recorded for a bead (0 if never seen).
    pub fn attempts(&self, bead_id: &str) -> u32 {
        self.history.get(bead_id).map(|h| h.attempts).unwrap_or(0)
    }

    /// Resume token for a bead, if a session was recorded.
    pub fn last_session_id(&self, bead_id: &str) -> Option<&str> {
        self.history
            .get(bead_id)
            .and_then(|h| h.last_session_id.as_deref())
    }

    pub fn is_abandoned(&self, bead_id: &str) -> bool {
        self.history
            .get(bead_id)
            .is_some_and(|h| h.status == BeadStatus::Abandoned)
    }

    /// Normalize a loaded snapshot for resume: a crash mid-iteration leaves
    /// pending/working records behind; treat them as failed with zero cost
    /// so the bead is retried under the normal failure budget.
    pub fn normalize_for_resume(&mut self) {
        self.current_bead = None;
        self.active_top_level = None;
        self.active_top_level_title = None;
        for record in self.history.values_mut() {
            if matches!(record.status, BeadStatus::Pending | BeadStatus::Working) {
                record.status = BeadStatus::Failed;
                if record.last_error.is_none() {
                    record.last_error = Some("interrupted".into());
                }
            }
        }
    }

    // ---------------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------------

    /// Load a snapshot.
    ///
    /// Absent file → fresh state. Decode failure or a version other than
    /// [`CURRENT_VERSION`] → the file is renamed to `<path>.backup`, a
    /// warning is logged, and a fresh state is returned. Any other IO error
    /// propagates.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<DrainState>(&data) {
            Ok(state) if state.version == CURRENT_VERSION => Ok(state),
            Ok(state) => {
                Self::move_aside(path, &format!("version {}", state.version))?;
                Ok(Self::new())
            }
            Err(e) => {
                Self::move_aside(path, &e.to_string())?;
                Ok(Self::new())
            }
        }
    }

    fn move_aside(path: &Path, reason: &str) -> Result<()> {
        let backup = crate::io::backup_path(path);
        tracing::warn!(
            path = %path.display(),
            backup = %backup.display(),
            reason,
            "incompatible state file, starting fresh"
        );
        std::fs::rename(path, &backup)?;
        Ok(())
    }

    /// Atomically persist: stage at `<path>.tmp`, then rename over the
    /// target. The rename is the commit point.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut data = serde_json::to_string_pretty(self)?;
        data.push('\n');
        crate::io::replace_file(path, data.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
