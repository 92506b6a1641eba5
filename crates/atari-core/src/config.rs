use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::paths;

// ---------------------------------------------------------------------------
// AtariConfig
// ---------------------------------------------------------------------------

/// Supervisor configuration, loaded from `.atari/config.yaml`.
///
/// Every field has a default so a missing file or a partial file both work;
/// unknown keys are ignored so older binaries tolerate newer configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AtariConfig {
    /// Model passed to the assistant CLI for drain sessions.
    pub model: String,
    /// Assistant CLI binary name or path.
    pub claude_binary: String,
    /// Issue tracker binary name or path.
    pub bd_binary: String,
    /// Attempts per bead before it is abandoned.
    pub max_failures: u32,
    /// Kill a session after this many seconds without a stream frame.
    pub idle_timeout_secs: u64,
    /// Cap for the empty-queue selection backoff.
    pub selection_backoff_max_secs: u64,
    /// Minimum seconds between state snapshots (0 = save on every change).
    pub min_save_delay_secs: u64,
    /// Enforce at-most-one assistant subprocess via the session broker.
    pub single_session: bool,
    pub observer: ObserverSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverSettings {
    /// Model for observer queries (defaults to the drain model).
    pub model: String,
    /// Wall-clock budget for one observer query.
    pub query_timeout_secs: u64,
    /// How many recent events of the current bead go into the prompt.
    pub context_events: usize,
}

impl Default for AtariConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-6".into(),
            claude_binary: "claude".into(),
            bd_binary: "bd".into(),
            max_failures: 3,
            idle_timeout_secs: 300,
            selection_backoff_max_secs: 60,
            min_save_delay_secs: 5,
            single_session: true,
            observer: ObserverSettings::default(),
        }
    }
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-6".into(),
            query_timeout_secs: 60,
            context_events: 20,
        }
    }
}

impl AtariConfig {
    /// Load from `<root>/.atari/config.yaml`; a missing file yields defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let config: AtariConfig = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn selection_backoff_max(&self) -> Duration {
        Duration::from_secs(self.selection_backoff_max_secs)
    }

    pub fn min_save_delay(&self) -> Duration {
        Duration::from_secs(self.min_save_delay_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.observer.query_timeout_secs)
    }

    /// Commented template written by `atari init`.
    pub fn default_yaml() -> &'static str {
        "\
# atari supervisor configuration
#
# model: assistant model used for drain sessions
model: claude-sonnet-4-6
claude_binary: claude
bd_binary: bd

# attempts per bead before it is abandoned
max_failures: 3

# kill a session after this long without output (seconds)
idle_timeout_secs: 300

# cap for the empty-queue retry backoff (seconds)
selection_backoff_max_secs: 60

# minimum delay between state snapshots (seconds)
min_save_delay_secs: 5

# allow at most one assistant subprocess at a time
single_session: true

observer:
  model: claude-sonnet-4-6
  query_timeout_secs: 60
  context_events: 20
"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
