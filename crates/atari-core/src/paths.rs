use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const ATARI_DIR: &str = ".atari";
pub const LOG_FILE: &str = ".atari/atari.log";
pub const STATE_FILE: &str = ".atari/state.json";
pub const CONFIG_FILE: &str = ".atari/config.yaml";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn atari_dir(root: &Path) -> PathBuf {
    root.join(ATARI_DIR)
}

pub fn log_path(root: &Path) -> PathBuf {
    root.join(LOG_FILE)
}

pub fn state_path(root: &Path) -> PathBuf {
    root.join(STATE_FILE)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
