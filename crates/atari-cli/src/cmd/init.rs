use anyhow::Result;
use std::path::Path;

use atari_core::config::AtariConfig;
use atari_core::{io, paths};

/// Create `.atari/` and seed the default config if missing. Idempotent.
pub fn run(workdir: &Path) -> Result<()> {
    let config_path = paths::config_path(workdir);
    let written = io::seed_file(&config_path, AtariConfig::default_yaml())?;
    if written {
        println!("initialized {}", config_path.display());
    } else {
        println!("already initialized ({})", config_path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        run(dir.path()).unwrap();
        let config_path = paths::config_path(dir.path());
        assert!(config_path.exists());
        assert!(paths::atari_dir(dir.path()).is_dir());

        std::fs::write(&config_path, "max_failures: 9\n").unwrap();
        run(dir.path()).unwrap();
        let config = AtariConfig::load(dir.path()).unwrap();
        assert_eq!(config.max_failures, 9);
    }
}
