use std::path::{Path, PathBuf};

/// Resolve the working directory: an explicit flag wins; otherwise walk up
/// from the current directory looking for `.atari/`, then `.git/`; fall
/// back to the current directory.
pub fn resolve_workdir(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_owned();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    for marker in [".atari", ".git"] {
        let mut dir = cwd.as_path();
        loop {
            if dir.join(marker).exists() {
                return dir.to_owned();
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }
    cwd
}
