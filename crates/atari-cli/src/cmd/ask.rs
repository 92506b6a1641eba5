use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use atari_core::config::AtariConfig;
use atari_core::log_reader::LogReader;
use atari_core::observer::{Observer, ObserverOptions};
use atari_core::paths;
use atari_core::state::DrainState;
use atari_core::state_sink::DrainStateProvider;
use chrono::{DateTime, Utc};
use claude_driver::TokioRunner;

/// Provider over the persisted snapshot: `ask` runs in its own process, so
/// the drain's live state is whatever it last saved.
struct FileStateProvider {
    state: DrainState,
}

impl DrainStateProvider for FileStateProvider {
    fn snapshot(&self) -> DrainState {
        self.state.clone()
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.state.updated_at
    }
}

/// One observer question against the on-disk log and state.
pub fn run(workdir: &Path, question: &str) -> Result<()> {
    let config = AtariConfig::load(workdir)?;
    let state = DrainState::load(&paths::state_path(workdir))?;

    let observer = Observer::new(
        ObserverOptions::from_config(&config),
        Arc::new(TokioRunner),
        Arc::new(LogReader::new(&paths::log_path(workdir))),
        Arc::new(FileStateProvider { state }),
        // No broker: a separate process cannot see the drain's slot, and
        // read-only questions are safe to run alongside it.
        None,
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let answer = runtime.block_on(observer.ask(question))?;
    println!("{answer}");
    Ok(())
}
