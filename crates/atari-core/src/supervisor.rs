use std::path::{Path, PathBuf};
use std::sync::Arc;

use claude_driver::TokioRunner;
use tokio_util::sync::CancellationToken;

use crate::beads::{BdClient, BdWorkQueue};
use crate::broker::SessionBroker;
use crate::config::AtariConfig;
use crate::drain::{DrainController, DrainOptions};
use crate::error::{AtariError, Result};
use crate::log_sink::LogSink;
use crate::paths;
use crate::router::EventRouter;
use crate::state_sink::StateSink;

/// The state sink must not drop events; give it a deep queue.
const STATE_SINK_CAPACITY: usize = 1000;

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Wires the drain together: router, sinks, broker, workqueue, controller.
///
/// `run` blocks until `cancel` fires or the drain finishes (`once` mode),
/// then winds everything down in order: controller first, then the router
/// closes, then both sink tasks drain their queues and flush.
pub struct Supervisor {
    workdir: PathBuf,
    config: AtariConfig,
    options: DrainOptions,
}

impl Supervisor {
    pub fn new(workdir: &Path, config: AtariConfig) -> Self {
        let options = DrainOptions::from_config(&config);
        Self {
            workdir: workdir.to_owned(),
            config,
            options,
        }
    }

    pub fn once(mut self, once: bool) -> Self {
        self.options.once = once;
        self
    }

    /// Fail early when a required binary is missing from PATH.
    pub fn preflight(&self) -> Result<()> {
        for binary in [&self.config.claude_binary, &self.config.bd_binary] {
            if which::which(binary).is_err() {
                return Err(AtariError::BinaryNotFound(binary.clone()));
            }
        }
        Ok(())
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        // Bootstrap IO failures here are the only fatal startup errors.
        let log_sink = LogSink::open(&paths::log_path(&self.workdir))?;
        let state_sink = Arc::new(StateSink::open(
            &paths::state_path(&self.workdir),
            self.config.min_save_delay(),
        )?);

        let router = Arc::new(EventRouter::new());
        let log_sub = router.subscribe();
        let state_sub = router.subscribe_with_capacity(STATE_SINK_CAPACITY);

        // The sinks terminate when the router closes, not on the shutdown
        // token: they must keep consuming through wind-down so the final
        // drain.stop (and its forced save) is never missed.
        let log_task = tokio::spawn(log_sink.run(log_sub, CancellationToken::new()));
        let state_task = {
            let sink = Arc::clone(&state_sink);
            tokio::spawn(async move { sink.run(state_sub, CancellationToken::new()).await })
        };

        let broker = self
            .config
            .single_session
            .then(|| Arc::new(SessionBroker::new()));
        let queue = Arc::new(BdWorkQueue::new(BdClient::new(
            self.config.bd_binary.clone(),
            &self.workdir,
        )));

        let controller = DrainController::new(
            Arc::clone(&router),
            queue,
            Arc::new(TokioRunner),
            broker,
            Arc::clone(&state_sink),
            self.options.clone(),
        );

        let outcome = controller.run(cancel.clone()).await;

        // Close the fan-out so both sink tasks see end-of-stream, drain
        // their queues, and flush.
        router.close();
        let _ = log_task.await;
        let _ = state_task.await;

        outcome
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
