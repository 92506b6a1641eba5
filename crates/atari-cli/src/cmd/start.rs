use anyhow::Result;
use std::path::Path;

use atari_core::config::AtariConfig;
use atari_core::supervisor::Supervisor;
use tokio_util::sync::CancellationToken;

/// Run the drain until ctrl-c (or after one bead with `--once`).
pub fn run(
    workdir: &Path,
    model: Option<String>,
    max_failures: Option<u32>,
    once: bool,
) -> Result<()> {
    let mut config = AtariConfig::load(workdir)?;
    if let Some(model) = model {
        config.model = model;
    }
    if let Some(max_failures) = max_failures {
        config.max_failures = max_failures;
    }

    let supervisor = Supervisor::new(workdir, config).once(once);
    supervisor.preflight()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let cancel = CancellationToken::new();

        let ctrl_c = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nshutting down, saving state…");
                    cancel.cancel();
                }
            })
        };

        let outcome = supervisor.run(cancel.clone()).await;
        cancel.cancel();
        ctrl_c.abort();
        outcome
    })?;
    Ok(())
}
