use anyhow::Result;
use std::path::Path;

use atari_core::paths;
use atari_core::state::DrainState;

/// Print a summary of `state.json` (or the raw JSON with `--json`).
pub fn run(workdir: &Path, json: bool) -> Result<()> {
    let state = DrainState::load(&paths::state_path(workdir))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    println!("status:      {}", state.status);
    println!("iteration:   {}", state.iteration);
    println!("total cost:  ${:.2}", state.total_cost);
    println!("total turns: {}", state.total_turns);
    println!("updated:     {}", state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(bead) = &state.current_bead {
        println!("working on:  {bead}");
    }

    if !state.history.is_empty() {
        println!();
        println!("{:<12} {:<10} {:>8}  last error", "bead", "status", "attempts");
        for record in state.history.values() {
            println!(
                "{:<12} {:<10} {:>8}  {}",
                record.id,
                format!("{:?}", record.status).to_lowercase(),
                record.attempts,
                record.last_error.as_deref().unwrap_or("-"),
            );
        }
    }
    Ok(())
}
