//! `corralctl list`: List containers and their state.

use clap::Args;
use corral_runtime::engine::Engine;

use crate::output;

/// Arguments for the `list` command.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Print one JSON object per container instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `list` command.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn execute(engine: &Engine, args: &ListArgs) -> anyhow::Result<()> {
    let containers = engine.list()?;
    if containers.is_empty() && !args.json {
        println!("No containers found.");
        return Ok(());
    }

    if !args.json {
        println!(
            "{:<24} {:<10} {:<10} {:<24} {:<10}",
            "NAME", "STATE", "EPHEMERAL", "PROFILES", "SNAPSHOTS"
        );
    }
    for container in &containers {
        let name = container.name();
        let state = container.status();
        let snapshots = engine.services().store.snapshots(&name)?.len();
        let profiles = container.record().profiles.join(",");
        if args.json {
            let line = serde_json::json!({
                "name": name,
                "state": state.to_string(),
                "status_code": state.code(),
                "ephemeral": container.is_ephemeral(),
                "profiles": container.record().profiles,
                "snapshots": snapshots,
            });
            println!("{line}");
        } else {
            println!(
                "{:<24} {:<10} {:<10} {:<24} {:<10}",
                name,
                output::state_label(state),
                container.is_ephemeral(),
                profiles,
                snapshots
            );
        }
    }
    Ok(())
}
