//! `corralctl snapshot|restore`.

use clap::Args;
use corral_common::constants::SNAPSHOT_DELIMITER;
use corral_runtime::engine::Engine;

/// Arguments for the `snapshot` command.
#[derive(Args, Debug)]
pub struct SnapshotArgs {
    /// Container name.
    pub name: String,

    /// Snapshot name.
    pub snapshot: String,

    /// Also checkpoint the running container.
    #[arg(long)]
    pub stateful: bool,
}

/// Arguments for the `restore` command.
#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Container name.
    pub name: String,

    /// Snapshot to restore.
    pub snapshot: String,

    /// Restore the snapshot's checkpoint instead of booting.
    #[arg(long)]
    pub stateful: bool,
}

/// Executes the `snapshot` command.
///
/// # Errors
///
/// Returns an error if the name is taken or the snapshot fails.
pub fn snapshot(engine: &Engine, args: &SnapshotArgs) -> anyhow::Result<()> {
    let created = engine.snapshot(&args.name, &args.snapshot, args.stateful)?;
    println!("Snapshot {} created", created.name());
    Ok(())
}

/// Executes the `restore` command.
///
/// # Errors
///
/// Returns an error if the snapshot is unknown or the restore fails.
pub fn restore(engine: &Engine, args: &RestoreArgs) -> anyhow::Result<()> {
    let container = engine.load(&args.name)?;
    let source = engine.load(&format!("{}{SNAPSHOT_DELIMITER}{}", args.name, args.snapshot))?;
    container.restore(&source, args.stateful)?;
    println!("Restored {} from {}", args.name, args.snapshot);
    Ok(())
}
