//! `corralctl start|stop|freeze|unfreeze|rename|delete`.

use std::time::Duration;

use clap::Args;
use corral_runtime::engine::Engine;

/// A single container name.
#[derive(Args, Debug)]
pub struct NameArgs {
    /// Container name.
    pub name: String,
}

/// Arguments for the `start` command.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Container name.
    pub name: String,

    /// Restore the checkpoint taken by a stateful stop.
    #[arg(long)]
    pub stateful: bool,
}

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Container name.
    pub name: String,

    /// Checkpoint the container before stopping it.
    #[arg(long, conflicts_with = "timeout")]
    pub stateful: bool,

    /// Ask init to shut down and wait this many seconds before giving up.
    #[arg(short, long)]
    pub timeout: Option<u64>,
}

/// Arguments for the `rename` command.
#[derive(Args, Debug)]
pub struct RenameArgs {
    /// Current name, `<container>/<snapshot>` for a snapshot.
    pub name: String,

    /// New name. For a snapshot, only the snapshot part.
    pub new_name: String,
}

/// Executes the `start` command.
///
/// # Errors
///
/// Returns an error if the container cannot be loaded or started.
pub fn start(engine: &Engine, args: &StartArgs) -> anyhow::Result<()> {
    engine.load(&args.name)?.start(args.stateful)?;
    println!("Started {}", args.name);
    Ok(())
}

/// Executes the `stop` command.
///
/// # Errors
///
/// Returns an error if the container cannot be loaded or stopped.
pub fn stop(engine: &Engine, args: &StopArgs) -> anyhow::Result<()> {
    let container = engine.load(&args.name)?;
    match args.timeout {
        Some(secs) => container.shutdown(Duration::from_secs(secs))?,
        None => container.stop(args.stateful)?,
    }
    println!("Stopped {}", args.name);
    Ok(())
}

/// Executes the `freeze` command.
///
/// # Errors
///
/// Returns an error if the container is not running or cannot be frozen.
pub fn freeze(engine: &Engine, args: &NameArgs) -> anyhow::Result<()> {
    engine.load(&args.name)?.freeze()?;
    println!("Froze {}", args.name);
    Ok(())
}

/// Executes the `unfreeze` command.
///
/// # Errors
///
/// Returns an error if the container is not frozen or cannot be thawed.
pub fn unfreeze(engine: &Engine, args: &NameArgs) -> anyhow::Result<()> {
    engine.load(&args.name)?.unfreeze()?;
    println!("Thawed {}", args.name);
    Ok(())
}

/// Executes the `rename` command.
///
/// # Errors
///
/// Returns an error if the name is invalid or the container runs.
pub fn rename(engine: &Engine, args: &RenameArgs) -> anyhow::Result<()> {
    let container = engine.load(&args.name)?;
    container.rename(&args.new_name)?;
    println!("Renamed {} to {}", args.name, container.name());
    Ok(())
}

/// Executes the `delete` command.
///
/// # Errors
///
/// Returns an error if the container runs, is protected, or removal fails.
pub fn delete(engine: &Engine, args: &NameArgs) -> anyhow::Result<()> {
    engine.delete(&args.name)?;
    println!("Deleted {}", args.name);
    Ok(())
}
