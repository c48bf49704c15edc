//! `corralctl idmap`: Show the id maps of a container.

use clap::Args;
use corral_runtime::engine::Engine;

use crate::output;

/// Arguments for the `idmap` command.
#[derive(Args, Debug)]
pub struct IdmapArgs {
    /// Container name.
    pub name: String,
}

/// Executes the `idmap` command.
///
/// # Errors
///
/// Returns an error if the container is unknown or a stored map is
/// malformed.
pub fn execute(engine: &Engine, args: &IdmapArgs) -> anyhow::Result<()> {
    let container = engine.load(&args.name)?;
    println!("next:    {}", output::idmap_summary(container.next_idmap()?.as_ref()));
    println!("current: {}", output::idmap_summary(container.current_idmap()?.as_ref()));
    println!("disk:    {}", output::idmap_summary(container.disk_idmap()?.as_ref()));
    Ok(())
}
