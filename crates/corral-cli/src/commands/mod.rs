//! CLI command definitions and dispatch.

pub mod callhook;
pub mod config;
pub mod create;
pub mod idmap;
pub mod lifecycle;
pub mod list;
pub mod snapshot;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use corral_common::config::DriverConfig;
use corral_runtime::engine::Engine;

/// corralctl: system container driver.
#[derive(Parser, Debug)]
#[command(name = "corralctl", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to the driver configuration file.
    #[arg(long, global = true, env = "CORRAL_CONFIG", default_value = corral_common::constants::DEFAULT_CONFIG_FILE)]
    pub driver_config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a stopped container.
    Create(create::CreateArgs),
    /// Start a container.
    Start(lifecycle::StartArgs),
    /// Stop a container, gracefully when a timeout is given.
    Stop(lifecycle::StopArgs),
    /// Freeze every process of a container.
    Freeze(lifecycle::NameArgs),
    /// Thaw a frozen container.
    Unfreeze(lifecycle::NameArgs),
    /// Rename a stopped container or a snapshot.
    Rename(lifecycle::RenameArgs),
    /// Delete a stopped container with its snapshots, or one snapshot.
    Delete(lifecycle::NameArgs),
    /// Show or change a container's configuration.
    #[command(subcommand)]
    Config(config::ConfigCommand),
    /// Add or remove devices.
    #[command(subcommand)]
    Device(config::DeviceCommand),
    /// Take a snapshot of a container.
    Snapshot(snapshot::SnapshotArgs),
    /// Roll a container back to one of its snapshots.
    Restore(snapshot::RestoreArgs),
    /// List containers and their state.
    List(list::ListArgs),
    /// Show the id maps of a container.
    Idmap(idmap::IdmapArgs),
    /// Entry point for runtime library hooks.
    #[command(hide = true)]
    Callhook(callhook::CallhookArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the driver cannot be opened or the command fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let engine = open_engine(&cli.driver_config)?;
    match cli.command {
        Command::Create(args) => create::execute(&engine, args),
        Command::Start(args) => lifecycle::start(&engine, &args),
        Command::Stop(args) => lifecycle::stop(&engine, &args),
        Command::Freeze(args) => lifecycle::freeze(&engine, &args),
        Command::Unfreeze(args) => lifecycle::unfreeze(&engine, &args),
        Command::Rename(args) => lifecycle::rename(&engine, &args),
        Command::Delete(args) => lifecycle::delete(&engine, &args),
        Command::Config(command) => config::execute(&engine, command),
        Command::Device(command) => config::execute_device(&engine, command),
        Command::Snapshot(args) => snapshot::snapshot(&engine, &args),
        Command::Restore(args) => snapshot::restore(&engine, &args),
        Command::List(args) => list::execute(&engine, &args),
        Command::Idmap(args) => idmap::execute(&engine, &args),
        Command::Callhook(args) => callhook::execute(&engine, args),
    }
}

fn open_engine(config: &std::path::Path) -> anyhow::Result<Engine> {
    let driver = DriverConfig::load(config)
        .with_context(|| format!("failed to load driver configuration from {}", config.display()))?;
    tracing::debug!(data_dir = %driver.data_dir.display(), "opening driver");
    Engine::open(driver).context("failed to open the driver")
}

/// Splits `key=value`.
///
/// # Errors
///
/// Returns an error when there is no `=`.
pub fn parse_pair(pair: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = pair
        .split_once('=')
        .with_context(|| format!("expected key=value, got {pair:?}"))?;
    Ok((key.trim().to_string(), value.to_string()))
}
