//! `corralctl config` and `corralctl device`.

use anyhow::Context;
use clap::Subcommand;
use corral_common::device::Device;
use corral_runtime::container::UpdateArgs;
use corral_runtime::engine::Engine;

use super::parse_pair;
use crate::output;

/// Configuration subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the configuration.
    Show {
        /// Container name.
        name: String,
        /// Include keys inherited from profiles.
        #[arg(long)]
        expanded: bool,
    },
    /// Set keys, as `key=value`.
    Set {
        /// Container name.
        name: String,
        /// Keys to set.
        #[arg(required = true)]
        pairs: Vec<String>,
    },
    /// Remove keys.
    Unset {
        /// Container name.
        name: String,
        /// Keys to remove.
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

/// Device subcommands.
#[derive(Subcommand, Debug)]
pub enum DeviceCommand {
    /// Print the devices.
    Show {
        /// Container name.
        name: String,
        /// Include devices inherited from profiles.
        #[arg(long)]
        expanded: bool,
    },
    /// Add a device, or replace one with the same name.
    Add {
        /// Container name.
        name: String,
        /// Device name.
        device: String,
        /// Device keys, as `key=value`.
        #[arg(required = true)]
        pairs: Vec<String>,
    },
    /// Remove a device.
    Remove {
        /// Container name.
        name: String,
        /// Device name.
        device: String,
    },
}

/// Executes a `config` subcommand.
///
/// # Errors
///
/// Returns an error if the container is unknown or the update fails.
pub fn execute(engine: &Engine, command: ConfigCommand) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Show { name, expanded } => {
            let container = engine.load(&name)?;
            let config = if expanded {
                container.expanded_config()
            } else {
                container.local_config()
            };
            for (key, value) in &config {
                println!("{key}: {value}");
            }
            Ok(())
        }
        ConfigCommand::Set { name, pairs } => {
            let container = engine.load(&name)?;
            let mut args = UpdateArgs::from_record(&container.record());
            for pair in &pairs {
                let (key, value) = parse_pair(pair)?;
                let _ = args.config.insert(key, value);
            }
            container.update(args, true)?;
            Ok(())
        }
        ConfigCommand::Unset { name, keys } => {
            let container = engine.load(&name)?;
            let mut args = UpdateArgs::from_record(&container.record());
            for key in &keys {
                let _ = args
                    .config
                    .remove(key)
                    .with_context(|| format!("{key} is not set on {name}"))?;
            }
            container.update(args, true)?;
            Ok(())
        }
    }
}

/// Executes a `device` subcommand.
///
/// # Errors
///
/// Returns an error if the container or device is unknown or the update
/// fails.
pub fn execute_device(engine: &Engine, command: DeviceCommand) -> anyhow::Result<()> {
    match command {
        DeviceCommand::Show { name, expanded } => {
            let container = engine.load(&name)?;
            let devices = if expanded {
                container.expanded_devices()
            } else {
                container.record().devices
            };
            for (device, config) in devices.iter() {
                println!("{device}: {}", output::device_summary(config));
            }
            Ok(())
        }
        DeviceCommand::Add { name, device, pairs } => {
            let container = engine.load(&name)?;
            let mut config = Device::new();
            for pair in &pairs {
                let (key, value) = parse_pair(pair)?;
                let _ = config.set(key, value);
            }
            let mut args = UpdateArgs::from_record(&container.record());
            let _ = args.devices.insert(device, config);
            container.update(args, true)?;
            Ok(())
        }
        DeviceCommand::Remove { name, device } => {
            let container = engine.load(&name)?;
            let mut args = UpdateArgs::from_record(&container.record());
            let _ = args
                .devices
                .remove(&device)
                .with_context(|| format!("{name} has no local device {device}"))?;
            container.update(args, true)?;
            Ok(())
        }
    }
}
