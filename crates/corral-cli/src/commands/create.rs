//! `corralctl create`: Create a stopped container.

use anyhow::Context;
use clap::Args;
use corral_common::device::{Device, Devices};
use corral_runtime::engine::{self, Engine};

use super::parse_pair;

/// Arguments for the `create` command.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Container name, a valid hostname.
    pub name: String,

    /// Profile to apply, in order. Defaults to `default`.
    #[arg(short, long = "profile")]
    pub profiles: Vec<String>,

    /// Configuration key, as `key=value`.
    #[arg(short, long = "config")]
    pub config: Vec<String>,

    /// Device, as `name:key=value,key=value`.
    #[arg(short, long = "device")]
    pub devices: Vec<String>,

    /// Delete the container when it stops.
    #[arg(long)]
    pub ephemeral: bool,

    /// Free-form description.
    #[arg(long, default_value = "")]
    pub description: String,
}

/// Parses `name:key=value,key=value`.
///
/// # Errors
///
/// Returns an error when the name or a pair is missing.
pub fn parse_device(spec: &str) -> anyhow::Result<(String, Device)> {
    let (name, pairs) = spec
        .split_once(':')
        .with_context(|| format!("expected name:key=value,..., got {spec:?}"))?;
    let mut device = Device::new();
    for pair in pairs.split(',').filter(|p| !p.is_empty()) {
        let (key, value) = parse_pair(pair)?;
        let _ = device.set(key, value);
    }
    Ok((name.to_string(), device))
}

/// Executes the `create` command.
///
/// # Errors
///
/// Returns an error if an argument is malformed or creation fails.
pub fn execute(engine: &Engine, args: CreateArgs) -> anyhow::Result<()> {
    let mut create = engine::CreateArgs::new(args.name.as_str());
    if !args.profiles.is_empty() {
        create.profiles = args.profiles;
    }
    for pair in &args.config {
        let (key, value) = parse_pair(pair)?;
        let _ = create.config.insert(key, value);
    }
    let mut devices = Devices::new();
    for spec in &args.devices {
        let (name, device) = parse_device(spec)?;
        let _ = devices.insert(name, device);
    }
    create.devices = devices;
    create.ephemeral = args.ephemeral;
    create.description = args.description;

    let container = engine.create(create)?;
    println!("Created {}", container.name());
    Ok(())
}
