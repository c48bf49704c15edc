//! `corralctl callhook`: Entry point for the runtime library's hooks.
//!
//! The runtime library runs these commands at lifecycle points; the stop
//! target, network namespace and host-side interface come from the
//! environment it sets.

use anyhow::Context;
use clap::{Args, Subcommand};
use corral_runtime::engine::{Engine, Hook};

/// Arguments for the `callhook` command.
#[derive(Args, Debug)]
pub struct CallhookArgs {
    /// Container name.
    pub name: String,

    /// Hook being run.
    #[command(subcommand)]
    pub hook: HookCommand,
}

/// Hooks the runtime library calls.
#[derive(Subcommand, Debug)]
pub enum HookCommand {
    /// Before init runs.
    Start,
    /// While the network namespace is still alive during stop.
    Stopns,
    /// After the container stopped.
    Stop,
    /// A network device is up on the host.
    NetworkUp {
        /// Device name.
        device: String,
        /// Arguments appended by the runtime library.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
        rest: Vec<String>,
    },
}

fn env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).with_context(|| format!("{key} is not set"))
}

fn stop_target() -> String {
    std::env::var("LXC_TARGET").unwrap_or_else(|_| "stop".into())
}

/// Executes the `callhook` command.
///
/// # Errors
///
/// Returns the hook's failure, which makes the runtime library abort the
/// transition.
pub fn execute(engine: &Engine, args: CallhookArgs) -> anyhow::Result<()> {
    let hook = match args.hook {
        HookCommand::Start => Hook::Start,
        HookCommand::Stopns => Hook::StopNs {
            target: stop_target(),
            netns: env("LXC_NET_NS")?,
        },
        HookCommand::Stop => Hook::Stop {
            target: stop_target(),
        },
        HookCommand::NetworkUp { device, .. } => Hook::NetworkUp {
            device,
            host_name: env("LXC_NET_PEER")?,
        },
    };
    engine
        .callhook(&args.name, &hook)
        .with_context(|| format!("hook failed for {}", args.name))
}
