//! Windows VM kit (wvk) - container entrypoint that runs Windows under QEMU/KVM

use std::ffi::OsStr;

use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use color_eyre::{eyre::Context as _, Report, Result};

mod check;
mod command_run;
mod common_opts;
mod cpu;
mod disk;
mod display;
mod firmware;
mod guest_script;
mod host;
mod monitor;
mod network;
mod qemu;
mod run;
mod utils;

use common_opts::Toggle;
use host::HostFacts;
use qemu::{QemuCommand, VmConfig, VmOpts};

/// Run Windows in a container with QEMU/KVM.
///
/// The guest is reachable through VNC, through noVNC in a browser and
/// through RDP. Host CPU virtualization extensions are passed through so
/// Hyper-V, WSL2 and WHPX work inside Windows. Every option can also be set
/// through the environment variable named in its help.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[clap(
        long,
        env = "DEBUG",
        default_value = "N",
        global = true,
        help = "Debug logging (RUST_LOG takes precedence)"
    )]
    debug: Toggle,

    #[command(subcommand)]
    command: Commands,
}

/// Options for `wvk args`
#[derive(Parser)]
struct ArgsOpts {
    /// Output as structured JSON instead of a shell command line
    #[clap(long)]
    json: bool,

    #[clap(flatten)]
    vm: VmOpts,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare storage and firmware, then launch and supervise the VM
    Run(VmOpts),

    /// Print the QEMU command line without creating or launching anything
    Args(ArgsOpts),

    /// Validate the options and print the resolved configuration as JSON
    Config(VmOpts),

    /// Diagnose the host: KVM, nested virtualization, firmware, ports
    Check(check::CheckOpts),

    /// Print a PowerShell script that reports nested virtualization status
    /// from inside the guest
    GuestScript,
}

/// Stop reading environment variables that are set but empty, so `-e PORTS=`
/// behaves as if `PORTS` were not set at all.
fn ignore_empty_env(cmd: clap::Command, is_empty: &dyn Fn(&OsStr) -> bool) -> clap::Command {
    let blank: Vec<String> = cmd
        .get_arguments()
        .filter(|a| a.get_env().is_some_and(is_empty))
        .map(|a| a.get_id().as_str().to_owned())
        .collect();
    let subcommands: Vec<String> = cmd
        .get_subcommands()
        .map(|c| c.get_name().to_owned())
        .collect();
    let cmd = blank.into_iter().fold(cmd, |cmd, id| {
        cmd.mut_arg(id, |a| a.env(None::<&'static str>))
    });
    subcommands.into_iter().fold(cmd, |cmd, name| {
        cmd.mut_subcommand(name, |sub| ignore_empty_env(sub, is_empty))
    })
}

fn env_is_empty(name: &OsStr) -> bool {
    std::env::var_os(name).is_some_and(|v| v.is_empty())
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by RUST_LOG, defaulting to 'info' (or 'debug' when
/// DEBUG is set), and written to stderr.
fn install_tracing(debug: bool) {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let default_level = if debug { "debug" } else { "info" };
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    let matches = ignore_empty_env(Cli::command(), &env_is_empty).get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
    install_tracing(cli.debug.enabled());
    color_eyre::install()?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Init tokio runtime")?;

    let code = match cli.command {
        Commands::Run(opts) => rt.block_on(run::run(opts))?,
        Commands::Args(opts) => {
            let host = HostFacts::probe();
            let config = VmConfig::resolve(&opts.vm)?;
            let cmd = QemuCommand::build(&config, &host, cpu::CpuProfile::Full);
            if opts.json {
                println!("{}", serde_json::to_string_pretty(&cmd)?);
            } else {
                println!("{}", cmd.render());
            }
            0
        }
        Commands::Config(opts) => {
            let config = VmConfig::resolve(&opts)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            0
        }
        Commands::Check(opts) => {
            if check::run(opts)? {
                0
            } else {
                1
            }
        }
        Commands::GuestScript => {
            guest_script::run();
            0
        }
    };
    tracing::debug!("exiting with {code}");
    // Ensure we don't block on any spawned tasks
    rt.shutdown_background();
    std::process::exit(code)
}
