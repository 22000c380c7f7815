//! QEMU command line assembly.
//!
//! Each part of the VM (CPU, firmware, disks, network, display) renders its
//! own argument fragment through [`ToQemuArgs`]; [`QemuCommand::build`]
//! strings them together in a fixed order and appends the user's
//! `ARGUMENTS` last so they can override anything before them.

use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common_opts::{MemoryOpts, Toggle};
use crate::cpu::{CpuHost, CpuModel, CpuOpts, CpuProfile};
use crate::disk::{DiskLayout, DiskOpts};
use crate::display::{Display, DisplayOpts};
use crate::firmware::{BootMode, Firmware};
use crate::host::{HostFacts, NestedStatus};
use crate::monitor::MONITOR_SOCKET;
use crate::network::{Network, NetworkOpts};

pub const DEFAULT_QEMU_BIN: &str = "qemu-system-x86_64";
pub const DEFAULT_MACHINE: &str = "q35";
const VM_NAME: &str = "windows";

/// Conversion of a VM component into QEMU command line arguments.
pub trait ToQemuArgs {
    fn qemu_args(&self) -> Vec<String>;
}

/// Everything that describes the VM.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct VmOpts {
    #[clap(flatten)]
    pub memory: MemoryOpts,

    #[clap(flatten)]
    pub cpu: CpuOpts,

    #[clap(
        long,
        env = "KVM",
        default_value = "Y",
        help = "Use KVM acceleration (N falls back to the much slower TCG)"
    )]
    pub kvm: Toggle,

    #[clap(long, env = "MACHINE", default_value = DEFAULT_MACHINE, help = "QEMU machine type")]
    pub machine: String,

    #[clap(long, env = "BOOT_MODE", default_value_t = BootMode::Uefi, help = "Guest firmware")]
    pub boot_mode: BootMode,

    #[clap(flatten)]
    pub disk: DiskOpts,

    #[clap(flatten)]
    pub display: DisplayOpts,

    #[clap(flatten)]
    pub network: NetworkOpts,

    #[clap(
        long,
        env = "ARGUMENTS",
        default_value = "",
        allow_hyphen_values = true,
        help = "Extra QEMU arguments, split like a shell would and appended last"
    )]
    pub arguments: String,

    #[clap(
        long,
        env = "QEMU_BIN",
        default_value = DEFAULT_QEMU_BIN,
        help = "QEMU system emulator to launch"
    )]
    pub qemu_bin: String,

    #[clap(
        long,
        env = "SHUTDOWN_TIMEOUT",
        default_value_t = 110,
        help = "Seconds to wait for the guest to power off before killing QEMU"
    )]
    pub shutdown_timeout: u64,
}

impl Default for VmOpts {
    fn default() -> Self {
        Self {
            memory: MemoryOpts {
                memory: crate::common_opts::DEFAULT_MEMORY_USER_STR.into(),
            },
            cpu: CpuOpts::default(),
            kvm: Toggle(true),
            machine: DEFAULT_MACHINE.into(),
            boot_mode: BootMode::Uefi,
            disk: DiskOpts::default(),
            display: DisplayOpts::default(),
            network: NetworkOpts::default(),
            arguments: String::new(),
            qemu_bin: DEFAULT_QEMU_BIN.into(),
            shutdown_timeout: 110,
        }
    }
}

/// `-machine`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Machine {
    pub kind: String,
    pub kvm: bool,
    pub smm: bool,
}

impl ToQemuArgs for Machine {
    fn qemu_args(&self) -> Vec<String> {
        let accel = if self.kvm { "kvm" } else { "tcg" };
        let mut machine = format!("{},accel={accel}", self.kind);
        if self.smm {
            machine.push_str(",smm=on");
        }
        vec!["-machine".into(), machine]
    }
}

/// Validated VM configuration, with every path resolved.
#[derive(Debug, Clone, Serialize)]
pub struct VmConfig {
    pub machine: Machine,
    pub memory_mb: u32,
    pub cpu: CpuOpts,
    pub display: Display,
    pub network: Network,
    pub firmware: Firmware,
    pub disks: DiskLayout,
    pub monitor: Utf8PathBuf,
    pub extra_args: Vec<String>,
    pub qemu_bin: String,
}

impl VmConfig {
    /// Validate `opts` and locate firmware and disks. Creates nothing.
    pub fn resolve(opts: &VmOpts) -> Result<Self> {
        if opts.cpu.cpu_cores == 0 {
            return Err(eyre!("CPU_CORES must be at least 1"));
        }
        let memory_mb = opts
            .memory
            .memory_mb()
            .with_context(|| format!("Invalid RAM_SIZE '{}'", opts.memory))?;
        let display = Display::new(&opts.display)?;
        let network = Network::new(&opts.network)?;

        let mut ports = BTreeSet::new();
        for port in display.host_ports().into_iter().chain(network.host_ports()) {
            if !ports.insert(port) {
                return Err(eyre!("Host port {port} is assigned twice"));
            }
        }

        let extra_args = shell_words::split(&opts.arguments)
            .with_context(|| format!("Parsing ARGUMENTS '{}'", opts.arguments))?;

        Ok(Self {
            machine: Machine {
                kind: opts.machine.clone(),
                kvm: opts.kvm.enabled(),
                smm: opts.boot_mode.needs_smm(),
            },
            memory_mb,
            cpu: opts.cpu.clone(),
            display,
            network,
            firmware: Firmware::resolve(opts.boot_mode, &opts.disk.storage)?,
            disks: DiskLayout::plan(&opts.disk)?,
            monitor: MONITOR_SOCKET.into(),
            extra_args,
            qemu_bin: opts.qemu_bin.clone(),
        })
    }

    /// Create what the guest needs on disk: the UEFI vars copy and the data
    /// disk.
    pub fn prepare(&self, opts: &DiskOpts) -> Result<()> {
        self.firmware.install_vars()?;
        crate::disk::ensure_data_disk(opts)?;
        Ok(())
    }

    /// All host ports the VM will bind.
    pub fn host_ports(&self) -> Vec<u16> {
        self.display
            .host_ports()
            .into_iter()
            .chain(self.network.host_ports())
            .collect()
    }
}

/// A complete QEMU invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QemuCommand {
    pub program: String,
    pub args: Vec<String>,
    pub profile: CpuProfile,
}

impl QemuCommand {
    pub fn build(config: &VmConfig, host: &HostFacts, profile: CpuProfile) -> Self {
        let cpu_host = CpuHost {
            kvm: config.machine.kvm,
            extension: host.cpu.virt_extension(),
            nested_capable: host.nested == NestedStatus::Enabled,
        };
        let cpu = CpuModel::build(&config.cpu, &cpu_host, profile);

        let mut args: Vec<String> = vec![
            "-name".into(),
            format!("{VM_NAME},process={VM_NAME}"),
        ];
        args.extend(config.machine.qemu_args());
        args.extend(cpu.qemu_args());
        args.extend([
            "-smp".into(),
            config.cpu.cpu_cores.to_string(),
            "-m".into(),
            format!("{}M", config.memory_mb),
            // Windows keeps the hardware clock in local time
            "-rtc".into(),
            "base=localtime,driftfix=slew".into(),
            "-monitor".into(),
            format!("unix:{},server,nowait", config.monitor),
        ]);
        args.extend(config.display.qemu_args());
        args.extend(config.network.qemu_args());
        args.extend(config.firmware.qemu_args());
        args.extend(config.disks.qemu_args());
        args.extend(config.extra_args.iter().cloned());

        let cmd = Self {
            program: config.qemu_bin.clone(),
            args,
            profile,
        };
        debug!("QEMU command ({profile}): {}", cmd.render());
        cmd
    }

    /// The command as a single shell-quoted line.
    pub fn render(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(self.args.iter()))
    }

    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}
