//! `wvk check`: host diagnostics.
//!
//! Every check is shallow (a file exists, a device is accessible, a port is
//! free) and reports what to change when it does not pass.

use std::process::Command;

use camino::Utf8Path;
use clap::Parser;
use color_eyre::Result;
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use crate::command_run::CommandRun;
use crate::display::{Display, DisplayMode};
use crate::firmware::Firmware;
use crate::host::{
    tcp_port_in_use, CpuInfo, HostFacts, KvmStatus, ListeningSockets, NestedStatus, ProcessTable,
};
use crate::network::Network;
use crate::qemu::{VmConfig, VmOpts};

/// Options for `wvk check`
#[derive(Parser, Debug)]
pub struct CheckOpts {
    /// Output as structured JSON instead of a table
    #[clap(long)]
    pub json: bool,

    #[clap(flatten)]
    pub vm: VmOpts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    fn new(name: impl Into<String>, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            detail: detail.into(),
        }
    }
}

fn check_kvm(status: &KvmStatus, wanted: bool) -> CheckResult {
    let result = match (status.is_ready(), wanted) {
        (true, _) => CheckStatus::Pass,
        (false, true) => CheckStatus::Fail,
        (false, false) => CheckStatus::Warn,
    };
    let detail = match status.hint() {
        Some(hint) if result != CheckStatus::Pass => format!("{status}; {hint}"),
        _ => status.to_string(),
    };
    CheckResult::new("KVM device", result, detail)
}

fn check_extension(cpu: &CpuInfo) -> CheckResult {
    let name = "CPU virtualization";
    match cpu.virt_extension() {
        Some(ext) => {
            let vendor = cpu.vendor.as_deref().unwrap_or("unknown vendor");
            let mut detail = format!("{ext} ({vendor})");
            if cpu.is_virtualized() {
                detail.push_str(", host is itself a VM");
            }
            CheckResult::new(name, CheckStatus::Pass, detail)
        }
        None => CheckResult::new(
            name,
            CheckStatus::Warn,
            "neither vmx nor svm in /proc/cpuinfo; enable VT-x/AMD-V in the firmware setup",
        ),
    }
}

fn check_nested(cpu: &CpuInfo, nested: NestedStatus) -> CheckResult {
    let name = "Nested virtualization";
    let Some(ext) = cpu.virt_extension() else {
        return CheckResult::new(name, CheckStatus::Warn, "no virtualization extension");
    };
    let module = ext.kvm_module();
    match nested {
        NestedStatus::Enabled => {
            CheckResult::new(name, CheckStatus::Pass, format!("{module} nested=Y"))
        }
        NestedStatus::Disabled => CheckResult::new(
            name,
            CheckStatus::Warn,
            format!(
                "{module} nested=N; set 'options {module} nested=1' on the host and reload the module"
            ),
        ),
        NestedStatus::Unknown => CheckResult::new(
            name,
            CheckStatus::Warn,
            format!("{module} not loaded or nested parameter unreadable"),
        ),
    }
}

fn check_qemu(bin: &str) -> CheckResult {
    let name = "QEMU";
    let path = match which::which(bin) {
        Ok(p) => p,
        Err(e) => return CheckResult::new(name, CheckStatus::Fail, format!("{bin}: {e}")),
    };
    match Command::new(&path).arg("--version").run_get_string() {
        Ok(out) => {
            let version = out.lines().next().unwrap_or_default().trim();
            CheckResult::new(name, CheckStatus::Pass, format!("{} ({version})", path.display()))
        }
        Err(e) => CheckResult::new(name, CheckStatus::Fail, format!("{e:#}")),
    }
}

fn check_firmware(opts: &VmOpts) -> CheckResult {
    let name = format!("Firmware ({})", opts.boot_mode);
    match Firmware::resolve(opts.boot_mode, &opts.disk.storage) {
        Ok(fw) => match fw.code {
            Some(code) => CheckResult::new(name, CheckStatus::Pass, code.to_string()),
            None => CheckResult::new(name, CheckStatus::Pass, "SeaBIOS (built into QEMU)"),
        },
        Err(e) => CheckResult::new(name, CheckStatus::Fail, format!("{e:#}")),
    }
}

fn check_storage(dir: &Utf8Path) -> CheckResult {
    let name = "Storage";
    if !dir.exists() {
        return CheckResult::new(
            name,
            CheckStatus::Warn,
            format!("{dir} missing, will be created"),
        );
    }
    match tempfile::tempfile_in(dir) {
        Ok(_) => CheckResult::new(name, CheckStatus::Pass, format!("{dir} is writable")),
        Err(e) => CheckResult::new(
            name,
            CheckStatus::Fail,
            format!("{dir} is not writable: {e}; mount a volume there"),
        ),
    }
}

fn check_ports(opts: &VmOpts, sockets: Option<&ListeningSockets>) -> Vec<CheckResult> {
    let mut ports = Vec::new();
    match Display::new(&opts.display) {
        Ok(d) => {
            if d.vnc_enabled() {
                ports.push(("VNC port", d.vnc_port));
            }
            if d.mode == DisplayMode::Web {
                ports.push(("Web port", d.web_port));
            }
        }
        Err(e) => {
            return vec![CheckResult::new("Display", CheckStatus::Fail, format!("{e:#}"))];
        }
    }
    match Network::new(&opts.network) {
        Ok(n) => {
            ports.push(("RDP port", n.rdp_port));
            ports.extend(n.forwards.iter().map(|m| ("Forwarded port", m.host_port)));
        }
        Err(e) => {
            return vec![CheckResult::new("Network", CheckStatus::Fail, format!("{e:#}"))];
        }
    }
    ports
        .into_iter()
        .map(|(name, port)| {
            // RDP is forwarded over UDP as well
            let udp_busy = name == "RDP port" && sockets.is_some_and(|s| s.udp_in_use(port));
            if tcp_port_in_use(sockets, port) || udp_busy {
                CheckResult::new(name, CheckStatus::Fail, format!("{port} is already in use"))
            } else {
                CheckResult::new(name, CheckStatus::Pass, format!("{port} is free"))
            }
        })
        .collect()
}

fn check_websockify(opts: &VmOpts) -> Option<CheckResult> {
    if opts.display.display != DisplayMode::Web {
        return None;
    }
    let name = "websockify";
    let result = match which::which("websockify") {
        Err(e) => CheckResult::new(
            name,
            CheckStatus::Warn,
            format!("{e}; web console unavailable"),
        ),
        Ok(_) if !opts.display.novnc_web.is_dir() => CheckResult::new(
            name,
            CheckStatus::Warn,
            format!("noVNC files missing at {}", opts.display.novnc_web),
        ),
        Ok(path) => CheckResult::new(name, CheckStatus::Pass, path.display().to_string()),
    };
    Some(result)
}

fn check_running(procs: Option<&ProcessTable>, bin: &str) -> CheckResult {
    let name = "Running QEMU";
    let comm = Utf8Path::new(bin).file_name().unwrap_or(bin);
    match procs {
        None => CheckResult::new(name, CheckStatus::Warn, "could not list processes"),
        Some(p) => match p.find(comm).as_slice() {
            [] => CheckResult::new(name, CheckStatus::Pass, "none"),
            pids => CheckResult::new(
                name,
                CheckStatus::Fail,
                format!("{comm} already running (pid {pids:?})"),
            ),
        },
    }
}

fn check_config(opts: &VmOpts) -> CheckResult {
    match VmConfig::resolve(opts) {
        Ok(c) => CheckResult::new(
            "Configuration",
            CheckStatus::Pass,
            format!("{} MiB, {} vCPU, {}", c.memory_mb, opts.cpu.cpu_cores, opts.machine),
        ),
        Err(e) => CheckResult::new("Configuration", CheckStatus::Fail, format!("{e:#}")),
    }
}

/// Run every check against the live host.
pub fn run_checks(opts: &VmOpts) -> Vec<CheckResult> {
    let host = HostFacts::probe();
    let sockets = ListeningSockets::probe();
    let procs = ProcessTable::probe().ok();

    let mut results = vec![
        check_kvm(&host.kvm, opts.kvm.enabled()),
        check_extension(&host.cpu),
        check_nested(&host.cpu, host.nested),
        check_qemu(&opts.qemu_bin),
        check_firmware(opts),
        check_storage(&opts.disk.storage),
        check_config(opts),
    ];
    results.extend(check_ports(opts, sockets.as_ref()));
    results.extend(check_websockify(opts));
    results.push(check_running(procs.as_ref(), &opts.qemu_bin));
    results
}

/// Print the report; returns whether every check avoided `Fail`.
pub fn run(opts: CheckOpts) -> Result<bool> {
    let results = run_checks(&opts.vm);
    if opts.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_header(vec!["CHECK", "STATUS", "DETAIL"]);
        for r in &results {
            table.add_row(vec![r.name.clone(), r.status.to_string(), r.detail.clone()]);
        }
        println!("{table}");
    }
    Ok(results.iter().all(|r| r.status != CheckStatus::Fail))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTEL: &str = "vendor_id\t: GenuineIntel\nflags\t\t: fpu vmx\n";

    #[test]
    fn test_kvm_severity() {
        assert_eq!(check_kvm(&KvmStatus::Ready, true).status, CheckStatus::Pass);
        let r = check_kvm(&KvmStatus::Missing, true);
        assert_eq!(r.status, CheckStatus::Fail);
        assert!(r.detail.contains("--device=/dev/kvm"), "{}", r.detail);
        assert_eq!(check_kvm(&KvmStatus::Missing, false).status, CheckStatus::Warn);
    }

    #[test]
    fn test_nested() {
        let cpu = CpuInfo::parse(INTEL);
        assert_eq!(check_extension(&cpu).status, CheckStatus::Pass);
        assert_eq!(
            check_nested(&cpu, NestedStatus::Enabled).detail,
            "kvm_intel nested=Y"
        );
        let r = check_nested(&cpu, NestedStatus::Disabled);
        assert_eq!(r.status, CheckStatus::Warn);
        assert!(r.detail.contains("options kvm_intel nested=1"));

        let bare = CpuInfo::parse("flags\t: fpu sse2\n");
        assert_eq!(check_extension(&bare).status, CheckStatus::Warn);
        assert_eq!(check_nested(&bare, NestedStatus::Enabled).status, CheckStatus::Warn);
    }

    #[test]
    fn test_ports() {
        let sockets = ListeningSockets::from_ss(
            "tcp   LISTEN 0      4096         0.0.0.0:8006      0.0.0.0:*\n",
        );
        let results = check_ports(&VmOpts::default(), Some(&sockets));
        let summary: Vec<(&str, CheckStatus)> =
            results.iter().map(|r| (r.name.as_str(), r.status)).collect();
        assert_eq!(
            summary,
            vec![
                ("VNC port", CheckStatus::Pass),
                ("Web port", CheckStatus::Fail),
                ("RDP port", CheckStatus::Pass),
            ]
        );
    }

    #[test]
    fn test_rdp_udp_clash() {
        let sockets = ListeningSockets::from_ss(
            "udp   UNCONN 0      0            0.0.0.0:3389      0.0.0.0:*\n",
        );
        let results = check_ports(&VmOpts::default(), Some(&sockets));
        let rdp = results.iter().find(|r| r.name == "RDP port").unwrap();
        assert_eq!(rdp.status, CheckStatus::Fail);
    }

    #[test]
    fn test_running() {
        let procs = ProcessTable::from_ps("  1 tini\n 40 qemu-system-x86\n");
        let r = check_running(Some(&procs), "/usr/bin/qemu-system-x86_64");
        assert_eq!(r.status, CheckStatus::Fail);
        assert!(r.detail.contains("[40]"));
        let r = check_running(Some(&ProcessTable::from_ps("  1 tini\n")), "qemu-system-x86_64");
        assert_eq!(r.status, CheckStatus::Pass);
    }

    #[test]
    fn test_storage() {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap();
        assert_eq!(check_storage(dir).status, CheckStatus::Pass);
        assert_eq!(check_storage(&dir.join("missing")).status, CheckStatus::Warn);
    }

    #[test]
    fn test_missing_qemu_fails() {
        let r = check_qemu("wvk-no-such-emulator");
        assert_eq!(r.status, CheckStatus::Fail);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(CheckStatus::Warn.to_string(), "WARN");
    }
}
