//! The container entrypoint: prepare the host, launch QEMU and supervise it
//! until the guest powers off or the container is stopped.
//!
//! QEMU refuses to start when the host kernel cannot provide part of the
//! requested CPU flag set, which happens routinely with Hyper-V
//! enlightenments on older kernels or when running nested. When QEMU exits
//! within [`STARTUP_GRACE`] we walk down the [`CpuProfile`] ladder and try
//! again with fewer flags.

use std::os::unix::process::ExitStatusExt as _;
use std::process::ExitStatus;
use std::time::Duration;

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::process::Child;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use crate::cpu::CpuProfile;
use crate::host::{
    tcp_port_in_use, tcp_port_listening, HostFacts, ListeningSockets, NestedStatus, ProcessTable,
};
use crate::monitor;
use crate::qemu::{QemuCommand, VmConfig, VmOpts};
use crate::utils::wait_for_readiness;

/// How long QEMU has to stay up before its CPU flags count as accepted.
pub const STARTUP_GRACE: Duration = Duration::from_secs(3);

const VNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of the startup phase.
#[derive(Debug)]
pub enum Launch {
    /// QEMU survived the grace period
    Running { child: Child, profile: CpuProfile },
    /// QEMU exited cleanly before the grace period was over
    Exited(ExitStatus),
}

/// Launch QEMU with `build(profile)`, falling back to the next profile when
/// it fails during startup.
pub async fn launch_with_fallback<F>(mut build: F, grace: Duration) -> Result<Launch>
where
    F: FnMut(CpuProfile) -> QemuCommand,
{
    let mut profile = CpuProfile::Full;
    loop {
        let cmd = build(profile);
        info!("Starting QEMU with the {profile} CPU profile");
        let mut child = cmd
            .to_command()
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to execute {}", cmd.program))?;

        let status = match tokio::time::timeout(grace, child.wait()).await {
            Err(_) => return Ok(Launch::Running { child, profile }),
            Ok(status) => status.context("Waiting for QEMU")?,
        };
        if status.success() {
            return Ok(Launch::Exited(status));
        }
        match profile.fallback() {
            Some(next) => {
                warn!(
                    "QEMU exited during startup ({status}); retrying with the {next} CPU profile"
                );
                profile = next;
            }
            None => {
                return Err(eyre!(
                    "QEMU exited during startup ({status}) with every CPU profile"
                ))
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

async fn wait_optional(child: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match child {
        Some(c) => c.wait().await,
        None => std::future::pending().await,
    }
}

/// Checks that must pass before anything is created or launched.
fn preflight(opts: &VmOpts, host: &HostFacts) -> Result<()> {
    if opts.kvm.enabled() {
        if !host.kvm.is_ready() {
            let hint = host.kvm.hint().unwrap_or_default();
            return Err(eyre!("KVM acceleration unavailable: {}; {hint}", host.kvm));
        }
    } else {
        warn!("KVM disabled, the guest will run under TCG emulation and be very slow");
    }

    if opts.cpu.nested.enabled() {
        match (host.cpu.virt_extension(), host.nested) {
            (None, _) => warn!("Host CPU has no vmx/svm flag; nested virtualization will not work"),
            (Some(ext), NestedStatus::Disabled) => warn!(
                "Nested virtualization is disabled in {}; enable it on the host with 'options {} nested=1'",
                ext.kvm_module(),
                ext.kvm_module()
            ),
            (Some(_), _) => {}
        }
    }

    let name = Utf8Path::new(&opts.qemu_bin)
        .file_name()
        .unwrap_or(opts.qemu_bin.as_str());
    match ProcessTable::probe() {
        Ok(procs) => {
            let pids = procs.find(name);
            if !pids.is_empty() {
                return Err(eyre!("{name} is already running (pid {pids:?})"));
            }
        }
        Err(e) => debug!("Skipping process check: {e:#}"),
    }

    which::which(&opts.qemu_bin)
        .with_context(|| format!("QEMU binary '{}' not found", opts.qemu_bin))?;
    Ok(())
}

fn check_ports(config: &VmConfig) -> Result<()> {
    let sockets = ListeningSockets::probe();
    for port in config.host_ports() {
        if tcp_port_in_use(sockets.as_ref(), port) {
            return Err(eyre!("Host port {port} is already in use"));
        }
    }
    Ok(())
}

/// Make sure the host ports are free, then create the vars file and data
/// disk. Nothing is written when a port is taken.
fn claim_host(config: &VmConfig, opts: &VmOpts) -> Result<()> {
    check_ports(config)?;
    config.prepare(&opts.disk)
}

async fn start_websockify(config: &VmConfig) -> Option<Child> {
    let args = config.display.websockify_args()?;
    let vnc_port = config.display.vnc_port;

    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner} {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(120));
    match wait_for_readiness(
        pb,
        "Waiting for the VNC server",
        || async move { Ok(tcp_port_listening(vnc_port).await) },
        VNC_TIMEOUT,
        Duration::from_millis(250),
    )
    .await
    {
        Ok((elapsed, pb)) => {
            pb.finish_and_clear();
            debug!("VNC listening after {}ms", elapsed.as_millis());
        }
        Err(e) => {
            warn!("VNC server not reachable on port {vnc_port}: {e}; web console disabled");
            return None;
        }
    }

    let spawned = which::which("websockify")
        .context("websockify not found")
        .and_then(|bin| {
            debug!("exec: {bin:?} {args:?}");
            tokio::process::Command::new(bin)
                .args(&args)
                .kill_on_drop(true)
                .spawn()
                .context("Failed to execute websockify")
        });
    match spawned {
        Ok(child) => {
            info!(
                "Web console: http://localhost:{}/vnc.html",
                config.display.web_port
            );
            Some(child)
        }
        Err(e) => {
            warn!("{e:#}; web console disabled");
            None
        }
    }
}

/// Ask the guest to power off and give it `timeout` to do so. QEMU is
/// killed right away when the request cannot be delivered.
async fn shutdown(qemu: &mut Child, monitor_path: &Utf8Path, timeout: Duration) -> Result<i32> {
    let timeout = match monitor::send_command(monitor_path, "system_powerdown").await {
        Ok(_) => {
            info!("Shutting down Windows, waiting up to {}s", timeout.as_secs());
            timeout
        }
        Err(e) => {
            warn!("{e:#}; cannot ask the guest to power off");
            Duration::ZERO
        }
    };
    match tokio::time::timeout(timeout, qemu.wait()).await {
        Ok(status) => {
            let status = status.context("Waiting for QEMU")?;
            info!("QEMU exited: {status}");
            Ok(exit_code(status))
        }
        Err(_) => {
            warn!(
                "Guest did not power off within {}s, killing QEMU",
                timeout.as_secs()
            );
            qemu.kill().await.context("Killing QEMU")?;
            Ok(1)
        }
    }
}

/// Run the VM; returns the process exit code.
pub async fn run(opts: VmOpts) -> Result<i32> {
    std::fs::create_dir_all(&opts.disk.storage)
        .with_context(|| format!("Creating storage directory {}", opts.disk.storage))?;

    let host = HostFacts::probe();
    preflight(&opts, &host)?;

    let config = VmConfig::resolve(&opts)?;
    claim_host(&config, &opts)?;

    if let Some(dir) = config.monitor.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir}"))?;
    }
    if config.monitor.exists() {
        debug!("Removing stale monitor socket {}", config.monitor);
        std::fs::remove_file(&config.monitor)
            .with_context(|| format!("Removing {}", config.monitor))?;
    }

    let mut sigterm = signal(SignalKind::terminate()).context("Installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Installing SIGINT handler")?;

    let launch = launch_with_fallback(
        |profile| QemuCommand::build(&config, &host, profile),
        STARTUP_GRACE,
    )
    .await?;
    let (mut qemu, profile) = match launch {
        Launch::Running { child, profile } => (child, profile),
        Launch::Exited(status) => {
            info!("QEMU exited: {status}");
            return Ok(exit_code(status));
        }
    };
    info!("Windows is starting ({profile} CPU profile)");
    info!("RDP: localhost:{}", config.network.rdp_port);

    let mut websockify = start_websockify(&config).await;
    let timeout = Duration::from_secs(opts.shutdown_timeout);

    loop {
        tokio::select! {
            status = qemu.wait() => {
                let status = status.context("Waiting for QEMU")?;
                info!("QEMU exited: {status}");
                if let Some(mut ws) = websockify.take() {
                    let _ = ws.kill().await;
                }
                return Ok(exit_code(status));
            }
            _ = sigterm.recv() => {
                return shutdown(&mut qemu, &config.monitor, timeout).await;
            }
            _ = sigint.recv() => {
                return shutdown(&mut qemu, &config.monitor, timeout).await;
            }
            status = wait_optional(&mut websockify) => {
                match status {
                    Ok(s) => warn!("websockify exited ({s}); web console unavailable"),
                    Err(e) => warn!("websockify: {e}"),
                }
                websockify = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake emulator that only starts once the flags contain no
    /// Hyper-V enlightenments.
    fn fake(profile: CpuProfile) -> QemuCommand {
        let flags = match profile {
            CpuProfile::Full => "host,+vmx,hv_relaxed,hv_evmcs",
            CpuProfile::Reduced => "host,+vmx,hv_relaxed",
            CpuProfile::Plain => "host",
        };
        QemuCommand {
            program: "sh".into(),
            args: vec![
                "-c".into(),
                r#"case "$0" in *hv_*) exit 1;; esac; exec sleep 30"#.into(),
                flags.into(),
            ],
            profile,
        }
    }

    #[tokio::test]
    async fn test_fallback_to_plain() {
        let mut tried = Vec::new();
        let launch = launch_with_fallback(
            |p| {
                tried.push(p);
                fake(p)
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let Launch::Running { mut child, profile } = launch else {
            panic!("expected a running child");
        };
        assert_eq!(profile, CpuProfile::Plain);
        assert_eq!(
            tried,
            vec![CpuProfile::Full, CpuProfile::Reduced, CpuProfile::Plain]
        );
        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_ladder_exhausted() {
        let err = launch_with_fallback(
            |profile| QemuCommand {
                program: "sh".into(),
                args: vec!["-c".into(), "exit 1".into()],
                profile,
            },
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("every CPU profile"));
    }

    #[tokio::test]
    async fn test_clean_exit_is_not_retried() {
        let mut calls = 0;
        let launch = launch_with_fallback(
            |profile| {
                calls += 1;
                QemuCommand {
                    program: "true".into(),
                    args: Vec::new(),
                    profile,
                }
            },
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert!(matches!(launch, Launch::Exited(s) if s.success()));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_busy_port_leaves_storage_untouched() {
        let td = tempfile::tempdir().unwrap();
        let busy = std::net::TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let mut opts = VmOpts {
            kvm: crate::common_opts::Toggle(false),
            boot_mode: crate::firmware::BootMode::Legacy,
            ..Default::default()
        };
        opts.disk.storage = camino::Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        opts.display.display = crate::display::DisplayMode::None;
        opts.network.rdp_port = busy.local_addr().unwrap().port();

        let config = VmConfig::resolve(&opts).unwrap();
        let err = claim_host(&config, &opts).unwrap_err();
        assert!(err.to_string().contains("already in use"));
        assert!(!opts.disk.data_disk_path().exists());
    }

    #[test]
    fn test_exit_code() {
        use std::process::Command;
        let status = Command::new("sh").args(["-c", "exit 7"]).status().unwrap();
        assert_eq!(exit_code(status), 7);
        let status = Command::new("sh")
            .args(["-c", "kill -TERM $$"])
            .status()
            .unwrap();
        assert_eq!(exit_code(status), 128 + 15);
    }

    /// A monitor that answers one command, then runs `on_command`.
    fn fake_monitor(
        dir: &tempfile::TempDir,
        on_command: impl FnOnce() + Send + 'static,
    ) -> (camino::Utf8PathBuf, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("mon")).unwrap();
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = stream.into_split();
            wr.write_all(b"QEMU monitor\r\n(qemu) ").await.unwrap();
            let mut line = String::new();
            tokio::io::BufReader::new(rd)
                .read_line(&mut line)
                .await
                .unwrap();
            wr.write_all(format!("{}\r\n(qemu) ", line.trim_end()).as_bytes())
                .await
                .unwrap();
            on_command();
            line
        });
        (path, server)
    }

    fn sleeper() -> Child {
        tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_passes_exit_code_through() {
        let td = tempfile::tempdir().unwrap();
        let mut qemu = sleeper();
        let pid = qemu.id().unwrap().to_string();
        // The guest "powers off" by ending the emulator with SIGTERM
        let (path, server) = fake_monitor(&td, move || {
            std::process::Command::new("kill")
                .args(["-TERM", &pid])
                .status()
                .unwrap();
        });

        let code = shutdown(&mut qemu, &path, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(code, 128 + 15);
        assert_eq!(server.await.unwrap(), "system_powerdown\n");
    }

    #[tokio::test]
    async fn test_shutdown_kills_after_timeout() {
        let td = tempfile::tempdir().unwrap();
        let mut qemu = sleeper();
        let (path, server) = fake_monitor(&td, || {});

        let start = std::time::Instant::now();
        let code = shutdown(&mut qemu, &path, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(code, 1);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(qemu.try_wait().unwrap().is_some());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_without_monitor_kills_immediately() {
        let mut qemu = sleeper();
        let start = std::time::Instant::now();
        let code = shutdown(
            &mut qemu,
            Utf8Path::new("/nonexistent/wvk.monitor"),
            Duration::from_secs(110),
        )
        .await
        .unwrap();
        assert_eq!(code, 1);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_shutdown_without_monitor_reports_finished_qemu() {
        let mut qemu = tokio::process::Command::new("sh")
            .args(["-c", "exit 4"])
            .spawn()
            .unwrap();
        // Let it finish before the monitor turns out to be gone
        tokio::time::sleep(Duration::from_millis(200)).await;
        let code = shutdown(
            &mut qemu,
            Utf8Path::new("/nonexistent/wvk.monitor"),
            Duration::from_secs(110),
        )
        .await
        .unwrap();
        assert_eq!(code, 4);
    }
}
