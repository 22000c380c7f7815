//! Integration tests for wvk
//!
//! These drive the built binary and never launch a VM, so they run on hosts
//! without KVM or QEMU.

use camino::{Utf8Path, Utf8PathBuf};

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};
use serde_json::Value;
use xshell::{cmd, Shell};

/// Get the path to the wvk binary, checking WVK_PATH env var first, then falling back to "wvk"
fn get_wvk_command() -> Result<String> {
    if let Ok(path) = std::env::var("WVK_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/wvk", "target/release/wvk"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set WVK_PATH={path} to run using this binary"
        ));
    }
    Ok("wvk".to_owned())
}

/// A shell whose environment describes a VM that needs nothing from the
/// host: TCG, legacy BIOS, no display.
fn hermetic_shell(storage: &Utf8Path) -> Result<Shell> {
    let sh = Shell::new()?;
    sh.set_var("STORAGE", storage);
    sh.set_var("KVM", "N");
    sh.set_var("BOOT_MODE", "legacy");
    sh.set_var("DISPLAY_MODE", "none");
    sh.remove_var("ARGUMENTS");
    sh.remove_var("CPU_FLAGS");
    Ok(sh)
}

fn tempdir() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
    let td = tempfile::tempdir()?;
    let path = Utf8PathBuf::from_path_buf(td.path().to_owned())
        .map_err(|p| eyre!("non-UTF-8 temp path {p:?}"))?;
    Ok((td, path))
}

fn arg_after<'a>(args: &'a [Value], flag: &str) -> Result<&'a str> {
    let idx = args
        .iter()
        .position(|a| a == flag)
        .ok_or_else(|| eyre!("{flag} missing from {args:?}"))?;
    args.get(idx + 1)
        .and_then(Value::as_str)
        .ok_or_else(|| eyre!("{flag} has no value"))
}

fn test_args_json() -> Result<()> {
    let wvk = get_wvk_command()?;
    let (_td, storage) = tempdir()?;
    let sh = hermetic_shell(&storage)?;

    let stdout = cmd!(
        sh,
        "{wvk} args --json --ram-size 2G --cpu-cores 4 --ports 2222:22"
    )
    .read()
    .context("wvk args --json")?;
    let cmd: Value = serde_json::from_str(&stdout).context("Failed to parse JSON output")?;

    let args = cmd["args"]
        .as_array()
        .ok_or_else(|| eyre!("Expected args array in {stdout}"))?;
    assert_eq!(cmd["profile"], "full");
    assert_eq!(arg_after(args, "-machine")?, "q35,accel=tcg");
    assert_eq!(arg_after(args, "-cpu")?, "qemu64");
    assert_eq!(arg_after(args, "-m")?, "2048M");
    assert_eq!(arg_after(args, "-smp")?, "4");
    assert_eq!(arg_after(args, "-display")?, "none");
    assert!(arg_after(args, "-netdev")?.ends_with("hostfwd=tcp::2222-:22"));
    assert!(!args.iter().any(|a| a == "-global"));

    // Planning must not create anything
    if storage.join("data.raw").exists() {
        return Err(eyre!("wvk args created the data disk"));
    }
    Ok(())
}

fn test_args_appends_arguments() -> Result<()> {
    let wvk = get_wvk_command()?;
    let (_td, storage) = tempdir()?;
    let sh = hermetic_shell(&storage)?;
    sh.set_var("ARGUMENTS", "-device 'virtio-rng-pci' -snapshot");

    let line = cmd!(sh, "{wvk} args").read()?;
    if !line.ends_with("-device virtio-rng-pci -snapshot") {
        return Err(eyre!("ARGUMENTS not appended last: {line}"));
    }
    Ok(())
}

fn test_args_rejects_port_clash() -> Result<()> {
    let wvk = get_wvk_command()?;
    let (_td, storage) = tempdir()?;
    let sh = hermetic_shell(&storage)?;

    let output = cmd!(sh, "{wvk} args --rdp-port 2222 --ports 2222:22")
        .ignore_status()
        .output()?;
    if output.status.success() {
        return Err(eyre!("duplicate host port was accepted"));
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.contains("forwarded more than once") {
        return Err(eyre!("unexpected error: {stderr}"));
    }
    Ok(())
}

fn test_config_json() -> Result<()> {
    let wvk = get_wvk_command()?;
    let (_td, storage) = tempdir()?;
    let sh = hermetic_shell(&storage)?;
    sh.set_var("HV", "no");
    sh.set_var("RAM_SIZE", "2G");
    std::fs::write(storage.join("boot.iso"), "")?;

    let stdout = cmd!(sh, "{wvk} config").read()?;
    let config: Value = serde_json::from_str(&stdout)?;
    assert_eq!(config["machine"]["kvm"], false);
    assert_eq!(config["memory_mb"], 2048);
    assert_eq!(config["firmware"]["mode"], "legacy");
    assert_eq!(config["cpu"]["hv"], false);
    assert_eq!(config["disks"]["data"], storage.join("data.raw").as_str());
    assert_eq!(config["disks"]["iso"], storage.join("boot.iso").as_str());
    assert_eq!(config["network"]["adapter"], "e1000e");
    Ok(())
}

fn test_config_rejects_bad_memory() -> Result<()> {
    let wvk = get_wvk_command()?;
    let (_td, storage) = tempdir()?;
    let sh = hermetic_shell(&storage)?;
    sh.set_var("RAM_SIZE", "lots");

    let output = cmd!(sh, "{wvk} config").ignore_status().output()?;
    if output.status.success() {
        return Err(eyre!("RAM_SIZE=lots was accepted"));
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.contains("RAM_SIZE") {
        return Err(eyre!("unexpected error: {stderr}"));
    }
    Ok(())
}

fn test_blank_variables_are_unset() -> Result<()> {
    let wvk = get_wvk_command()?;
    let (_td, storage) = tempdir()?;
    let sh = hermetic_shell(&storage)?;
    for name in ["PORTS", "MAC", "BOOT_ISO", "DEBUG", "CPU_MODEL"] {
        sh.set_var(name, "");
    }

    let stdout = cmd!(sh, "{wvk} args --json")
        .read()
        .context("wvk args with blank variables")?;
    let cmd: Value = serde_json::from_str(&stdout)?;
    let args = cmd["args"]
        .as_array()
        .ok_or_else(|| eyre!("Expected args array in {stdout}"))?;
    assert_eq!(arg_after(args, "-cpu")?, "qemu64");
    assert_eq!(
        arg_after(args, "-netdev")?,
        "user,id=net0,hostfwd=tcp::3389-:3389,hostfwd=udp::3389-:3389"
    );
    assert!(!args
        .iter()
        .any(|a| a.as_str().is_some_and(|a| a.contains("mac="))));
    Ok(())
}

fn test_invalid_toggle() -> Result<()> {
    let wvk = get_wvk_command()?;
    let (_td, storage) = tempdir()?;
    let sh = hermetic_shell(&storage)?;
    sh.set_var("NESTED", "perhaps");

    let output = cmd!(sh, "{wvk} config").ignore_status().output()?;
    if output.status.success() {
        return Err(eyre!("NESTED=perhaps was accepted"));
    }
    Ok(())
}

fn test_guest_script() -> Result<()> {
    let wvk = get_wvk_command()?;
    let sh = Shell::new()?;
    let script = cmd!(sh, "{wvk} guest-script").read()?;
    for needle in ["Get-WindowsOptionalFeature", "HypervisorPresent"] {
        if !script.contains(needle) {
            return Err(eyre!("guest script lacks {needle}"));
        }
    }
    Ok(())
}

fn test_check_json() -> Result<()> {
    let wvk = get_wvk_command()?;
    let (_td, storage) = tempdir()?;
    let sh = hermetic_shell(&storage)?;

    // The exit status depends on the host; only the report shape is checked
    let output = cmd!(sh, "{wvk} check --json").ignore_status().output()?;
    let stdout = String::from_utf8(output.stdout)?;
    let results: Value = serde_json::from_str(&stdout).context("Failed to parse JSON output")?;
    let results = results
        .as_array()
        .ok_or_else(|| eyre!("Expected JSON array in output, got: {stdout}"))?;
    let any_fail = results.iter().any(|r| r["status"] == "fail");
    if any_fail == output.status.success() {
        return Err(eyre!("exit status does not reflect failed checks"));
    }
    for name in ["KVM device", "Storage", "RDP port", "Running QEMU"] {
        if !results.iter().any(|r| r["name"] == name) {
            return Err(eyre!("check '{name}' missing from report"));
        }
    }
    Ok(())
}

const TESTS: &[(&str, fn() -> Result<()>)] = &[
    ("args_json", test_args_json),
    ("args_appends_arguments", test_args_appends_arguments),
    ("args_rejects_port_clash", test_args_rejects_port_clash),
    ("config_json", test_config_json),
    ("config_rejects_bad_memory", test_config_rejects_bad_memory),
    ("blank_variables_are_unset", test_blank_variables_are_unset),
    ("invalid_toggle", test_invalid_toggle),
    ("guest_script", test_guest_script),
    ("check_json", test_check_json),
];

fn main() {
    // Integration tests are only supported on Linux
    if std::env::consts::OS != "linux" {
        eprintln!(
            "Integration tests are only supported on Linux (current OS: {})",
            std::env::consts::OS
        );
        eprintln!("Skipping all integration tests.");
        std::process::exit(0);
    }

    let args = Arguments::from_args();

    let tests: Vec<Trial> = TESTS
        .iter()
        .map(|&(name, f)| Trial::test(name, move || f().map_err(|e| format!("{e:?}").into())))
        .collect();

    libtest_mimic::run(&args, tests).exit();
}
