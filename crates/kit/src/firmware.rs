//! OVMF firmware discovery and per-VM NVRAM.
//!
//! Distributions ship OVMF under different directories and file names. We
//! scan a fixed list of (code, vars template) pairs against a fixed list of
//! directories and take the first directory that holds both files of a pair.
//! The vars template is copied into the storage directory the first time it
//! is needed; after that the copy belongs to the guest and is never replaced.

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::qemu::ToQemuArgs;

/// Directories searched for OVMF images, in order.
pub const FIRMWARE_DIRS: &[&str] = &[
    "/usr/share/OVMF",
    "/usr/share/ovmf",
    "/usr/share/edk2/ovmf",
    "/usr/share/edk2/x64",
    "/usr/share/edk2-ovmf/x64",
    "/usr/share/qemu",
];

const UEFI_PAIRS: &[(&str, &str)] = &[
    ("OVMF_CODE_4M.fd", "OVMF_VARS_4M.fd"),
    ("OVMF_CODE.fd", "OVMF_VARS.fd"),
    ("edk2-x86_64-code.fd", "edk2-i386-vars.fd"),
];

const SECURE_PAIRS: &[(&str, &str)] = &[
    ("OVMF_CODE_4M.secboot.fd", "OVMF_VARS_4M.ms.fd"),
    ("OVMF_CODE.secboot.fd", "OVMF_VARS.ms.fd"),
    ("OVMF_CODE.secboot.fd", "OVMF_VARS.secboot.fd"),
    ("edk2-x86_64-secure-code.fd", "edk2-i386-vars.fd"),
];

/// Guest firmware type
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BootMode {
    /// UEFI without secure boot (default)
    #[default]
    Uefi,
    /// UEFI with secure boot and SMM
    Secure,
    /// Legacy BIOS (SeaBIOS built into QEMU)
    Legacy,
}

impl BootMode {
    fn candidates(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Uefi => UEFI_PAIRS,
            Self::Secure => SECURE_PAIRS,
            Self::Legacy => &[],
        }
    }

    /// Secure boot requires SMM on the machine.
    pub fn needs_smm(self) -> bool {
        self == Self::Secure
    }
}

/// A located OVMF code image with its pristine vars template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OvmfPair {
    pub code: Utf8PathBuf,
    pub vars_template: Utf8PathBuf,
}

/// Find the firmware for `mode` under `dirs`. `Ok(None)` for legacy boot.
pub fn locate<S: AsRef<str>>(mode: BootMode, dirs: &[S]) -> Result<Option<OvmfPair>> {
    if mode == BootMode::Legacy {
        return Ok(None);
    }
    for (code, vars) in mode.candidates() {
        for dir in dirs {
            let dir = Utf8Path::new(dir.as_ref());
            let code = dir.join(code);
            let vars_template = dir.join(vars);
            if code.is_file() && vars_template.is_file() {
                debug!("Using firmware {code} with vars template {vars_template}");
                return Ok(Some(OvmfPair {
                    code,
                    vars_template,
                }));
            }
        }
    }
    Err(eyre!(
        "No OVMF firmware for boot mode '{mode}' found in {}",
        dirs.iter().map(|d| d.as_ref()).collect::<Vec<&str>>().join(", ")
    ))
}

/// Firmware as attached to the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Firmware {
    pub mode: BootMode,
    /// `None` for legacy boot
    pub code: Option<Utf8PathBuf>,
    pub vars: Option<Utf8PathBuf>,
    #[serde(skip)]
    vars_template: Option<Utf8PathBuf>,
}

impl Firmware {
    /// Locate firmware and compute where the guest's vars live, without
    /// touching the storage directory.
    pub fn resolve(mode: BootMode, storage: &Utf8Path) -> Result<Self> {
        Self::resolve_from(mode, FIRMWARE_DIRS, storage)
    }

    pub fn resolve_from<S: AsRef<str>>(
        mode: BootMode,
        dirs: &[S],
        storage: &Utf8Path,
    ) -> Result<Self> {
        let Some(pair) = locate(mode, dirs)? else {
            return Ok(Self {
                mode,
                code: None,
                vars: None,
                vars_template: None,
            });
        };
        Ok(Self {
            mode,
            code: Some(pair.code),
            vars: Some(storage.join(format!("{mode}.vars"))),
            vars_template: Some(pair.vars_template),
        })
    }

    /// Copy the vars template into place unless the guest already has one.
    pub fn install_vars(&self) -> Result<()> {
        let (Some(vars), Some(template)) = (&self.vars, &self.vars_template) else {
            return Ok(());
        };
        if vars.exists() {
            debug!("Reusing UEFI variables at {vars}");
            return Ok(());
        }
        info!("Initializing UEFI variables at {vars}");
        std::fs::copy(template, vars).with_context(|| format!("Copying {template} to {vars}"))?;
        Ok(())
    }
}

impl ToQemuArgs for Firmware {
    fn qemu_args(&self) -> Vec<String> {
        let (Some(code), Some(vars)) = (&self.code, &self.vars) else {
            return Vec::new();
        };
        let mut args = vec![
            "-drive".to_owned(),
            format!("if=pflash,format=raw,readonly=on,file={code}"),
            "-drive".to_owned(),
            format!("if=pflash,format=raw,file={vars}"),
        ];
        if self.mode.needs_smm() {
            args.push("-global".into());
            args.push("driver=cfi.pflash01,property=secure,value=on".into());
            // OVMF's SMM build does not support S3 resume
            args.push("-global".into());
            args.push("ICH9-LPC.disable_s3=1".into());
        }
        args
    }
}
