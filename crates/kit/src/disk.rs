//! Data disk and installer media.

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, ValueEnum};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command_run::CommandRun;
use crate::qemu::ToQemuArgs;
use crate::utils::parse_size;

const DEFAULT_ISO_NAME: &str = "boot.iso";

/// Supported disk image formats
#[derive(
    Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Format {
    /// Raw disk image format (default)
    #[default]
    Raw,
    /// QEMU Copy On Write 2 format
    Qcow2,
}

/// How the data disk is presented to the guest
#[derive(
    Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiskInterface {
    /// NVMe controller; Windows ships a driver (default)
    #[default]
    Nvme,
    /// AHCI/SATA disk
    Ide,
    /// virtio-blk; needs the virtio-win drivers in the guest
    Virtio,
}

/// Storage options
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct DiskOpts {
    #[clap(
        long,
        env = "STORAGE",
        default_value = "/storage",
        help = "Directory holding the data disk, UEFI variables and installer ISO"
    )]
    pub storage: Utf8PathBuf,

    #[clap(
        long,
        env = "DISK_SIZE",
        default_value = "64G",
        help = "Data disk size (e.g. 64G, 512000M); existing disks are grown, never shrunk"
    )]
    pub disk_size: String,

    #[clap(long, env = "DISK_FMT", default_value_t = Format::Raw, help = "Data disk image format")]
    pub disk_fmt: Format,

    #[clap(
        long,
        env = "DISK_TYPE",
        default_value_t = DiskInterface::Nvme,
        help = "Controller the data disk is attached to"
    )]
    pub disk_type: DiskInterface,

    #[clap(
        long,
        env = "BOOT_ISO",
        help = "Installer ISO (defaults to boot.iso in the storage directory, if present)"
    )]
    pub boot_iso: Option<Utf8PathBuf>,
}

impl Default for DiskOpts {
    fn default() -> Self {
        Self {
            storage: "/storage".into(),
            disk_size: "64G".into(),
            disk_fmt: Format::Raw,
            disk_type: DiskInterface::Nvme,
            boot_iso: None,
        }
    }
}

impl DiskOpts {
    pub fn data_disk_path(&self) -> Utf8PathBuf {
        self.storage.join(format!("data.{}", self.disk_fmt))
    }

    /// Explicit `BOOT_ISO` must exist; the default location is optional.
    pub fn resolve_boot_iso(&self) -> Result<Option<Utf8PathBuf>> {
        match self.boot_iso.as_ref().filter(|p| !p.as_str().is_empty()) {
            Some(iso) if iso.is_file() => Ok(Some(iso.clone())),
            Some(iso) => Err(eyre!("Boot ISO {iso} does not exist")),
            None => {
                let iso = self.storage.join(DEFAULT_ISO_NAME);
                Ok(iso.is_file().then_some(iso))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct QemuImgInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
}

fn current_size(path: &Utf8Path, format: Format) -> Result<u64> {
    match format {
        Format::Raw => Ok(std::fs::metadata(path)
            .with_context(|| format!("Querying {path}"))?
            .len()),
        Format::Qcow2 => {
            let info: QemuImgInfo = Command::new("qemu-img")
                .args(["info", "--output=json", "-f", "qcow2"])
                .arg(path)
                .run_and_parse_json()?;
            Ok(info.virtual_size)
        }
    }
}

/// Create the data disk if it is missing and grow it if `DISK_SIZE` went up.
pub fn ensure_data_disk(opts: &DiskOpts) -> Result<Utf8PathBuf> {
    let path = opts.data_disk_path();
    let size = parse_size(&opts.disk_size)
        .with_context(|| format!("Invalid DISK_SIZE '{}'", opts.disk_size))?;

    if !path.exists() {
        info!("Creating {} data disk {path} ({})", opts.disk_fmt, opts.disk_size);
        match opts.disk_fmt {
            Format::Raw => {
                // Sparse file; space is only allocated as the guest writes
                let file = std::fs::File::create(&path)
                    .with_context(|| format!("Creating {path}"))?;
                file.set_len(size)?;
            }
            Format::Qcow2 => {
                Command::new("qemu-img")
                    .args(["create", "-f", "qcow2"])
                    .arg(&path)
                    .arg(size.to_string())
                    .run()?;
            }
        }
        return Ok(path);
    }

    let current = current_size(&path, opts.disk_fmt)?;
    debug!("Existing data disk {path}: {current} bytes, requested {size}");
    if size > current {
        info!("Growing data disk {path} from {current} to {size} bytes");
        match opts.disk_fmt {
            Format::Raw => std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .and_then(|f| f.set_len(size))
                .with_context(|| format!("Resizing {path}"))?,
            Format::Qcow2 => Command::new("qemu-img")
                .args(["resize", "-f", "qcow2"])
                .arg(&path)
                .arg(size.to_string())
                .run()?,
        }
    } else if size < current {
        warn!(
            "DISK_SIZE {} is smaller than the existing disk ({current} bytes); shrinking is not supported",
            opts.disk_size
        );
    }
    Ok(path)
}

/// Disks attached to the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskLayout {
    pub data: Utf8PathBuf,
    pub format: Format,
    pub interface: DiskInterface,
    pub iso: Option<Utf8PathBuf>,
}

impl DiskLayout {
    /// Resolve paths without creating anything.
    pub fn plan(opts: &DiskOpts) -> Result<Self> {
        Ok(Self {
            data: opts.data_disk_path(),
            format: opts.disk_fmt,
            interface: opts.disk_type,
            iso: opts.resolve_boot_iso()?,
        })
    }
}

impl ToQemuArgs for DiskLayout {
    fn qemu_args(&self) -> Vec<String> {
        let device = match self.interface {
            DiskInterface::Nvme => "nvme,drive=data0,serial=data0",
            DiskInterface::Ide => "ide-hd,drive=data0",
            DiskInterface::Virtio => "virtio-blk-pci,drive=data0",
        };
        let mut args = vec![
            "-drive".to_owned(),
            format!(
                "file={},if=none,id=data0,format={},discard=unmap",
                self.data, self.format
            ),
            "-device".to_owned(),
            format!("{device},bootindex=1"),
        ];
        if let Some(iso) = &self.iso {
            args.extend([
                "-drive".to_owned(),
                format!("file={iso},if=none,id=cdrom0,format=raw,media=cdrom,readonly=on"),
                "-device".to_owned(),
                "ide-cd,drive=cdrom0,bootindex=2".to_owned(),
            ]);
        }
        args
    }
}
