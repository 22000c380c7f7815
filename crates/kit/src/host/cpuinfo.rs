use std::collections::BTreeSet;
use std::fmt;

use camino::Utf8Path;
use color_eyre::eyre::Context;
use color_eyre::Result;
use serde::Serialize;

const PROC_CPUINFO: &str = "/proc/cpuinfo";

/// Hardware virtualization extension advertised by the host CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VirtExtension {
    /// Intel VT-x
    Vmx,
    /// AMD-V
    Svm,
}

impl VirtExtension {
    /// The `-cpu` sub-flag that exposes this extension to the guest.
    pub fn cpu_flag(self) -> &'static str {
        match self {
            Self::Vmx => "+vmx",
            Self::Svm => "+svm",
        }
    }

    /// Name of the vendor-specific KVM module.
    pub fn kvm_module(self) -> &'static str {
        match self {
            Self::Vmx => "kvm_intel",
            Self::Svm => "kvm_amd",
        }
    }
}

impl fmt::Display for VirtExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vmx => f.write_str("vmx (Intel VT-x)"),
            Self::Svm => f.write_str("svm (AMD-V)"),
        }
    }
}

/// The parts of `/proc/cpuinfo` we care about.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuInfo {
    pub vendor: Option<String>,
    pub model_name: Option<String>,
    pub processors: usize,
    pub flags: BTreeSet<String>,
}

impl CpuInfo {
    pub fn load() -> Result<Self> {
        let text = std::fs::read_to_string(PROC_CPUINFO)
            .with_context(|| format!("Reading {PROC_CPUINFO}"))?;
        Ok(Self::parse(&text))
    }

    /// Parse cpuinfo text. Vendor, model and flags are taken from the first
    /// processor block; the processor count covers all of them.
    pub fn parse(text: &str) -> Self {
        let mut info = CpuInfo::default();
        let mut seen_flags = false;

        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "processor" => info.processors += 1,
                "vendor_id" if info.vendor.is_none() => info.vendor = Some(value.to_owned()),
                "model name" if info.model_name.is_none() => {
                    info.model_name = Some(value.to_owned())
                }
                "flags" if !seen_flags => {
                    info.flags = value.split_whitespace().map(str::to_owned).collect();
                    seen_flags = true;
                }
                _ => {}
            }
        }
        info
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    /// `vmx` wins if a (virtual) CPU claims both.
    pub fn virt_extension(&self) -> Option<VirtExtension> {
        if self.has_flag("vmx") {
            Some(VirtExtension::Vmx)
        } else if self.has_flag("svm") {
            Some(VirtExtension::Svm)
        } else {
            None
        }
    }

    /// True when the host itself is a virtual machine.
    pub fn is_virtualized(&self) -> bool {
        self.has_flag("hypervisor")
    }
}

/// State of the `nested` parameter of the vendor KVM module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NestedStatus {
    Enabled,
    Disabled,
    /// Module not loaded or parameter unreadable
    Unknown,
}

/// Read `/sys/module/<kvm_intel|kvm_amd>/parameters/nested`.
pub fn nested_status(ext: VirtExtension) -> NestedStatus {
    let path = format!("/sys/module/{}/parameters/nested", ext.kvm_module());
    nested_status_at(Utf8Path::new(&path))
}

pub(crate) fn nested_status_at(path: &Utf8Path) -> NestedStatus {
    match std::fs::read_to_string(path) {
        Ok(v) => match v.trim() {
            "Y" | "y" | "1" => NestedStatus::Enabled,
            _ => NestedStatus::Disabled,
        },
        Err(e) => {
            tracing::debug!("Reading {path}: {e}");
            NestedStatus::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTEL: &str = "\
processor\t: 0
vendor_id\t: GenuineIntel
model name\t: Intel(R) Core(TM) i7-10700 CPU @ 2.90GHz
flags\t\t: fpu vme de pse tsc msr vmx est tm2 ssse3 hypervisor
bugs\t\t: spectre_v1

processor\t: 1
vendor_id\t: GenuineIntel
model name\t: Intel(R) Core(TM) i7-10700 CPU @ 2.90GHz
flags\t\t: fpu vme de pse tsc msr vmx est tm2 ssse3 hypervisor
";

    const AMD: &str = "\
processor\t: 0
vendor_id\t: AuthenticAMD
model name\t: AMD Ryzen 9 5950X 16-Core Processor
flags\t\t: fpu vme de pse tsc msr svm extapic
";

    #[test]
    fn test_parse_intel() {
        let info = CpuInfo::parse(INTEL);
        assert_eq!(info.vendor.as_deref(), Some("GenuineIntel"));
        assert_eq!(info.processors, 2);
        assert_eq!(info.virt_extension(), Some(VirtExtension::Vmx));
        assert!(info.is_virtualized());
        assert!(info.has_flag("ssse3"));
        assert!(!info.has_flag("bugs"));
    }

    #[test]
    fn test_parse_amd() {
        let info = CpuInfo::parse(AMD);
        assert_eq!(info.virt_extension(), Some(VirtExtension::Svm));
        assert_eq!(
            info.model_name.as_deref(),
            Some("AMD Ryzen 9 5950X 16-Core Processor")
        );
        assert!(!info.is_virtualized());
    }

    #[test]
    fn test_no_extension() {
        let info = CpuInfo::parse("processor : 0\nflags : fpu sse2\n");
        assert_eq!(info.virt_extension(), None);
        assert_eq!(CpuInfo::parse("").processors, 0);
    }

    #[test]
    fn test_nested_status_at() {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let p = dir.join("nested");

        assert_eq!(nested_status_at(&p), NestedStatus::Unknown);
        std::fs::write(&p, "Y\n").unwrap();
        assert_eq!(nested_status_at(&p), NestedStatus::Enabled);
        std::fs::write(&p, "1\n").unwrap();
        assert_eq!(nested_status_at(&p), NestedStatus::Enabled);
        std::fs::write(&p, "N\n").unwrap();
        assert_eq!(nested_status_at(&p), NestedStatus::Disabled);
    }
}
