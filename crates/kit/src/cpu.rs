//! Construction of the `-cpu` argument.
//!
//! The string is `model,flag,flag,...`. Flags come from three places, in
//! order: the nested virtualization extension of the host (`+vmx`/`+svm`),
//! the Hyper-V enlightenments, and the user supplied `CPU_FLAGS`. A flag is
//! never emitted twice; see [`CpuModel::push_flag`].

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::common_opts::Toggle;
use crate::host::VirtExtension;
use crate::qemu::ToQemuArgs;

/// CPU model QEMU can emulate without hardware acceleration.
pub const TCG_DEFAULT_MODEL: &str = "qemu64";

const HV_SPINLOCKS: &str = "hv_spinlocks=0x1fff";

/// Enlightenments that every Windows build since 7 understands.
const HV_BASIC: &[&str] = &["hv_relaxed", "hv_vapic", HV_SPINLOCKS, "hv_time"];

/// The full set, in the order QEMU documents them.
const HV_FULL: &[&str] = &[
    "hv_relaxed",
    "hv_vapic",
    HV_SPINLOCKS,
    "hv_vpindex",
    "hv_runtime",
    "hv_time",
    "hv_synic",
    "hv_stimer",
    "hv_reset",
    "hv_frequencies",
    "hv_reenlightenment",
    "hv_tlbflush",
    "hv_ipi",
];

/// Enlightened VMCS; Intel only, needs `hv_vapic` and a nested capable host.
const HV_EVMCS: &str = "hv_evmcs";

/// CPU configuration options
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct CpuOpts {
    #[clap(long, env = "CPU_CORES", default_value_t = 2, help = "Number of vCPUs")]
    pub cpu_cores: u32,

    #[clap(
        long,
        env = "CPU_MODEL",
        default_value = "host",
        help = "QEMU CPU model (host passthrough requires KVM)"
    )]
    pub cpu_model: String,

    #[clap(
        long,
        env = "CPU_FLAGS",
        default_value = "",
        help = "Extra comma-separated -cpu flags, appended last"
    )]
    pub cpu_flags: String,

    #[clap(
        long,
        env = "HV",
        default_value = "Y",
        help = "Expose Hyper-V enlightenments to the guest"
    )]
    pub hv: Toggle,

    #[clap(
        long,
        env = "NESTED",
        default_value = "Y",
        help = "Expose vmx/svm so the guest can run its own hypervisor"
    )]
    pub nested: Toggle,
}

impl Default for CpuOpts {
    fn default() -> Self {
        Self {
            cpu_cores: 2,
            cpu_model: "host".into(),
            cpu_flags: String::new(),
            hv: Toggle(true),
            nested: Toggle(true),
        }
    }
}

/// How much of the flag set to emit. QEMU refuses to start when the host
/// kernel cannot provide a requested enlightenment, so the launcher walks
/// down this ladder until one works.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CpuProfile {
    Full,
    Reduced,
    Plain,
}

impl CpuProfile {
    pub fn fallback(self) -> Option<Self> {
        match self {
            Self::Full => Some(Self::Reduced),
            Self::Reduced => Some(Self::Plain),
            Self::Plain => None,
        }
    }
}

/// Host facts the flag set depends on.
#[derive(Debug, Clone, Copy)]
pub struct CpuHost {
    pub kvm: bool,
    pub extension: Option<VirtExtension>,
    /// Nested virtualization enabled in the host KVM module
    pub nested_capable: bool,
}

/// A rendered `-cpu` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuModel {
    pub model: String,
    pub flags: Vec<String>,
}

/// `+vmx`, `vmx=on` and `-vmx` all name the same property.
fn flag_key(flag: &str) -> &str {
    let flag = flag.trim_start_matches(['+', '-']);
    flag.split_once('=').map_or(flag, |(k, _)| k)
}

impl CpuModel {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            flags: Vec::new(),
        }
    }

    /// Add a flag. A flag naming a property already present replaces it in
    /// place, so the last writer wins and nothing is emitted twice.
    pub fn push_flag(&mut self, flag: &str) {
        let flag = flag.trim();
        if flag.is_empty() {
            return;
        }
        let key = flag_key(flag);
        match self.flags.iter_mut().find(|f| flag_key(f) == key) {
            Some(existing) => *existing = flag.to_owned(),
            None => self.flags.push(flag.to_owned()),
        }
    }

    pub fn has_flag(&self, key: &str) -> bool {
        self.flags.iter().any(|f| flag_key(f) == key)
    }

    pub fn render(&self) -> String {
        std::iter::once(self.model.as_str())
            .chain(self.flags.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Build the model and flag set for `profile`.
    pub fn build(opts: &CpuOpts, host: &CpuHost, profile: CpuProfile) -> Self {
        let model = opts.cpu_model.trim();
        let model = if !host.kvm && matches!(model, "host" | "max" | "") {
            warn!("CPU model '{model}' needs KVM, falling back to {TCG_DEFAULT_MODEL}");
            TCG_DEFAULT_MODEL
        } else if model.is_empty() {
            "host"
        } else {
            model
        };
        let mut cpu = CpuModel::new(model);

        let accelerated = host.kvm && profile != CpuProfile::Plain;

        if opts.nested.enabled() && accelerated {
            match host.extension {
                Some(ext) => cpu.push_flag(ext.cpu_flag()),
                None => warn!("Host CPU exposes neither vmx nor svm; nested virtualization unavailable"),
            }
        }

        if opts.hv.enabled() {
            if !host.kvm {
                warn!("Hyper-V enlightenments need KVM, not emitting them");
            } else {
                let set = match profile {
                    CpuProfile::Full => HV_FULL,
                    CpuProfile::Reduced => HV_BASIC,
                    CpuProfile::Plain => &[],
                };
                for flag in set {
                    cpu.push_flag(flag);
                }
                if profile == CpuProfile::Full
                    && opts.nested.enabled()
                    && host.nested_capable
                    && host.extension == Some(VirtExtension::Vmx)
                    && cpu.has_flag("hv_vapic")
                {
                    cpu.push_flag(HV_EVMCS);
                }
            }
        }

        for flag in opts.cpu_flags.split(',') {
            cpu.push_flag(flag);
        }

        cpu
    }
}

impl ToQemuArgs for CpuModel {
    fn qemu_args(&self) -> Vec<String> {
        vec!["-cpu".into(), self.render()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intel() -> CpuHost {
        CpuHost {
            kvm: true,
            extension: Some(VirtExtension::Vmx),
            nested_capable: true,
        }
    }

    #[test]
    fn test_full_profile_on_intel() {
        let cpu = CpuModel::build(&CpuOpts::default(), &intel(), CpuProfile::Full);
        let rendered = cpu.render();
        assert!(rendered.starts_with("host,+vmx,hv_relaxed,hv_vapic,hv_spinlocks=0x1fff"));
        assert!(rendered.ends_with(",hv_ipi,hv_evmcs"));
        assert_eq!(cpu.flags.len(), 1 + HV_FULL.len() + 1);
    }

    #[test]
    fn test_amd_gets_svm_and_no_evmcs() {
        let host = CpuHost {
            extension: Some(VirtExtension::Svm),
            ..intel()
        };
        let cpu = CpuModel::build(&CpuOpts::default(), &host, CpuProfile::Full);
        assert!(cpu.has_flag("svm"));
        assert!(!cpu.has_flag("vmx"));
        assert!(!cpu.has_flag(HV_EVMCS));
    }

    #[test]
    fn test_evmcs_needs_nested_module() {
        let host = CpuHost {
            nested_capable: false,
            ..intel()
        };
        let cpu = CpuModel::build(&CpuOpts::default(), &host, CpuProfile::Full);
        assert!(cpu.has_flag("vmx"));
        assert!(!cpu.has_flag(HV_EVMCS));
    }

    #[test]
    fn test_reduced_and_plain_profiles() {
        let reduced = CpuModel::build(&CpuOpts::default(), &intel(), CpuProfile::Reduced);
        assert_eq!(
            reduced.render(),
            "host,+vmx,hv_relaxed,hv_vapic,hv_spinlocks=0x1fff,hv_time"
        );
        let plain = CpuModel::build(&CpuOpts::default(), &intel(), CpuProfile::Plain);
        assert_eq!(plain.render(), "host");
    }

    #[test]
    fn test_no_kvm_falls_back_to_tcg_model() {
        let host = CpuHost {
            kvm: false,
            ..intel()
        };
        let cpu = CpuModel::build(&CpuOpts::default(), &host, CpuProfile::Full);
        assert_eq!(cpu.render(), TCG_DEFAULT_MODEL);
    }

    #[test]
    fn test_max_model_needs_kvm() {
        let opts = CpuOpts {
            cpu_model: "max".into(),
            ..Default::default()
        };
        let tcg = CpuHost {
            kvm: false,
            ..intel()
        };
        assert_eq!(CpuModel::build(&opts, &tcg, CpuProfile::Full).render(), TCG_DEFAULT_MODEL);
        let plain = CpuModel::build(&opts, &intel(), CpuProfile::Plain);
        assert_eq!(plain.render(), "max");
    }

    #[test]
    fn test_explicit_model_kept_without_kvm() {
        let opts = CpuOpts {
            cpu_model: "Skylake-Client".into(),
            hv: Toggle(false),
            ..Default::default()
        };
        let host = CpuHost {
            kvm: false,
            ..intel()
        };
        assert_eq!(CpuModel::build(&opts, &host, CpuProfile::Full).render(), "Skylake-Client");
    }

    #[test]
    fn test_toggles_disable_flags() {
        let opts = CpuOpts {
            hv: Toggle(false),
            nested: Toggle(false),
            ..Default::default()
        };
        assert_eq!(CpuModel::build(&opts, &intel(), CpuProfile::Full).render(), "host");
    }

    #[test]
    fn test_user_flags_never_duplicate() {
        let opts = CpuOpts {
            cpu_flags: "vmx=on, hv_spinlocks=0x2000,,+invtsc,hv_time".into(),
            ..Default::default()
        };
        let cpu = CpuModel::build(&opts, &intel(), CpuProfile::Reduced);
        assert_eq!(
            cpu.render(),
            "host,vmx=on,hv_relaxed,hv_vapic,hv_spinlocks=0x2000,hv_time,+invtsc"
        );
    }

    #[test]
    fn test_missing_extension_emits_nothing() {
        let host = CpuHost {
            extension: None,
            nested_capable: false,
            kvm: true,
        };
        let cpu = CpuModel::build(&CpuOpts::default(), &host, CpuProfile::Reduced);
        assert!(!cpu.has_flag("vmx") && !cpu.has_flag("svm"));
    }

    #[test]
    fn test_fallback_ladder() {
        assert_eq!(CpuProfile::Full.fallback(), Some(CpuProfile::Reduced));
        assert_eq!(CpuProfile::Reduced.fallback(), Some(CpuProfile::Plain));
        assert_eq!(CpuProfile::Plain.fallback(), None);
    }

    #[test]
    fn test_qemu_args() {
        let cpu = CpuModel::new("host");
        assert_eq!(cpu.qemu_args(), vec!["-cpu", "host"]);
    }
}
