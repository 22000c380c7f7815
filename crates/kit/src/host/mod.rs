//! Host introspection.
//!
//! Everything the launcher and the diagnostics need to know about the machine
//! they run on: CPU vendor and virtualization extension, nested virtualization
//! support in the loaded KVM module, accessibility of `/dev/kvm`, which ports
//! are already bound and which processes are running.
//!
//! Parsers take the raw text (`/proc/cpuinfo`, `ss`, `ps` output) so they can
//! be tested against fixtures; the `load`/`probe` constructors read the live
//! system.

mod cpuinfo;
mod kvm;
mod procs;
mod sockets;

pub use cpuinfo::{nested_status, CpuInfo, NestedStatus, VirtExtension};
pub use kvm::KvmStatus;
pub use procs::ProcessTable;
pub use sockets::ListeningSockets;
pub(crate) use sockets::{tcp_port_in_use, tcp_port_listening};

use tracing::{debug, warn};

/// The host facts that shape the QEMU command line.
#[derive(Debug, Clone)]
pub struct HostFacts {
    pub cpu: CpuInfo,
    pub kvm: KvmStatus,
    pub nested: NestedStatus,
}

impl HostFacts {
    pub fn probe() -> Self {
        let cpu = CpuInfo::load().unwrap_or_else(|e| {
            warn!("{e:#}; assuming no virtualization extensions");
            CpuInfo::default()
        });
        let nested = cpu
            .virt_extension()
            .map_or(NestedStatus::Unknown, nested_status);
        let kvm = KvmStatus::probe();
        debug!(
            "Host: vendor={:?} extension={:?} nested={nested:?} kvm={kvm}",
            cpu.vendor,
            cpu.virt_extension()
        );
        Self { cpu, kvm, nested }
    }
}
