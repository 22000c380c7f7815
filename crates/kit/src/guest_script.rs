//! The PowerShell status reporter for use inside the guest.

/// Lists the Hyper-V, Virtual Machine Platform and Windows Hypervisor
/// Platform optional features, the processor's virtualization properties and
/// `HypervisorPresent`.
pub const VERIFY_NESTED_PS1: &str = include_str!("../scripts/verify-nested.ps1");

pub fn run() {
    print!("{VERIFY_NESTED_PS1}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_queries_features() {
        for needle in [
            "Microsoft-Hyper-V-All",
            "VirtualMachinePlatform",
            "HypervisorPlatform",
            "HypervisorPresent",
        ] {
            assert!(VERIFY_NESTED_PS1.contains(needle), "{needle}");
        }
    }
}
