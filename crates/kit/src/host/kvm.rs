use std::fmt;
use std::os::unix::fs::FileTypeExt;

use camino::Utf8Path;
use rustix::fs::Access;

pub const KVM_DEVICE: &str = "/dev/kvm";

/// Result of probing the KVM device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvmStatus {
    Missing,
    NotCharDevice,
    NoAccess(String),
    Ready,
}

impl KvmStatus {
    pub fn probe() -> Self {
        Self::probe_path(Utf8Path::new(KVM_DEVICE))
    }

    pub fn probe_path(path: &Utf8Path) -> Self {
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::Missing,
            Err(e) => return Self::NoAccess(e.to_string()),
        };
        if !meta.file_type().is_char_device() {
            return Self::NotCharDevice;
        }
        match rustix::fs::access(path.as_std_path(), Access::READ_OK | Access::WRITE_OK) {
            Ok(()) => Self::Ready,
            Err(e) => Self::NoAccess(e.to_string()),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// What the user has to change to get a usable device.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Missing => Some(
                "pass the device into the container (--device=/dev/kvm), \
                 and make sure virtualization is enabled in the host BIOS",
            ),
            Self::NotCharDevice => Some("/dev/kvm exists but is not the KVM character device"),
            Self::NoAccess(_) => Some(
                "run the container privileged or add the host 'kvm' group (--group-add)",
            ),
            Self::Ready => None,
        }
    }
}

impl fmt::Display for KvmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "{KVM_DEVICE} is missing"),
            Self::NotCharDevice => write!(f, "{KVM_DEVICE} is not a character device"),
            Self::NoAccess(reason) => write!(f, "{KVM_DEVICE} is not accessible: {reason}"),
            Self::Ready => write!(f, "{KVM_DEVICE} is accessible"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device() {
        let status = KvmStatus::probe_path(Utf8Path::new("/nonexistent/kvm"));
        assert_eq!(status, KvmStatus::Missing);
        assert!(!status.is_ready());
        assert!(status.hint().unwrap().contains("--device=/dev/kvm"));
    }

    #[test]
    fn test_regular_file_is_not_kvm() {
        let tf = tempfile::NamedTempFile::new().unwrap();
        let path = Utf8Path::from_path(tf.path()).unwrap();
        assert_eq!(KvmStatus::probe_path(path), KvmStatus::NotCharDevice);
    }

    #[test]
    fn test_ready_has_no_hint() {
        assert_eq!(KvmStatus::Ready.hint(), None);
        assert_eq!(KvmStatus::Ready.to_string(), "/dev/kvm is accessible");
    }
}
