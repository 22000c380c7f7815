use std::process::Command;

use color_eyre::Result;

use crate::command_run::CommandRun;

/// Snapshot of `ps -eo pid=,comm=`.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    entries: Vec<(u32, String)>,
}

impl ProcessTable {
    pub fn probe() -> Result<Self> {
        let out = Command::new("ps")
            .args(["-eo", "pid=,comm="])
            .run_get_string()?;
        Ok(Self::from_ps(&out))
    }

    pub fn from_ps(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| {
                let (pid, comm) = line.trim().split_once(char::is_whitespace)?;
                Some((pid.parse().ok()?, comm.trim().to_owned()))
            })
            .collect();
        Self { entries }
    }

    /// PIDs of processes whose command name starts with `prefix`. `comm` is
    /// truncated to 15 characters by the kernel, so prefixes are the only
    /// reliable match for names like `qemu-system-x86_64`.
    pub fn find(&self, prefix: &str) -> Vec<u32> {
        let prefix: String = prefix.chars().take(15).collect();
        self.entries
            .iter()
            .filter(|(_, comm)| comm.starts_with(&prefix))
            .map(|(pid, _)| *pid)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS: &str = "    1 tini
   12 wvk
   40 qemu-system-x86
   41 websockify
  102 ps
";

    #[test]
    fn test_find() {
        let t = ProcessTable::from_ps(PS);
        assert_eq!(t.find("qemu-system-x86_64"), vec![40]);
        assert_eq!(t.find("websockify"), vec![41]);
        assert!(t.find("smbd").is_empty());
    }

    #[test]
    fn test_skips_malformed_lines() {
        let t = ProcessTable::from_ps("abc def\n\n  7 init\n");
        assert_eq!(t.find("init"), vec![7]);
        assert_eq!(t.entries.len(), 1);
    }
}
