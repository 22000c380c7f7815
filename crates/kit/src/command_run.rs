//! Synchronous subprocess helpers for the short-lived host tools we probe
//! (`ss`, `ps`, `qemu-img`, `qemu-system-* --version`).

use std::io::{Read, Seek};
use std::process::Command;

use color_eyre::eyre::{eyre, Context, Result};

/// Helpers intended for [`std::process::Command`].
pub trait CommandRun {
    /// Execute the child process, returning an error carrying the tail of its
    /// stderr if it exits unsuccessfully.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process and capture its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T>;
}

/// Helpers intended for [`std::process::ExitStatus`].
pub trait ExitStatusExt {
    /// If the exit status signals it was not successful, return an error
    /// naming `program` and including the trailing stderr output.
    fn check_status(&self, program: &str, stderr: std::fs::File) -> Result<()>;
}

impl ExitStatusExt for std::process::ExitStatus {
    fn check_status(&self, program: &str, stderr: std::fs::File) -> Result<()> {
        if self.success() {
            return Ok(());
        }
        let stderr_buf = last_utf8_content_from_file(stderr);
        Err(eyre!("{program} failed: {self}\n{stderr_buf}"))
    }
}

fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    // u16 since we truncate to just the trailing bytes here
    // to avoid pathological error messages
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map_err(|e| {
            tracing::warn!("failed to fstat: {e}");
        })
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let seek_offset = -(size as i64);
    let mut stderr_buf = Vec::with_capacity(size.into());
    match f
        .seek(std::io::SeekFrom::End(seek_offset))
        .and_then(|_| f.read_to_end(&mut stderr_buf))
    {
        Ok(_) => String::from_utf8_lossy(&stderr_buf).trim_end().to_owned(),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    }
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

impl CommandRun for Command {
    fn run(&mut self) -> Result<()> {
        let program = program_name(self);
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        tracing::debug!("exec: {self:?}");
        self.status()
            .with_context(|| format!("Failed to execute {program}"))?
            .check_status(&program, stderr)
    }

    fn run_get_string(&mut self) -> Result<String> {
        let mut stdout = tempfile::tempfile()?;
        self.stdout(stdout.try_clone()?);
        self.run()?;
        stdout.seek(std::io::SeekFrom::Start(0)).context("seek")?;
        let mut s = String::new();
        stdout.read_to_string(&mut s)?;
        Ok(s)
    }

    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let program = program_name(self);
        let output = self.run_get_string()?;
        serde_json::from_str(&output).with_context(|| format!("Parsing JSON output of {program}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_get_string_captures_stdout() {
        let out = Command::new("sh")
            .args(["-c", "echo hello"])
            .run_get_string()
            .unwrap();
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn test_failure_includes_stderr_tail() {
        let err = Command::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .run()
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("sh failed"), "{msg}");
        assert!(msg.contains("boom"), "{msg}");
    }

    #[test]
    fn test_run_and_parse_json() {
        let v: serde_json::Value = Command::new("sh")
            .args(["-c", r#"echo '{"virtual-size": 42}'"#])
            .run_and_parse_json()
            .unwrap();
        assert_eq!(v["virtual-size"], 42);
    }

    #[test]
    fn test_missing_program() {
        let err = Command::new("/nonexistent/wvk-test-binary").run().unwrap_err();
        assert!(err.to_string().contains("Failed to execute"));
    }
}
