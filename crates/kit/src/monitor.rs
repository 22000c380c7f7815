//! Client for the QEMU human monitor (HMP) exposed on a unix socket.

use std::time::Duration;

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

/// Where QEMU listens for monitor connections (`-monitor unix:...`).
pub const MONITOR_SOCKET: &str = "/run/wvk/qemu.monitor";

const PROMPT: &str = "(qemu) ";
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

async fn read_until_prompt(stream: &mut UnixStream) -> Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(REPLY_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| eyre!("Timed out waiting for the QEMU monitor"))??;
        if n == 0 {
            return Err(eyre!("QEMU monitor closed the connection"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.ends_with(PROMPT.as_bytes()) {
            return Ok(String::from_utf8_lossy(&buf).into_owned());
        }
    }
}

/// Drop terminal escapes, the echoed command and the prompt.
fn clean_reply(raw: &str, cmd: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // CSI sequence: ESC [ params final-byte
            if chars.next() == Some('[') {
                for c in chars.by_ref() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            continue;
        }
        if c != '\r' {
            out.push(c);
        }
    }
    out.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty() && *l != PROMPT.trim_end() && !l.ends_with(cmd))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Send one HMP command and return QEMU's reply.
pub async fn send_command(path: &Utf8Path, cmd: &str) -> Result<String> {
    let mut stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("Connecting to QEMU monitor at {path}"))?;
    // Banner
    read_until_prompt(&mut stream).await?;
    debug!("monitor: {cmd}");
    stream
        .write_all(format!("{cmd}\n").as_bytes())
        .await
        .context("Writing monitor command")?;
    let reply = read_until_prompt(&mut stream).await?;
    Ok(clean_reply(&reply, cmd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::UnixListener;

    #[test]
    fn test_clean_reply() {
        let raw = "system_powerdown\r\n\x1b[K(qemu) ";
        assert_eq!(clean_reply(raw, "system_powerdown"), "");
        let raw = "info status\r\nVM status: running\r\n(qemu) ";
        assert_eq!(clean_reply(raw, "info status"), "VM status: running");
    }

    #[tokio::test]
    async fn test_send_command() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(td.path().join("mon")).unwrap();
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = stream.into_split();
            wr.write_all(b"QEMU 8.2.0 monitor - type 'help' for more information\r\n(qemu) ")
                .await
                .unwrap();
            let mut line = String::new();
            tokio::io::BufReader::new(rd)
                .read_line(&mut line)
                .await
                .unwrap();
            let reply = format!("{}\r\nVM status: running\r\n(qemu) ", line.trim_end());
            wr.write_all(reply.as_bytes()).await.unwrap();
            line
        });

        let reply = send_command(&path, "info status").await.unwrap();
        assert_eq!(reply, "VM status: running");
        assert_eq!(server.await.unwrap(), "info status\n");
    }

    #[tokio::test]
    async fn test_missing_socket() {
        let err = send_command(Utf8Path::new("/nonexistent/wvk.monitor"), "system_powerdown")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Connecting to QEMU monitor"));
    }
}
