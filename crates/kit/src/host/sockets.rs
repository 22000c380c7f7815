use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};
use std::process::Command;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::command_run::CommandRun;

/// Ports with a listening (TCP) or bound (UDP) socket on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListeningSockets {
    pub tcp: BTreeSet<u16>,
    pub udp: BTreeSet<u16>,
}

impl ListeningSockets {
    /// Run `ss -Htuln`. Returns `None` when `ss` is unavailable or fails, in
    /// which case callers fall back to bind/connect tests.
    pub fn probe() -> Option<Self> {
        match Command::new("ss").arg("-Htuln").run_get_string() {
            Ok(out) => Some(Self::from_ss(&out)),
            Err(e) => {
                debug!("ss unavailable: {e}");
                None
            }
        }
    }

    /// Parse `ss -Htuln` output. The local address is the second to last
    /// column (`0.0.0.0:5900`, `[::]:8006`, `*:3389`, `127.0.0.53%lo:53`).
    pub fn from_ss(text: &str) -> Self {
        let mut sockets = Self::default();
        for line in text.lines() {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 3 {
                continue;
            }
            let Some(port) = cols[cols.len() - 2]
                .rsplit_once(':')
                .and_then(|(_, p)| p.parse::<u16>().ok())
            else {
                continue;
            };
            match cols[0] {
                "udp" => {
                    sockets.udp.insert(port);
                }
                // Without a Netid column (tcp-only invocations) the first
                // column is the state.
                _ => {
                    sockets.tcp.insert(port);
                }
            }
        }
        sockets
    }

    pub fn tcp_in_use(&self, port: u16) -> bool {
        self.tcp.contains(&port)
    }

    pub fn udp_in_use(&self, port: u16) -> bool {
        self.udp.contains(&port)
    }
}

/// Whether something already holds `port` on the host.
pub(crate) fn tcp_port_in_use(sockets: Option<&ListeningSockets>, port: u16) -> bool {
    match sockets {
        Some(s) => s.tcp_in_use(port),
        None => TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_err(),
    }
}

/// Whether a server accepts connections on `port` of the loopback interface.
pub(crate) async fn tcp_port_listening(port: u16) -> bool {
    let connect = tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port));
    matches!(
        tokio::time::timeout(Duration::from_millis(200), connect).await,
        Ok(Ok(_))
    )
}
