//! User-mode (slirp) networking with host port forwards.
//!
//! The guest always gets RDP forwarded (TCP and UDP, UDP carries the RemoteFX
//! transport); `PORTS` adds further TCP forwards.

use std::collections::BTreeSet;
use std::str::FromStr;

use clap::{Parser, ValueEnum};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::qemu::ToQemuArgs;

/// Port the Windows RDP service listens on inside the guest.
pub const GUEST_RDP_PORT: u16 = 3389;

/// Port mapping from host to VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub guest_port: u16,
}

impl FromStr for PortMapping {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let (host_part, guest_part) = s.split_once(':').ok_or_else(|| {
            eyre!(
                "Invalid port format '{}'. Expected format: host_port:guest_port",
                s
            )
        })?;

        let parse = |part: &str, which: &str| {
            part.trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| {
                    eyre!(
                        "Invalid {} port '{}'. Must be a number between 1 and 65535",
                        which,
                        part
                    )
                })
        };

        Ok(PortMapping {
            host_port: parse(host_part, "host")?,
            guest_port: parse(guest_part, "guest")?,
        })
    }
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host_port, self.guest_port)
    }
}

/// Emulated network card
#[derive(
    Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[clap(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NicModel {
    /// Intel 82574L, supported by Windows out of the box (default)
    #[default]
    #[value(name = "e1000e")]
    #[serde(rename = "e1000e")]
    #[strum(serialize = "e1000e")]
    E1000e,
    /// virtio-net; needs the virtio-win drivers
    VirtioNetPci,
    /// Realtek 8139 for very old guests
    #[value(name = "rtl8139")]
    #[serde(rename = "rtl8139")]
    #[strum(serialize = "rtl8139")]
    Rtl8139,
}

/// Network options
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct NetworkOpts {
    #[clap(
        long,
        env = "RDP_PORT",
        default_value_t = GUEST_RDP_PORT,
        help = "Host port forwarded to the guest RDP service (TCP and UDP)"
    )]
    pub rdp_port: u16,

    #[clap(
        long,
        env = "PORTS",
        value_delimiter = ',',
        help = "Additional TCP forwards, comma separated (host_port:guest_port)"
    )]
    pub ports: Vec<PortMapping>,

    #[clap(long, env = "ADAPTER", default_value_t = NicModel::E1000e, help = "Network card model")]
    pub adapter: NicModel,

    #[clap(long, env = "MAC", help = "Guest MAC address (e.g. 02:7b:ba:3c:1d:9e)")]
    pub mac: Option<String>,
}

impl Default for NetworkOpts {
    fn default() -> Self {
        Self {
            rdp_port: GUEST_RDP_PORT,
            ports: Vec::new(),
            adapter: NicModel::E1000e,
            mac: None,
        }
    }
}

fn validate_mac(mac: &str) -> Result<()> {
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(eyre!(
            "Invalid MAC address '{}'. Expected six colon-separated hex octets",
            mac
        ));
    }
    Ok(())
}

/// Validated network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Network {
    pub rdp_port: u16,
    pub forwards: Vec<PortMapping>,
    pub adapter: NicModel,
    pub mac: Option<String>,
}

impl Network {
    pub fn new(opts: &NetworkOpts) -> Result<Self> {
        if opts.rdp_port == 0 {
            return Err(eyre!("RDP_PORT must be between 1 and 65535"));
        }
        let mut seen = BTreeSet::from([opts.rdp_port]);
        for mapping in &opts.ports {
            if !seen.insert(mapping.host_port) {
                return Err(eyre!(
                    "Host port {} is forwarded more than once",
                    mapping.host_port
                ));
            }
        }
        let mac = opts.mac.as_deref().map(str::trim).filter(|m| !m.is_empty());
        if let Some(mac) = mac {
            validate_mac(mac)?;
        }
        Ok(Self {
            rdp_port: opts.rdp_port,
            forwards: opts.ports.clone(),
            adapter: opts.adapter,
            mac: mac.map(str::to_ascii_lowercase),
        })
    }

    /// Host ports this VM will bind.
    pub fn host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::once(self.rdp_port).chain(self.forwards.iter().map(|m| m.host_port))
    }
}

impl ToQemuArgs for Network {
    fn qemu_args(&self) -> Vec<String> {
        let mut netdev = format!(
            "user,id=net0,hostfwd=tcp::{rdp}-:{GUEST_RDP_PORT},hostfwd=udp::{rdp}-:{GUEST_RDP_PORT}",
            rdp = self.rdp_port
        );
        for m in &self.forwards {
            netdev.push_str(&format!(",hostfwd=tcp::{}-:{}", m.host_port, m.guest_port));
        }
        let mut device = format!("{},netdev=net0", self.adapter);
        if let Some(mac) = &self.mac {
            device.push_str(&format!(",mac={mac}"));
        }
        vec!["-netdev".into(), netdev, "-device".into(), device]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_mapping_valid() {
        let mapping = "8080:80".parse::<PortMapping>().unwrap();
        assert_eq!(mapping.host_port, 8080);
        assert_eq!(mapping.guest_port, 80);
        assert_eq!(mapping.to_string(), "8080:80");
    }

    #[test]
    fn test_parse_port_mapping_invalid_format() {
        let result = "8080".parse::<PortMapping>();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Expected format: host_port:guest_port"));
    }

    #[test]
    fn test_parse_port_mapping_invalid_ports() {
        let err = "abc:80".parse::<PortMapping>().unwrap_err();
        assert!(err.to_string().contains("Invalid host port"));
        let err = "8080:xyz".parse::<PortMapping>().unwrap_err();
        assert!(err.to_string().contains("Invalid guest port"));
        assert!("70000:80".parse::<PortMapping>().is_err());
        assert!("0:80".parse::<PortMapping>().is_err());
    }

    #[test]
    fn test_default_args() {
        let net = Network::new(&NetworkOpts::default()).unwrap();
        assert_eq!(
            net.qemu_args(),
            vec![
                "-netdev",
                "user,id=net0,hostfwd=tcp::3389-:3389,hostfwd=udp::3389-:3389",
                "-device",
                "e1000e,netdev=net0",
            ]
        );
    }

    #[test]
    fn test_forwards_and_mac() {
        let opts = NetworkOpts {
            rdp_port: 13389,
            ports: vec!["2222:22".parse().unwrap()],
            adapter: NicModel::VirtioNetPci,
            mac: Some("02:7B:BA:3C:1D:9E".into()),
        };
        let net = Network::new(&opts).unwrap();
        let args = net.qemu_args();
        assert_eq!(
            args[1],
            "user,id=net0,hostfwd=tcp::13389-:3389,hostfwd=udp::13389-:3389,hostfwd=tcp::2222-:22"
        );
        assert_eq!(args[3], "virtio-net-pci,netdev=net0,mac=02:7b:ba:3c:1d:9e");
        assert_eq!(net.host_ports().collect::<Vec<_>>(), vec![13389, 2222]);
    }

    #[test]
    fn test_duplicate_host_port_rejected() {
        let opts = NetworkOpts {
            ports: vec!["3389:3390".parse().unwrap()],
            ..Default::default()
        };
        let err = Network::new(&opts).unwrap_err();
        assert!(err.to_string().contains("forwarded more than once"));
    }

    #[test]
    fn test_bad_mac_rejected() {
        for mac in ["02:7b:ba:3c:1d", "zz:7b:ba:3c:1d:9e", "027bba3c1d9e"] {
            let opts = NetworkOpts {
                mac: Some(mac.into()),
                ..Default::default()
            };
            assert!(Network::new(&opts).is_err(), "{mac}");
        }
    }

    #[test]
    fn test_blank_mac_means_none() {
        let opts = NetworkOpts {
            mac: Some(" ".into()),
            ..Default::default()
        };
        let net = Network::new(&opts).unwrap();
        assert_eq!(net.mac, None);
        assert_eq!(net.qemu_args()[3], "e1000e,netdev=net0");
    }
}
