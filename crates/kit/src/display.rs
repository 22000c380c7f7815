//! Guest console: QEMU's VNC server, optionally fronted by websockify so
//! noVNC can reach it from a browser.

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::qemu::ToQemuArgs;

/// QEMU numbers VNC displays from this port.
pub const VNC_BASE_PORT: u16 = 5900;

/// Display mode
#[derive(
    Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DisplayMode {
    /// VNC plus the noVNC web client (default)
    #[default]
    Web,
    /// VNC only
    Vnc,
    /// Headless; reach the guest over RDP
    None,
}

/// Display options
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct DisplayOpts {
    #[clap(
        long,
        env = "DISPLAY_MODE",
        default_value_t = DisplayMode::Web,
        help = "How the guest screen is exported"
    )]
    pub display: DisplayMode,

    #[clap(
        long,
        env = "VNC_PORT",
        default_value_t = VNC_BASE_PORT,
        help = "VNC listen port (5900 or above)"
    )]
    pub vnc_port: u16,

    #[clap(long, env = "WEB_PORT", default_value_t = 8006, help = "noVNC web port")]
    pub web_port: u16,

    #[clap(
        long,
        env = "NOVNC_WEB",
        default_value = "/usr/share/novnc",
        help = "Directory with the noVNC web client"
    )]
    pub novnc_web: Utf8PathBuf,
}

impl Default for DisplayOpts {
    fn default() -> Self {
        Self {
            display: DisplayMode::Web,
            vnc_port: VNC_BASE_PORT,
            web_port: 8006,
            novnc_web: "/usr/share/novnc".into(),
        }
    }
}

/// Validated display configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Display {
    pub mode: DisplayMode,
    pub vnc_port: u16,
    pub web_port: u16,
    pub novnc_web: Utf8PathBuf,
}

impl Display {
    pub fn new(opts: &DisplayOpts) -> Result<Self> {
        if opts.display != DisplayMode::None {
            if opts.vnc_port < VNC_BASE_PORT {
                return Err(eyre!(
                    "VNC_PORT {} is below {VNC_BASE_PORT}; QEMU can only listen on 5900 + display number",
                    opts.vnc_port
                ));
            }
            if opts.display == DisplayMode::Web && opts.web_port == opts.vnc_port {
                return Err(eyre!("WEB_PORT and VNC_PORT must differ"));
            }
        }
        Ok(Self {
            mode: opts.display,
            vnc_port: opts.vnc_port,
            web_port: opts.web_port,
            novnc_web: opts.novnc_web.clone(),
        })
    }

    pub fn vnc_display(&self) -> u16 {
        self.vnc_port - VNC_BASE_PORT
    }

    pub fn vnc_enabled(&self) -> bool {
        self.mode != DisplayMode::None
    }

    /// Host ports this display will bind.
    pub fn host_ports(&self) -> Vec<u16> {
        match self.mode {
            DisplayMode::Web => vec![self.vnc_port, self.web_port],
            DisplayMode::Vnc => vec![self.vnc_port],
            DisplayMode::None => Vec::new(),
        }
    }

    /// Arguments for `websockify`, when the web client is enabled.
    pub fn websockify_args(&self) -> Option<Vec<String>> {
        (self.mode == DisplayMode::Web).then(|| {
            vec![
                "--web".to_owned(),
                self.novnc_web.to_string(),
                self.web_port.to_string(),
                format!("localhost:{}", self.vnc_port),
            ]
        })
    }
}

impl ToQemuArgs for Display {
    fn qemu_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.vnc_enabled() {
            args.extend([
                "-display".to_owned(),
                format!("vnc=:{}", self.vnc_display()),
            ]);
        } else {
            args.extend(["-display".to_owned(), "none".to_owned()]);
        }
        args.extend(["-vga".to_owned(), "std".to_owned()]);
        if self.vnc_enabled() {
            // Absolute pointer keeps the VNC cursor in sync with the guest
            args.extend([
                "-device".to_owned(),
                "qemu-xhci,id=xhci".to_owned(),
                "-device".to_owned(),
                "usb-tablet".to_owned(),
            ]);
        }
        args
    }
}
