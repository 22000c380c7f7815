//! Common CLI options shared across commands

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_MEMORY_USER_STR: &str = "4G";

/// A yes/no switch as it is usually written in container environments
/// (`KVM=Y`, `HV=no`, `DEBUG=1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Toggle(pub bool);

impl Toggle {
    pub fn enabled(self) -> bool {
        self.0
    }
}

impl FromStr for Toggle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" | "true" | "1" | "on" => Ok(Toggle(true)),
            "n" | "no" | "false" | "0" | "off" => Ok(Toggle(false)),
            other => Err(format!("expected Y or N, got '{other}'")),
        }
    }
}

impl fmt::Display for Toggle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0 { "Y" } else { "N" })
    }
}

/// Memory size options
#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryOpts {
    #[clap(
        long = "ram-size",
        env = "RAM_SIZE",
        default_value = DEFAULT_MEMORY_USER_STR,
        help = "Guest memory size (e.g. 4G, 2048M, or plain number for MB)"
    )]
    pub memory: String,
}

impl MemoryOpts {
    pub fn memory_mb(&self) -> color_eyre::Result<u32> {
        crate::utils::parse_memory_to_mb(&self.memory)
    }
}

impl fmt::Display for MemoryOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.memory)
    }
}
