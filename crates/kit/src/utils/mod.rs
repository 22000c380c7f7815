mod common;
mod linux;

pub use common::{parse_memory_to_mb, parse_size};
pub use linux::wait_for_readiness;
