//! Utility functions.

use tch::Device;

use crate::{Result, RlhfError};

/// Set the global libtorch seed and return it.
///
/// The recipe keeps its own `ChaCha8Rng` for sampling and shuffling; this only
/// makes parameter initialisation of freshly built models reproducible.
pub fn set_seed(seed: u64) -> u64 {
    tch::manual_seed(seed as i64);
    seed
}

/// Parse a device string such as `cpu`, `cuda`, `cuda:1` or `auto`.
pub fn parse_device(device: &str) -> Result<Device> {
    match device.trim().to_ascii_lowercase().as_str() {
        "cpu" => Ok(Device::Cpu),
        "auto" => Ok(Device::cuda_if_available()),
        "cuda" => Ok(Device::Cuda(0)),
        other => other
            .strip_prefix("cuda:")
            .and_then(|idx| idx.parse::<usize>().ok())
            .map(Device::Cuda)
            .ok_or_else(|| RlhfError::Config(format!("unknown device '{}'", device))),
    }
}

/// Abbreviate large numbers for display
pub fn abbreviate(num: u64) -> String {
    if num < 1_000 {
        format!("{}", num)
    } else if num < 1_000_000 {
        format!("{:.1}K", num as f64 / 1_000.0)
    } else if num < 1_000_000_000 {
        format!("{:.1}M", num as f64 / 1_000_000.0)
    } else {
        format!("{:.1}B", num as f64 / 1_000_000_000.0)
    }
}

/// Format duration in human-readable form
pub fn format_duration(seconds: f64) -> String {
    if seconds < 0.0 {
        return "0s".to_string();
    }

    let secs = seconds as u64;
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;

    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
