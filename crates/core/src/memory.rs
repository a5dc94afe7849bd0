//! Soft RAM budget used to decide how many images are cached per round.

use sysinfo::System;
use tracing::{debug, warn};

use crate::config::MemoryConfig;

/// Assumed free memory when the platform cannot be queried.
pub const FALLBACK_AVAILABLE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Currently available system memory in bytes, if the platform reports it.
///
/// `sysinfo` reports 0 on platforms it cannot read, which counts as unknown.
pub fn available_memory_bytes() -> Option<u64> {
    let mut sys = System::new();
    sys.refresh_memory();
    Some(sys.available_memory()).filter(|&bytes| bytes > 0)
}

/// Budget for the next caching round: a fraction of what is free right now.
pub fn round_budget(config: &MemoryConfig) -> u64 {
    let available = match config.available_bytes_override {
        Some(bytes) => Some(bytes),
        None => available_memory_bytes(),
    };
    budget_from(available, config.budget_fraction)
}

fn budget_from(available: Option<u64>, budget_fraction: f64) -> u64 {
    let available = available.unwrap_or_else(|| {
        warn!(
            fallback_bytes = FALLBACK_AVAILABLE_BYTES,
            "Available memory unknown; assuming fallback"
        );
        FALLBACK_AVAILABLE_BYTES
    });
    let budget = (available as f64 * budget_fraction) as u64;
    debug!(available_bytes = available, budget_bytes = budget, "Computed round budget");
    budget
}

/// Expected resident cost of caching an image of `byte_len` bytes.
pub fn estimated_cost(byte_len: usize, inflation_factor: f64) -> u64 {
    (byte_len as f64 * inflation_factor).ceil() as u64
}
