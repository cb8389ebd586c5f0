//! Kernel and worker-pool configuration.
//!
//! Both structs deserialize with defaults for missing fields and can be
//! overridden from the environment.

use serde::{Deserialize, Serialize};
use tessera_core::{Result, TesseraError};

/// Switches that shape kernel resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Ignore every hardware tier and resolve to the portable kernels.
    pub force_scalar: bool,

    /// Allow the tiled outer-product attention tier when the hardware has it.
    pub allow_tiled: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { force_scalar: false, allow_tiled: true }
    }
}

impl KernelConfig {
    pub const FORCE_SCALAR_ENV: &'static str = "TESSERA_FORCE_SCALAR";

    /// Defaults with `TESSERA_FORCE_SCALAR` applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`KernelConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = lookup(Self::FORCE_SCALAR_ENV) {
            config.force_scalar = parse_flag(&v);
        }
        config
    }
}

/// Sizing of the persistent worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Worker threads; 0 means one per available core.
    pub num_threads: usize,

    /// Capacity of the bounded work queue.
    pub queue_capacity: usize,

    /// Calls with fewer indices than this run on the calling thread.
    pub sequential_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { num_threads: 0, queue_capacity: 256, sequential_threshold: 2 }
    }
}

impl PoolConfig {
    pub const NUM_THREADS_ENV: &'static str = "TESSERA_NUM_THREADS";

    pub fn with_threads(num_threads: usize) -> Self {
        Self { num_threads, ..Self::default() }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(n) = lookup(Self::NUM_THREADS_ENV).and_then(|v| v.trim().parse().ok()) {
            config.num_threads = n;
        }
        config
    }

    /// Thread count with 0 resolved against the machine.
    pub fn resolved_threads(&self) -> usize {
        if self.num_threads > 0 {
            self.num_threads
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(TesseraError::InvalidConfig("queue_capacity must be > 0".into()));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
