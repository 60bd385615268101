//! Configuration resolution for the bootstrap
//!
//! Every tunable in this crate is resolved through an [`EnvSource`] so the
//! fallback order per value is explicit and testable. A source either reads
//! the process environment or a caller-supplied map; the map form lets tests
//! exercise fallback chains without mutating global process state.
//!
//! Resolution rules shared by all getters:
//! - an unset key or an empty-string value counts as absent,
//! - an absent or unparsable value falls back to the caller's default,
//! - boolean values accept `1/true/yes/on` and `0/false/no/off`
//!   (ASCII case-insensitive).

use std::collections::HashMap;

/// Names of every environment key the bootstrap reads.
///
/// Keys with the `ACCELFORGE_` prefix are owned by this crate. Unprefixed
/// keys follow outside conventions: `RANK`, `WORLD_SIZE`, `LOCAL_RANK`,
/// `LOCAL_WORLD_SIZE` and `MASTER_ADDR` come from the usual multi-process
/// launchers, and the vendor library-path keys are the names the vendor
/// runtimes themselves document.
pub mod keys {
    /// Backend selector consumed by callers and the probe binary.
    pub const DEVICE: &str = "ACCELFORGE_DEVICE";

    /// Global flag routing non-CPU identifiers through the plugin registry.
    pub const DYNAMIC_PLUGINS: &str = "ACCELFORGE_DYNAMIC_PLUGINS";

    /// CPU client asynchronous-execution flag, default true.
    pub const CPU_ASYNC_CLIENT: &str = "ACCELFORGE_CPU_ASYNC_CLIENT";

    /// Host device count for the CPU client, default 1.
    pub const CPU_NUM_DEVICES: &str = "ACCELFORGE_CPU_NUM_DEVICES";

    /// GPU client asynchronous-execution flag, default true.
    pub const GPU_ASYNC_CLIENT: &str = "ACCELFORGE_GPU_ASYNC_CLIENT";

    /// Visible GPU device count when no per-rank restriction applies,
    /// default 1.
    pub const GPU_VISIBLE_DEVICES: &str = "ACCELFORGE_GPU_VISIBLE_DEVICES";

    /// Selects the asynchronous GPU allocator strategy.
    pub const ALLOCATOR_ASYNC: &str = "ACCELFORGE_ALLOCATOR_ASYNC";

    /// GPU allocator preallocation flag, default true once any allocator
    /// key is set.
    pub const ALLOCATOR_PREALLOCATE: &str = "ACCELFORGE_ALLOCATOR_PREALLOCATE";

    /// Fraction of device memory the GPU allocator may claim, default 0.75.
    pub const ALLOCATOR_FRACTION: &str = "ACCELFORGE_ALLOCATOR_FRACTION";

    /// Crate-specific local-rank override; consulted before the launcher's
    /// `LOCAL_RANK` on the plugin chain and alone on the GPU chain.
    pub const LOCAL_RANK: &str = "ACCELFORGE_LOCAL_RANK";

    /// Crate-specific local-world-size override; consulted before the
    /// launcher's `LOCAL_WORLD_SIZE` on the plugin chain only.
    pub const LOCAL_WORLD_SIZE: &str = "ACCELFORGE_LOCAL_WORLD_SIZE";

    /// Launcher-conventional local rank, default 0.
    pub const GENERIC_LOCAL_RANK: &str = "LOCAL_RANK";

    /// Launcher-conventional global rank, default = local rank.
    pub const GENERIC_GLOBAL_RANK: &str = "RANK";

    /// Launcher-conventional local world size, default 1.
    pub const GENERIC_LOCAL_WORLD_SIZE: &str = "LOCAL_WORLD_SIZE";

    /// Launcher-conventional global world size, default = local world size.
    pub const GENERIC_GLOBAL_WORLD_SIZE: &str = "WORLD_SIZE";

    /// Rendezvous leader address, default "localhost".
    pub const MASTER_ADDR: &str = "MASTER_ADDR";

    /// Rendezvous leader port, default
    /// [`crate::coordinator::DEFAULT_COORDINATOR_PORT`].
    pub const COORDINATOR_PORT: &str = "ACCELFORGE_COORDINATOR_PORT";

    /// Rendezvous handshake deadline in seconds, default 300.
    pub const RENDEZVOUS_TIMEOUT_SECS: &str = "ACCELFORGE_RENDEZVOUS_TIMEOUT_SECS";

    /// Vendor-documented TPU runtime library path; consulted first.
    pub const TPU_LIBRARY_PATH: &str = "TPU_LIBRARY_PATH";

    /// Crate-specific TPU library path override; consulted second,
    /// before the "libtpu.so" default.
    pub const TPU_LIBRARY_PATH_FALLBACK: &str = "ACCELFORGE_TPU_LIBRARY_PATH";

    /// Vendor-documented XPU runtime library path, default "libxpu.so".
    pub const XPU_LIBRARY_PATH: &str = "XPU_LIBRARY_PATH";

    /// Vendor-documented NEURON runtime library path,
    /// default "libneuronpjrt.so".
    pub const NEURON_LIBRARY_PATH: &str = "NEURON_LIBRARY_PATH";

    /// Library path resolved at use time by the placeholder "LIBRARY"
    /// registry entry, default empty.
    pub const PLUGIN_LIBRARY_PATH: &str = "ACCELFORGE_PLUGIN_LIBRARY_PATH";
}

/// A configuration source with typed, defaulted lookups.
///
/// [`EnvSource::process`] reads the process environment on every lookup so
/// changes between initialization calls are observed. [`EnvSource::from_vars`]
/// captures a fixed map for tests and embedding callers.
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    vars: Option<HashMap<String, String>>,
}

impl EnvSource {
    /// Source backed by the process environment.
    pub fn process() -> Self {
        Self { vars: None }
    }

    /// Source backed by a fixed set of variables; anything absent from the
    /// iterator is treated as unset.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: Some(
                vars.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Raw lookup. Empty-string values count as unset.
    pub fn raw(&self, key: &str) -> Option<String> {
        let value = match &self.vars {
            Some(vars) => vars.get(key).cloned(),
            None => std::env::var(key).ok(),
        };
        value.filter(|v| !v.is_empty())
    }

    /// Whether the key holds a non-empty value.
    pub fn is_set(&self, key: &str) -> bool {
        self.raw(key).is_some()
    }

    /// String lookup with default.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    /// Boolean lookup with default. Unrecognized values fall back to the
    /// default rather than failing.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.raw(key) {
            Some(value) => parse_bool(&value).unwrap_or(default),
            None => default,
        }
    }

    /// Non-negative integer lookup with default. Unparsable values
    /// (including negatives) fall back to the default.
    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.raw(key)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(default)
    }

    /// Floating-point lookup with default.
    pub fn get_double(&self, key: &str, default: f64) -> f64 {
        self.raw(key)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .unwrap_or(default)
    }

    /// First non-empty value along a chain of keys.
    pub fn first_set(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.raw(key))
    }

    /// Integer resolution along a chain of keys: the first key holding a
    /// parsable value wins, otherwise the default.
    pub fn chain_usize(&self, keys: &[&str], default: usize) -> usize {
        keys.iter()
            .find_map(|key| self.raw(key))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(default)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
