//! Backend initializers
//!
//! One module per backend family. Dispatch starts from a [`BackendKind`]
//! parsed out of the device identifier; each family owns its branch end to
//! end and returns a constructed client, or a classified error, and never
//! anything in between. The dynamic-plugin path lives in [`plugin`] and is
//! only reachable through the orchestrator's plugin gate.

pub mod cpu;
pub mod gpu;
pub mod plugin;
pub mod tpu;
pub mod vendor;

use crate::error::AccelForgeError;
use crate::loader::LoadError;

/// Built-in backend families.
///
/// Identifiers match exactly (uppercase, launcher convention); anything
/// outside the built-in set parses as [`BackendKind::Unknown`] and belongs
/// to the dynamic-plugin namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Cpu,
    Tpu,
    /// Retired family; selecting it always fails.
    TpuLegacy,
    /// Deprecated alias for [`BackendKind::Gpu`].
    Cuda,
    Gpu,
    Xpu,
    Neuron,
    Unknown,
}

impl BackendKind {
    pub fn parse(device_type: &str) -> Self {
        match device_type {
            "CPU" => Self::Cpu,
            "TPU" => Self::Tpu,
            "TPU_LEGACY" => Self::TpuLegacy,
            "CUDA" => Self::Cuda,
            "GPU" => Self::Gpu,
            "XPU" => Self::Xpu,
            "NEURON" => Self::Neuron,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Tpu => "TPU",
            Self::TpuLegacy => "TPU_LEGACY",
            Self::Cuda => "CUDA",
            Self::Gpu => "GPU",
            Self::Xpu => "XPU",
            Self::Neuron => "NEURON",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a loader failure for `name` onto the error taxonomy.
///
/// A library that never opened is a load failure; a library that opened
/// but refused to come up (wrong ABI revision, failed initializer) is an
/// initialization failure.
pub(crate) fn classify_load_error(name: &str, err: LoadError) -> AccelForgeError {
    if err.is_init_failure() {
        AccelForgeError::PluginInit {
            name: name.to_string(),
            detail: err.to_string(),
        }
    } else {
        AccelForgeError::PluginLoad {
            name: name.to_string(),
            source: err,
        }
    }
}
