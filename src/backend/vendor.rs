//! Vendor accelerator backends.
//!
//! Families that ship a self-contained runtime library: load it and
//! construct the client directly. No initializer entry, no profiler hook,
//! no coordination.

use std::sync::Arc;

use tracing::debug;

use crate::backend::classify_load_error;
use crate::client::{self, RuntimeClient};
use crate::config::{keys, EnvSource};
use crate::error::AccelResult;
use crate::loader::PluginLoader;
use crate::registry::ClientCreateOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorFamily {
    Xpu,
    Neuron,
}

impl VendorFamily {
    /// Loader identifier (lowercased by convention).
    pub fn identifier(&self) -> &'static str {
        match self {
            Self::Xpu => "xpu",
            Self::Neuron => "neuron",
        }
    }

    /// Platform name the client reports.
    pub fn platform(&self) -> &'static str {
        match self {
            Self::Xpu => "XPU",
            Self::Neuron => "NEURON",
        }
    }

    pub fn library_path(&self, env: &EnvSource) -> String {
        match self {
            Self::Xpu => env.get_string(keys::XPU_LIBRARY_PATH, "libxpu.so"),
            Self::Neuron => env.get_string(keys::NEURON_LIBRARY_PATH, "libneuronpjrt.so"),
        }
    }
}

/// Load the family's runtime library and construct its client.
pub fn initialize(
    family: VendorFamily,
    env: &EnvSource,
    loader: &PluginLoader,
) -> AccelResult<RuntimeClient> {
    let path = family.library_path(env);
    debug!(family = family.platform(), %path, "initializing vendor backend");

    let api = loader
        .load(family.identifier(), &path)
        .map_err(|err| classify_load_error(family.identifier(), err))?;
    client::capi_client(
        family.platform(),
        ClientCreateOptions::new(),
        None,
        Some(Arc::clone(&api)),
    )
}
