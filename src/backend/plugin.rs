//! Dynamic plugin backend.
//!
//! Initializes an accelerator registered at runtime: look the identifier
//! up in the registry, coordinate if the descriptor asks for it, load the
//! descriptor's library, run its initializer, and construct the C-API
//! client with the descriptor's options. An identifier with no registry
//! entry fails immediately; this path never falls through clientless.

use std::sync::Arc;

use tracing::debug;

use crate::backend::classify_load_error;
use crate::client::{self, RuntimeClient};
use crate::config::EnvSource;
use crate::coordinator::{Coordinator, RendezvousConfig};
use crate::error::{AccelForgeError, AccelResult};
use crate::loader::PluginLoader;
use crate::logging;
use crate::profiling;
use crate::registry::PluginRegistry;
use crate::topology::{ProcessTopology, TopologyKeys};

/// KV namespace for dynamic plugin sessions.
const KV_PREFIX: &str = "plugin:";

/// Initialize a dynamically registered accelerator.
///
/// The coordinator comes up whenever the descriptor requires one, even in
/// a single-process world; plugins rely on the session store existing.
pub fn initialize(
    device_type: &str,
    env: &EnvSource,
    registry: &PluginRegistry,
    loader: &PluginLoader,
) -> AccelResult<(RuntimeClient, Option<Coordinator>)> {
    let descriptor = registry
        .lookup(device_type)
        .ok_or_else(|| AccelForgeError::PluginNotRegistered(device_type.to_string()))?;

    logging::init_logging_default();
    debug!(device = device_type, "initializing dynamic plugin");

    let (coordinator, kv_store) = if descriptor.requires_coordinator() {
        let topology = ProcessTopology::resolve(env, &TopologyKeys::plugin());
        topology
            .validate_for_coordination()
            .map_err(|source| AccelForgeError::Coordination {
                context: format!("plugin '{device_type}' topology validation"),
                source: source.into(),
            })?;
        let config = RendezvousConfig::from_env(env, &topology);
        let coordinator =
            Coordinator::bootstrap(config).map_err(|source| AccelForgeError::Coordination {
                context: format!("plugin '{device_type}' rendezvous"),
                source,
            })?;
        let store = coordinator.kv_store(KV_PREFIX);
        (Some(coordinator), Some(store))
    } else {
        (None, None)
    };

    let identifier = device_type.to_ascii_lowercase();
    let path = descriptor.library_path(env);
    let api = loader
        .load(&identifier, &path)
        .map_err(|err| classify_load_error(&identifier, err))?;
    loader
        .initialize(&identifier)
        .map_err(|err| classify_load_error(&identifier, err))?;

    let client = client::capi_client(
        &device_type.to_ascii_uppercase(),
        descriptor.client_create_options(),
        kv_store,
        Some(Arc::clone(&api)),
    )?;
    profiling::register_plugin_profiler(&identifier, api);
    Ok((client, coordinator))
}
