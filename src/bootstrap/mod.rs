//! Initialization orchestration
//!
//! The one-shot entry point: take a device identifier, pick the branch,
//! run it, and hand back the constructed client together with the
//! coordinator when the branch needed one. A call either returns a client
//! or a classified error; there is no partially initialized state left
//! behind to inspect.
//!
//! The context is explicit and injectable so tests run against their own
//! registry, loader, and environment; [`initialize`] and
//! [`register_plugin`] are the process-global convenience surface.

use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::{info, warn};

use crate::backend::vendor::VendorFamily;
use crate::backend::{self, BackendKind};
use crate::client::RuntimeClient;
use crate::config::{keys, EnvSource};
use crate::coordinator::Coordinator;
use crate::error::{AccelForgeError, AccelResult};
use crate::loader::{PluginLoader, PLUGIN_LOADER};
use crate::registry::{AcceleratorPlugin, PluginRegistry};

static GLOBAL_REGISTRY: Lazy<Arc<PluginRegistry>> = Lazy::new(|| Arc::new(PluginRegistry::new()));

/// Registry backing the process-global convenience API.
pub fn global_registry() -> &'static Arc<PluginRegistry> {
    &GLOBAL_REGISTRY
}

/// Result of a successful initialization.
#[derive(Debug)]
pub struct InitOutcome {
    pub client: RuntimeClient,
    /// Present iff the chosen path coordinated across processes.
    pub coordinator: Option<Coordinator>,
}

impl InitOutcome {
    pub fn into_parts(self) -> (RuntimeClient, Option<Coordinator>) {
        (self.client, self.coordinator)
    }
}

/// Explicit bootstrap context.
pub struct Bootstrap {
    env: EnvSource,
    registry: Arc<PluginRegistry>,
    loader: Arc<PluginLoader>,
}

impl Bootstrap {
    /// Context wired to the process environment and the global
    /// registry/loader.
    pub fn new() -> Self {
        Self {
            env: EnvSource::process(),
            registry: Arc::clone(global_registry()),
            loader: Arc::clone(&PLUGIN_LOADER),
        }
    }

    pub fn with_env(mut self, env: EnvSource) -> Self {
        self.env = env;
        self
    }

    pub fn with_registry(mut self, registry: Arc<PluginRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_loader(mut self, loader: Arc<PluginLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn env(&self) -> &EnvSource {
        &self.env
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Initialize the runtime for `device_type`.
    ///
    /// With the dynamic-plugins flag set, every identifier except `"CPU"`
    /// goes through the registry; an unregistered identifier fails there
    /// instead of falling back to a built-in branch. Without the flag the
    /// built-in families dispatch exhaustively.
    pub fn initialize(&self, device_type: &str) -> AccelResult<InitOutcome> {
        let dynamic = self.env.get_bool(keys::DYNAMIC_PLUGINS, false);
        let outcome = if dynamic && device_type != "CPU" {
            let (client, coordinator) =
                backend::plugin::initialize(device_type, &self.env, &self.registry, &self.loader)?;
            InitOutcome {
                client,
                coordinator,
            }
        } else {
            match BackendKind::parse(device_type) {
                BackendKind::Cpu => InitOutcome {
                    client: backend::cpu::initialize(&self.env)?,
                    coordinator: None,
                },
                BackendKind::Tpu => InitOutcome {
                    client: backend::tpu::initialize(&self.env, &self.loader)?,
                    coordinator: None,
                },
                BackendKind::TpuLegacy => {
                    return Err(AccelForgeError::RetiredDevice("TPU_LEGACY".to_string()))
                }
                BackendKind::Cuda => {
                    warn!("device 'CUDA' is deprecated, use 'GPU' instead");
                    let (client, coordinator) = backend::gpu::initialize(&self.env)?;
                    InitOutcome {
                        client,
                        coordinator,
                    }
                }
                BackendKind::Gpu => {
                    let (client, coordinator) = backend::gpu::initialize(&self.env)?;
                    InitOutcome {
                        client,
                        coordinator,
                    }
                }
                BackendKind::Xpu => InitOutcome {
                    client: backend::vendor::initialize(VendorFamily::Xpu, &self.env, &self.loader)?,
                    coordinator: None,
                },
                BackendKind::Neuron => InitOutcome {
                    client: backend::vendor::initialize(
                        VendorFamily::Neuron,
                        &self.env,
                        &self.loader,
                    )?,
                    coordinator: None,
                },
                BackendKind::Unknown => {
                    return Err(AccelForgeError::UnknownDevice(device_type.to_string()))
                }
            }
        };

        info!(
            device = device_type,
            platform = outcome.client.platform(),
            coordinated = outcome.coordinator.is_some(),
            "runtime initialized"
        );
        Ok(outcome)
    }
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize the runtime for `device_type` with the process-global
/// context.
pub fn initialize(device_type: &str) -> AccelResult<InitOutcome> {
    Bootstrap::new().initialize(device_type)
}

/// Register a plugin descriptor in the process-global registry.
pub fn register_plugin(name: impl Into<String>, plugin: Arc<dyn AcceleratorPlugin>) {
    global_registry().register(name, plugin);
}
