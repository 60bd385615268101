//! AccelForge - accelerator runtime bootstrap and plugin registry
//!
//! Selects the initialization path for a requested device backend, loads
//! and configures its native runtime client, and stands up distributed
//! coordination (topology resolution, a rendezvous coordinator, a shared
//! key-value store) ahead of client construction when the configuration
//! calls for it. One call, one client, or one classified error.

pub mod backend;
pub mod bootstrap;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod loader;
pub mod logging;
pub mod profiling;
pub mod registry;
pub mod topology;

pub use backend::BackendKind;
pub use bootstrap::{initialize, register_plugin, Bootstrap, InitOutcome};
pub use client::{AllocatorConfig, AllocatorKind, ClientKind, RuntimeClient};
pub use config::EnvSource;
pub use coordinator::{Coordinator, KeyValueStore, RendezvousConfig, RendezvousError};
pub use error::{AccelForgeError, AccelResult, ErrorKind};
pub use loader::{LoadError, PluginApi, PluginLoader};
pub use registry::{AcceleratorPlugin, OptionValue, PluginRegistry, StaticPlugin};
pub use topology::{ProcessTopology, TopologyKeys};

#[cfg(test)]
mod library_tests {
    use super::*;

    #[test]
    fn test_crate_surface() {
        let outcome = Bootstrap::new()
            .with_env(EnvSource::from_vars::<_, String, String>([]))
            .initialize("CPU")
            .unwrap();
        assert_eq!(outcome.client.platform(), "cpu");
        assert!(outcome.coordinator.is_none());
    }
}
