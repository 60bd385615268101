//! Plugin registry
//!
//! Maps uppercase backend identifiers to descriptors explaining how to bring
//! up that backend: where its native library lives, which options its client
//! wants, and whether it needs a distributed coordinator first. The registry
//! is an explicit object so tests construct a fresh one per case; the
//! process-wide instance lives with the bootstrap context.
//!
//! Registration is last-write-wins. Lookups never fail; a missing entry is
//! `None` and the caller decides what that means.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::{keys, EnvSource};

/// One client-construction option value.
///
/// Forwarded verbatim to the client factory; the factory does not interpret
/// these beyond handing them to the native runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// Boolean flag
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating-point value
    Float(f64),
    /// String value
    String(String),
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::String(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::String(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Float(v)
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

/// Client-construction options keyed by option name.
pub type ClientCreateOptions = BTreeMap<String, OptionValue>;

/// Describes how to initialize one registrable backend family.
///
/// Implementations are constructed once, immutable, and shared read-only
/// across lookups via `Arc`.
pub trait AcceleratorPlugin: Send + Sync {
    /// Filesystem path to the native plugin library. Resolved against the
    /// configuration source at use time, not fixed at registration.
    fn library_path(&self, env: &EnvSource) -> String;

    /// Options forwarded verbatim to client construction.
    fn client_create_options(&self) -> ClientCreateOptions {
        ClientCreateOptions::new()
    }

    /// Whether this backend needs a rendezvous and key-value store before
    /// its client is constructed.
    fn requires_coordinator(&self) -> bool {
        false
    }
}

/// Placeholder plugin for testing only. Does not configure multiprocessing;
/// resolves its library path from `ACCELFORGE_PLUGIN_LIBRARY_PATH` at use
/// time.
#[derive(Debug, Default)]
pub struct LibraryPlugin;

impl AcceleratorPlugin for LibraryPlugin {
    fn library_path(&self, env: &EnvSource) -> String {
        env.get_string(keys::PLUGIN_LIBRARY_PATH, "")
    }
}

/// A descriptor with everything fixed at registration time. The usual way
/// for embedders to register a third-party backend.
#[derive(Debug, Clone, Default)]
pub struct StaticPlugin {
    library_path: String,
    options: ClientCreateOptions,
    requires_coordinator: bool,
}

impl StaticPlugin {
    /// Descriptor for a library at a fixed path, no options, no coordinator.
    pub fn new(library_path: impl Into<String>) -> Self {
        Self {
            library_path: library_path.into(),
            options: ClientCreateOptions::new(),
            requires_coordinator: false,
        }
    }

    /// Add one client-construction option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Require a coordinator and key-value store before client construction.
    pub fn with_coordinator(mut self, requires: bool) -> Self {
        self.requires_coordinator = requires;
        self
    }
}

impl AcceleratorPlugin for StaticPlugin {
    fn library_path(&self, _env: &EnvSource) -> String {
        self.library_path.clone()
    }

    fn client_create_options(&self) -> ClientCreateOptions {
        self.options.clone()
    }

    fn requires_coordinator(&self) -> bool {
        self.requires_coordinator
    }
}

/// Process-wide mapping from backend identifier to plugin descriptor.
///
/// Interior locking keeps concurrent registration and lookup safe; callers
/// are expected to pass canonical uppercase identifiers.
pub struct PluginRegistry {
    entries: RwLock<HashMap<String, Arc<dyn AcceleratorPlugin>>>,
}

impl PluginRegistry {
    /// Registry seeded with the built-in "LIBRARY" placeholder entry.
    pub fn new() -> Self {
        let mut entries: HashMap<String, Arc<dyn AcceleratorPlugin>> = HashMap::new();
        entries.insert("LIBRARY".to_string(), Arc::new(LibraryPlugin));
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Insert or overwrite the entry for `name`. Later registrations win;
    /// the change is observable to all subsequent lookups.
    pub fn register(&self, name: impl Into<String>, plugin: Arc<dyn AcceleratorPlugin>) {
        let name = name.into();
        tracing::debug!(plugin = %name, "registering accelerator plugin");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, plugin);
    }

    /// Descriptor for `name` if one is registered.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn AcceleratorPlugin>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registered identifiers, sorted for stable output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_with_library_placeholder() {
        let registry = PluginRegistry::new();
        let plugin = registry.lookup("LIBRARY").expect("seed entry missing");
        assert!(!plugin.requires_coordinator());
        assert!(plugin.client_create_options().is_empty());
    }

    #[test]
    fn test_library_placeholder_resolves_path_from_config() {
        let registry = PluginRegistry::new();
        let plugin = registry.lookup("LIBRARY").unwrap();

        let env = EnvSource::from_vars([(keys::PLUGIN_LIBRARY_PATH, "/opt/plugin.so")]);
        assert_eq!(plugin.library_path(&env), "/opt/plugin.so");

        let env = EnvSource::from_vars::<_, &str, &str>([]);
        assert_eq!(plugin.library_path(&env), "");
    }

    #[test]
    fn test_lookup_miss_is_none() {
        let registry = PluginRegistry::new();
        assert!(registry.lookup("NOT_REGISTERED").is_none());
    }

    #[test]
    fn test_register_overwrites_existing_key() {
        let registry = PluginRegistry::new();
        let first: Arc<dyn AcceleratorPlugin> = Arc::new(StaticPlugin::new("/a.so"));
        let second: Arc<dyn AcceleratorPlugin> = Arc::new(StaticPlugin::new("/b.so"));

        registry.register("TT", Arc::clone(&first));
        registry.register("TT", Arc::clone(&second));

        let env = EnvSource::from_vars::<_, &str, &str>([]);
        let found = registry.lookup("TT").unwrap();
        assert!(Arc::ptr_eq(&found, &second));
        assert_eq!(found.library_path(&env), "/b.so");
    }

    #[test]
    fn test_static_plugin_builder() {
        let plugin = StaticPlugin::new("/opt/tt.so")
            .with_option("max_inflight", 4i64)
            .with_option("mesh", "2x4")
            .with_coordinator(true);

        let env = EnvSource::from_vars::<_, &str, &str>([]);
        assert_eq!(plugin.library_path(&env), "/opt/tt.so");
        assert!(plugin.requires_coordinator());

        let options = plugin.client_create_options();
        assert_eq!(options.get("max_inflight"), Some(&OptionValue::Int(4)));
        assert_eq!(options.get("mesh"), Some(&OptionValue::from("2x4")));
    }

    #[test]
    fn test_names_sorted() {
        let registry = PluginRegistry::new();
        registry.register("ZZZ", Arc::new(StaticPlugin::new("/z.so")));
        registry.register("AAA", Arc::new(StaticPlugin::new("/a.so")));
        assert_eq!(registry.names(), vec!["AAA", "LIBRARY", "ZZZ"]);
    }

    #[test]
    fn test_option_value_wire_shape() {
        let options: ClientCreateOptions = [
            ("flag".to_string(), OptionValue::Bool(true)),
            ("count".to_string(), OptionValue::Int(2)),
            ("name".to_string(), OptionValue::from("tt")),
        ]
        .into_iter()
        .collect();

        let json = serde_json::to_string(&options).unwrap();
        assert_eq!(json, r#"{"count":2,"flag":true,"name":"tt"}"#);
    }
}
