//! Profiling registration for loaded accelerator plugins.
//!
//! Backends that load a native runtime hand its API here so diagnostic
//! collection can find it later. Registration is fire-and-forget: it
//! never fails and nothing at this layer starts a collection session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::loader::PluginApi;

static PROFILERS: Lazy<Mutex<HashMap<String, Arc<PluginApi>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Record the loaded API for `identifier` in the process-wide table.
///
/// Re-registering an identifier replaces the earlier handle; both handles
/// keep their library resident either way.
pub fn register_plugin_profiler(identifier: &str, api: Arc<PluginApi>) {
    let key = identifier.to_ascii_lowercase();
    debug!(
        identifier = %key,
        path = %api.path().display(),
        "registering plugin profiler"
    );
    PROFILERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key, api);
}

/// Identifiers with a registered profiler, sorted.
pub fn registered_profilers() -> Vec<String> {
    let mut names: Vec<String> = PROFILERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}

/// The registered API for `identifier`, if any.
pub fn profiler_api(identifier: &str) -> Option<Arc<PluginApi>> {
    PROFILERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&identifier.to_ascii_lowercase())
        .map(Arc::clone)
}
