//! TPU backend.

use std::sync::Arc;

use tracing::debug;

use crate::backend::classify_load_error;
use crate::client::{self, RuntimeClient};
use crate::config::{keys, EnvSource};
use crate::error::AccelResult;
use crate::loader::PluginLoader;
use crate::logging;
use crate::profiling;
use crate::registry::ClientCreateOptions;

const IDENTIFIER: &str = "tpu";
const PLATFORM: &str = "TPU";
const DEFAULT_LIBRARY: &str = "libtpu.so";

/// Resolved TPU library path: the explicit key, then the fallback key,
/// then the soname on the default search path.
pub fn library_path(env: &EnvSource) -> String {
    env.first_set(&[keys::TPU_LIBRARY_PATH, keys::TPU_LIBRARY_PATH_FALLBACK])
        .unwrap_or_else(|| DEFAULT_LIBRARY.to_string())
}

/// Load and initialize the TPU runtime, then construct its client.
///
/// Logging comes up before the native library so its first messages land
/// in our subscriber. The loaded API is registered with profiling once the
/// client exists.
pub fn initialize(env: &EnvSource, loader: &PluginLoader) -> AccelResult<RuntimeClient> {
    logging::init_logging_default();
    let path = library_path(env);
    debug!(%path, "initializing TPU backend");

    let api = loader
        .load(IDENTIFIER, &path)
        .map_err(|err| classify_load_error(IDENTIFIER, err))?;
    loader
        .initialize(IDENTIFIER)
        .map_err(|err| classify_load_error(IDENTIFIER, err))?;

    let client = client::capi_client(
        PLATFORM,
        ClientCreateOptions::new(),
        None,
        Some(Arc::clone(&api)),
    )?;
    profiling::register_plugin_profiler(IDENTIFIER, api);
    Ok(client)
}
