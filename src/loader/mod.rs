//! Dynamic plugin library loading
//!
//! Opens accelerator plugin shared libraries, checks the ABI revision they
//! export, and runs their initializer entry. Libraries are keyed by a
//! lowercased identifier and stay resident for the life of the process:
//! loading the same identifier twice returns the handle already held, and
//! the initializer runs at most once per identifier.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use libloading::{Library, Symbol};
use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::debug;

/// ABI revision this runtime expects from loaded plugins.
pub const PLUGIN_API_VERSION: u32 = 1;

const API_VERSION_SYMBOL: &[u8] = b"accelforge_plugin_api_version";
const INITIALIZE_SYMBOL: &[u8] = b"accelforge_plugin_initialize";

/// Why a plugin library could not be loaded or initialized.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("plugin library path is empty")]
    EmptyPath,

    #[error("failed to open plugin library '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("plugin library '{path}' does not export '{symbol}': {source}")]
    MissingSymbol {
        path: PathBuf,
        symbol: String,
        #[source]
        source: libloading::Error,
    },

    #[error("plugin library '{path}' reports API version {found}, this runtime expects {expected}")]
    ApiVersionMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("plugin initializer in '{path}' returned status {status}")]
    Initialize { path: PathBuf, status: i32 },

    #[error("plugin '{identifier}' already loaded from '{loaded}', refusing reload from '{requested}'")]
    PathConflict {
        identifier: String,
        loaded: PathBuf,
        requested: PathBuf,
    },

    #[error("plugin '{identifier}' has not been loaded")]
    NotLoaded { identifier: String },
}

impl LoadError {
    /// True when the library itself loaded but its runtime setup failed.
    ///
    /// Callers classify these as initialization failures rather than load
    /// failures.
    pub fn is_init_failure(&self) -> bool {
        matches!(
            self,
            LoadError::ApiVersionMismatch { .. } | LoadError::Initialize { .. }
        )
    }
}

/// A loaded plugin library with its ABI revision read.
pub struct PluginApi {
    path: PathBuf,
    library: Library,
    api_version: u32,
}

impl PluginApi {
    fn open(path: &Path) -> Result<Self, LoadError> {
        let library = match unsafe { Library::new(path) } {
            Ok(library) => library,
            Err(source) => {
                return Err(LoadError::Open {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let api_version = {
            let version_fn: Symbol<'_, unsafe extern "C" fn() -> u32> =
                unsafe { library.get(API_VERSION_SYMBOL) }.map_err(|source| {
                    LoadError::MissingSymbol {
                        path: path.to_path_buf(),
                        symbol: String::from_utf8_lossy(API_VERSION_SYMBOL).into_owned(),
                        source,
                    }
                })?;
            unsafe { version_fn() }
        };

        Ok(Self {
            path: path.to_path_buf(),
            library,
            api_version,
        })
    }

    fn run_initializer(&self) -> Result<(), LoadError> {
        if self.api_version != PLUGIN_API_VERSION {
            return Err(LoadError::ApiVersionMismatch {
                path: self.path.clone(),
                found: self.api_version,
                expected: PLUGIN_API_VERSION,
            });
        }
        let init_fn: Symbol<'_, unsafe extern "C" fn() -> i32> =
            unsafe { self.library.get(INITIALIZE_SYMBOL) }.map_err(|source| {
                LoadError::MissingSymbol {
                    path: self.path.clone(),
                    symbol: String::from_utf8_lossy(INITIALIZE_SYMBOL).into_owned(),
                    source,
                }
            })?;
        let status = unsafe { init_fn() };
        if status != 0 {
            return Err(LoadError::Initialize {
                path: self.path.clone(),
                status,
            });
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }
}

impl std::fmt::Debug for PluginApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginApi")
            .field("path", &self.path)
            .field("api_version", &self.api_version)
            .finish()
    }
}

struct LoadedPlugin {
    api: Arc<PluginApi>,
    initialized: bool,
}

/// Cache of loaded plugin libraries keyed by lowercased identifier.
///
/// Loading is idempotent per identifier and libraries are never unloaded;
/// a handle returned here stays valid until the process exits. Reloading
/// an identifier from a different path is an error.
pub struct PluginLoader {
    loaded: Mutex<HashMap<String, LoadedPlugin>>,
}

impl PluginLoader {
    pub fn new() -> Self {
        Self {
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Open the library for `identifier` at `path`, or return the handle
    /// from an earlier load of the same identifier.
    pub fn load(
        &self,
        identifier: &str,
        path: impl AsRef<Path>,
    ) -> Result<Arc<PluginApi>, LoadError> {
        let key = identifier.to_ascii_lowercase();
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(LoadError::EmptyPath);
        }

        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = loaded.get(&key) {
            if entry.api.path() != path {
                return Err(LoadError::PathConflict {
                    identifier: key,
                    loaded: entry.api.path().to_path_buf(),
                    requested: path.to_path_buf(),
                });
            }
            return Ok(Arc::clone(&entry.api));
        }

        let api = Arc::new(PluginApi::open(path)?);
        debug!(
            identifier = %key,
            path = %path.display(),
            api_version = api.api_version(),
            "loaded plugin library"
        );
        loaded.insert(
            key,
            LoadedPlugin {
                api: Arc::clone(&api),
                initialized: false,
            },
        );
        Ok(api)
    }

    /// Run the initializer entry for a loaded identifier, at most once.
    ///
    /// Checks the ABI revision first; a mismatch or a nonzero initializer
    /// status fails here, not at load time, so backends that never
    /// initialize a library can still hold it.
    pub fn initialize(&self, identifier: &str) -> Result<(), LoadError> {
        let key = identifier.to_ascii_lowercase();
        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = loaded
            .get_mut(&key)
            .ok_or(LoadError::NotLoaded { identifier: key.clone() })?;
        if entry.initialized {
            debug!(identifier = %key, "plugin already initialized");
            return Ok(());
        }
        entry.api.run_initializer()?;
        entry.initialized = true;
        debug!(identifier = %key, path = %entry.api.path().display(), "plugin initialized");
        Ok(())
    }

    /// Whether `identifier` has been loaded by this loader.
    pub fn is_loaded(&self, identifier: &str) -> bool {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&identifier.to_ascii_lowercase())
    }

    /// Whether `identifier` has been loaded and its initializer has run.
    pub fn is_initialized(&self, identifier: &str) -> bool {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&identifier.to_ascii_lowercase())
            .map(|entry| entry.initialized)
            .unwrap_or(false)
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide loader shared by every bootstrap in this process.
pub static PLUGIN_LOADER: Lazy<Arc<PluginLoader>> = Lazy::new(|| Arc::new(PluginLoader::new()));
