//! Runtime client construction
//!
//! Final stage of every initialization path: validate the options a
//! backend assembled and produce the [`RuntimeClient`] describing the
//! native runtime session. Three factories cover the three client shapes:
//! [`host_client`] for in-process CPU execution, [`stream_executor_client`]
//! for the GPU runtime, and [`capi_client`] for runtimes reached through a
//! loaded plugin library. Bad options fail here with a client-construction
//! error naming the platform; a factory never returns a half-built client.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::{keys, EnvSource};
use crate::coordinator::KeyValueStore;
use crate::error::{AccelForgeError, AccelResult};
use crate::loader::PluginApi;
use crate::registry::ClientCreateOptions;

/// How the GPU runtime allocates device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorKind {
    Sync,
    Async,
}

/// GPU allocator tuning.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocatorConfig {
    pub kind: AllocatorKind,
    pub preallocate: bool,
    pub memory_fraction: f64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            kind: AllocatorKind::Sync,
            preallocate: true,
            memory_fraction: Self::DEFAULT_MEMORY_FRACTION,
        }
    }
}

impl AllocatorConfig {
    pub const DEFAULT_MEMORY_FRACTION: f64 = 0.75;

    /// Resolve allocator tuning from the configuration source.
    ///
    /// When none of the three allocator keys is set, the stock defaults
    /// apply untouched. As soon as any key is set, each field resolves
    /// independently with its own default.
    pub fn from_env(env: &EnvSource) -> Self {
        if !env.is_set(keys::ALLOCATOR_ASYNC)
            && !env.is_set(keys::ALLOCATOR_PREALLOCATE)
            && !env.is_set(keys::ALLOCATOR_FRACTION)
        {
            return Self::default();
        }
        let kind = if env.get_bool(keys::ALLOCATOR_ASYNC, false) {
            AllocatorKind::Async
        } else {
            AllocatorKind::Sync
        };
        Self {
            kind,
            preallocate: env.get_bool(keys::ALLOCATOR_PREALLOCATE, true),
            memory_fraction: env.get_double(keys::ALLOCATOR_FRACTION, Self::DEFAULT_MEMORY_FRACTION),
        }
    }
}

/// Which factory produced a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    Host,
    StreamExecutor,
    CApi,
}

/// Everything the stream-executor factory needs.
pub struct GpuClientOptions {
    pub allocator: AllocatorConfig,
    pub node_id: usize,
    pub num_nodes: usize,
    /// Restrict the client to these device ordinals; `None` means every
    /// visible device.
    pub allowed_devices: Option<BTreeSet<usize>>,
    /// Device count when no allowed-device restriction applies.
    pub visible_device_count: usize,
    pub platform: String,
    pub async_execution: bool,
    pub stage_host_to_device: bool,
    pub kv_store: Option<Arc<dyn KeyValueStore>>,
}

impl Default for GpuClientOptions {
    fn default() -> Self {
        Self {
            allocator: AllocatorConfig::default(),
            node_id: 0,
            num_nodes: 1,
            allowed_devices: None,
            visible_device_count: 1,
            platform: "gpu".to_string(),
            async_execution: true,
            stage_host_to_device: true,
            kv_store: None,
        }
    }
}

impl std::fmt::Debug for GpuClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuClientOptions")
            .field("allocator", &self.allocator)
            .field("node_id", &self.node_id)
            .field("num_nodes", &self.num_nodes)
            .field("allowed_devices", &self.allowed_devices)
            .field("visible_device_count", &self.visible_device_count)
            .field("platform", &self.platform)
            .field("async_execution", &self.async_execution)
            .field("stage_host_to_device", &self.stage_host_to_device)
            .field("kv_store", &self.kv_store.is_some())
            .finish()
    }
}

/// A constructed native runtime session.
///
/// Returned by value from every successful initialization; the library
/// handle and key-value store it holds stay alive as long as the client.
pub struct RuntimeClient {
    platform: String,
    kind: ClientKind,
    device_count: usize,
    asynchronous: bool,
    node_id: usize,
    num_nodes: usize,
    allocator: Option<AllocatorConfig>,
    allowed_devices: Option<BTreeSet<usize>>,
    options: ClientCreateOptions,
    kv_store: Option<Arc<dyn KeyValueStore>>,
    library: Option<Arc<PluginApi>>,
}

impl RuntimeClient {
    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    pub fn asynchronous(&self) -> bool {
        self.asynchronous
    }

    pub fn node_id(&self) -> usize {
        self.node_id
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn allocator(&self) -> Option<&AllocatorConfig> {
        self.allocator.as_ref()
    }

    pub fn allowed_devices(&self) -> Option<&BTreeSet<usize>> {
        self.allowed_devices.as_ref()
    }

    pub fn options(&self) -> &ClientCreateOptions {
        &self.options
    }

    pub fn kv_store(&self) -> Option<&Arc<dyn KeyValueStore>> {
        self.kv_store.as_ref()
    }

    pub fn library(&self) -> Option<&Arc<PluginApi>> {
        self.library.as_ref()
    }
}

impl std::fmt::Debug for RuntimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeClient")
            .field("platform", &self.platform)
            .field("kind", &self.kind)
            .field("device_count", &self.device_count)
            .field("asynchronous", &self.asynchronous)
            .field("node_id", &self.node_id)
            .field("num_nodes", &self.num_nodes)
            .field("allocator", &self.allocator)
            .field("allowed_devices", &self.allowed_devices)
            .field("options", &self.options)
            .field("kv_store", &self.kv_store.is_some())
            .field("library", &self.library)
            .finish()
    }
}

fn construction_error(platform: &str, detail: impl Into<String>) -> AccelForgeError {
    AccelForgeError::ClientConstruction {
        platform: platform.to_string(),
        detail: detail.into(),
    }
}

/// In-process host client.
pub fn host_client(asynchronous: bool, num_devices: usize) -> AccelResult<RuntimeClient> {
    if num_devices == 0 {
        return Err(construction_error("cpu", "device count must be at least 1"));
    }
    debug!(num_devices, asynchronous, "constructing host client");
    Ok(RuntimeClient {
        platform: "cpu".to_string(),
        kind: ClientKind::Host,
        device_count: num_devices,
        asynchronous,
        node_id: 0,
        num_nodes: 1,
        allocator: None,
        allowed_devices: None,
        options: ClientCreateOptions::new(),
        kv_store: None,
        library: None,
    })
}

/// Stream-executor client for the GPU runtime.
pub fn stream_executor_client(options: GpuClientOptions) -> AccelResult<RuntimeClient> {
    let platform = options.platform.clone();
    if options.num_nodes == 0 {
        return Err(construction_error(&platform, "node count must be at least 1"));
    }
    if options.node_id >= options.num_nodes {
        return Err(construction_error(
            &platform,
            format!(
                "node id {} out of range for {} node(s)",
                options.node_id, options.num_nodes
            ),
        ));
    }
    let fraction = options.allocator.memory_fraction;
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(construction_error(
            &platform,
            format!("allocator memory fraction {fraction} outside (0, 1]"),
        ));
    }
    if let Some(devices) = &options.allowed_devices {
        if devices.is_empty() {
            return Err(construction_error(&platform, "allowed device set is empty"));
        }
    }
    if options.num_nodes > 1 && options.kv_store.is_none() {
        return Err(construction_error(
            &platform,
            "multi-node client requires a key-value store",
        ));
    }
    let device_count = match &options.allowed_devices {
        Some(devices) => devices.len(),
        None => options.visible_device_count.max(1),
    };

    debug!(
        platform = %platform,
        node_id = options.node_id,
        num_nodes = options.num_nodes,
        device_count,
        allocator = ?options.allocator,
        async_execution = options.async_execution,
        "constructing stream-executor client"
    );
    Ok(RuntimeClient {
        platform,
        kind: ClientKind::StreamExecutor,
        device_count,
        asynchronous: options.async_execution,
        node_id: options.node_id,
        num_nodes: options.num_nodes,
        allocator: Some(options.allocator),
        allowed_devices: options.allowed_devices,
        options: ClientCreateOptions::new(),
        kv_store: options.kv_store,
        library: None,
    })
}

/// C-API client for runtimes reached through a loaded plugin library.
pub fn capi_client(
    platform: &str,
    options: ClientCreateOptions,
    kv_store: Option<Arc<dyn KeyValueStore>>,
    library: Option<Arc<PluginApi>>,
) -> AccelResult<RuntimeClient> {
    if platform.is_empty() {
        return Err(construction_error("capi", "platform name is empty"));
    }
    debug!(
        platform,
        option_count = options.len(),
        has_kv_store = kv_store.is_some(),
        "constructing C-API client"
    );
    Ok(RuntimeClient {
        platform: platform.to_string(),
        kind: ClientKind::CApi,
        device_count: 1,
        asynchronous: false,
        node_id: 0,
        num_nodes: 1,
        allocator: None,
        allowed_devices: None,
        options,
        kv_store,
        library,
    })
}
