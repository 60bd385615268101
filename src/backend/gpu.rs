//! GPU backend: stream-executor client with optional multi-process
//! coordination.
//!
//! The branch is planned before it is executed: [`plan`] resolves
//! everything the environment decides (topology, allocator tuning, device
//! restriction, whether a coordinator is needed) with no side effects, and
//! [`initialize`] carries the plan out. The probe binary prints plans
//! directly.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::client::{self, AllocatorConfig, GpuClientOptions, RuntimeClient};
use crate::config::{keys, EnvSource};
use crate::coordinator::{Coordinator, InMemoryKvStore, KeyValueStore, RendezvousConfig};
use crate::error::{AccelForgeError, AccelResult};
use crate::topology::{ProcessTopology, TopologyKeys};

/// KV namespace for the GPU session.
const KV_PREFIX: &str = "gpu:";

/// Everything the environment decides about the GPU branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuPlan {
    pub topology: ProcessTopology,
    pub allocator: AllocatorConfig,
    pub async_execution: bool,
    /// Device ordinals this process may touch; `None` means unrestricted.
    pub allowed_devices: Option<BTreeSet<usize>>,
    pub visible_device_count: usize,
    pub needs_coordinator: bool,
}

/// Resolve the GPU branch from the configuration source. No side effects.
pub fn plan(env: &EnvSource) -> GpuPlan {
    let async_execution = env.get_bool(keys::GPU_ASYNC_CLIENT, true);
    let topology = ProcessTopology::resolve(env, &TopologyKeys::gpu());
    debug!(
        local_rank = topology.local_rank,
        global_rank = topology.global_rank,
        local_world_size = topology.local_world_size,
        global_world_size = topology.global_world_size,
        raw_local_rank = ?env.raw(keys::LOCAL_RANK),
        raw_rank = ?env.raw(keys::GENERIC_GLOBAL_RANK),
        raw_local_world_size = ?env.raw(keys::GENERIC_LOCAL_WORLD_SIZE),
        raw_world_size = ?env.raw(keys::GENERIC_GLOBAL_WORLD_SIZE),
        "resolved GPU topology"
    );

    // Multi-device hosts pin each process to its own ordinal.
    let allowed_devices = if topology.local_world_size > 1 {
        Some(BTreeSet::from([topology.local_rank]))
    } else {
        None
    };

    GpuPlan {
        allocator: AllocatorConfig::from_env(env),
        async_execution,
        allowed_devices,
        visible_device_count: env.get_usize(keys::GPU_VISIBLE_DEVICES, 1),
        needs_coordinator: topology.global_world_size > 1,
        topology,
    }
}

/// Initialize the GPU path.
///
/// Coordinates iff more than one process participates globally; the
/// single-process case gets a process-local store instead of a session.
pub fn initialize(env: &EnvSource) -> AccelResult<(RuntimeClient, Option<Coordinator>)> {
    let plan = plan(env);

    let (coordinator, kv_store) = if plan.needs_coordinator {
        plan.topology
            .validate_for_coordination()
            .map_err(|source| AccelForgeError::Coordination {
                context: "GPU topology validation".to_string(),
                source: source.into(),
            })?;
        let config = RendezvousConfig::from_env(env, &plan.topology);
        let coordinator =
            Coordinator::bootstrap(config).map_err(|source| AccelForgeError::Coordination {
                context: "GPU rendezvous".to_string(),
                source,
            })?;
        let store = coordinator.kv_store(KV_PREFIX);
        (Some(coordinator), store)
    } else {
        (None, Arc::new(InMemoryKvStore::new()) as Arc<dyn KeyValueStore>)
    };

    let options = GpuClientOptions {
        allocator: plan.allocator,
        node_id: plan.topology.global_rank,
        num_nodes: plan.topology.global_world_size,
        allowed_devices: plan.allowed_devices,
        visible_device_count: plan.visible_device_count,
        platform: "gpu".to_string(),
        async_execution: plan.async_execution,
        stage_host_to_device: true,
        kv_store: Some(kv_store),
    };
    let client = client::stream_executor_client(options)?;
    Ok((client, coordinator))
}
