//! End-to-end initialization tests through the public bootstrap surface.
//!
//! Process-environment tests take `#[serial]`; multi-rank tests inject
//! per-rank environments instead, so they stay parallel-safe.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serial_test::serial;

use accelforge::config::keys;
use accelforge::registry::PluginRegistry;
use accelforge::{
    AccelForgeError, Bootstrap, ClientKind, EnvSource, ErrorKind, InitOutcome, PluginLoader,
    StaticPlugin,
};
use common::{free_port, EnvGuard};

#[test]
#[serial]
fn test_cpu_initialize_from_process_env() {
    let mut env = EnvGuard::new();
    env.unset(keys::DYNAMIC_PLUGINS);
    env.set(keys::CPU_NUM_DEVICES, "3");
    env.set(keys::CPU_ASYNC_CLIENT, "false");

    let outcome = accelforge::initialize("CPU").expect("cpu bootstrap");
    assert_eq!(outcome.client.platform(), "cpu");
    assert_eq!(outcome.client.kind(), ClientKind::Host);
    assert_eq!(outcome.client.device_count(), 3);
    assert!(!outcome.client.asynchronous());
    assert!(outcome.coordinator.is_none());
}

#[test]
#[serial]
fn test_device_names_match_exactly() {
    let mut env = EnvGuard::new();
    env.unset(keys::DYNAMIC_PLUGINS);

    let err = accelforge::initialize("cpu").expect_err("lowercase is not a device name");
    assert_eq!(err.to_string(), "Unknown ACCELFORGE_DEVICE: 'cpu'");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
#[serial]
fn test_retired_device_reports_exact_message() {
    let mut env = EnvGuard::new();
    env.unset(keys::DYNAMIC_PLUGINS);

    let err = accelforge::initialize("TPU_LEGACY").expect_err("retired device");
    assert_eq!(err.to_string(), "TPU_LEGACY client is no longer available.");
    assert!(err.is_invalid_argument());
}

#[test]
#[serial]
fn test_tpu_with_missing_library_fails_as_plugin_load() {
    let mut env = EnvGuard::new();
    env.unset(keys::DYNAMIC_PLUGINS);
    env.set(keys::TPU_LIBRARY_PATH, "/nonexistent/libtpu.so");

    let err = accelforge::initialize("TPU").expect_err("library cannot exist");
    assert_eq!(err.kind(), ErrorKind::PluginLoad);
    assert!(err.to_string().contains("tpu"), "message: {err}");
}

#[test]
#[serial]
fn test_dynamic_flag_routes_known_families_through_registry() {
    let mut env = EnvGuard::new();
    env.set(keys::DYNAMIC_PLUGINS, "1");

    // With the flag up, even GPU must come from the registry.
    let err = accelforge::initialize("GPU").expect_err("nothing registered under GPU");
    assert!(
        matches!(err, AccelForgeError::PluginNotRegistered(ref name) if name == "GPU"),
        "error: {err:?}"
    );
}

#[test]
fn test_dynamic_unregistered_plugin_fails_fast() {
    let bootstrap = Bootstrap::new()
        .with_env(EnvSource::from_vars([(keys::DYNAMIC_PLUGINS, "1")]))
        .with_registry(Arc::new(PluginRegistry::new()))
        .with_loader(Arc::new(PluginLoader::new()));

    let err = bootstrap.initialize("MY_ACCEL").expect_err("not registered");
    assert!(matches!(err, AccelForgeError::PluginNotRegistered(_)));
    assert!(err.is_invalid_argument());
}

#[test]
fn test_global_registration_is_visible_to_dynamic_bootstrap() {
    accelforge::register_plugin(
        "MONARCH",
        Arc::new(StaticPlugin::new("/nonexistent/libmonarch.so")),
    );

    // Global registry stays attached when only the env is injected.
    let bootstrap = Bootstrap::new()
        .with_env(EnvSource::from_vars([(keys::DYNAMIC_PLUGINS, "1")]))
        .with_loader(Arc::new(PluginLoader::new()));

    let err = bootstrap.initialize("MONARCH").expect_err("library cannot exist");
    assert_eq!(err.kind(), ErrorKind::PluginLoad);
    assert!(err.to_string().contains("monarch"), "message: {err}");
}

#[test]
fn test_single_process_gpu_has_no_coordinator() {
    let bootstrap = Bootstrap::new()
        .with_env(EnvSource::from_vars::<_, String, String>([]))
        .with_registry(Arc::new(PluginRegistry::new()))
        .with_loader(Arc::new(PluginLoader::new()));

    let outcome = bootstrap.initialize("GPU").expect("single-process gpu");
    assert_eq!(outcome.client.platform(), "gpu");
    assert_eq!(outcome.client.node_id(), 0);
    assert_eq!(outcome.client.num_nodes(), 1);
    assert!(outcome.client.allowed_devices().is_none());
    assert!(outcome.coordinator.is_none());

    // Single-process clients still get a live store.
    let store = outcome.client.kv_store().expect("local store");
    store.set("probe", "1").expect("set");
    assert_eq!(store.try_get("probe").expect("try_get").as_deref(), Some("1"));
}

fn gpu_rank_outcome(rank: usize, port: u16) -> accelforge::AccelResult<InitOutcome> {
    let vars = [
        (keys::LOCAL_RANK, rank.to_string()),
        (keys::GENERIC_GLOBAL_RANK, rank.to_string()),
        (keys::GENERIC_LOCAL_WORLD_SIZE, "2".to_string()),
        (keys::GENERIC_GLOBAL_WORLD_SIZE, "2".to_string()),
        (keys::MASTER_ADDR, "127.0.0.1".to_string()),
        (keys::COORDINATOR_PORT, port.to_string()),
        (keys::RENDEZVOUS_TIMEOUT_SECS, "10".to_string()),
    ];
    Bootstrap::new()
        .with_env(EnvSource::from_vars(vars))
        .with_registry(Arc::new(PluginRegistry::new()))
        .with_loader(Arc::new(PluginLoader::new()))
        .initialize("GPU")
}

#[test]
fn test_gpu_two_rank_initialization_end_to_end() {
    let port = free_port();

    let t0 = thread::spawn(move || gpu_rank_outcome(0, port));
    let t1 = thread::spawn(move || gpu_rank_outcome(1, port));
    let out0 = t0.join().unwrap().expect("rank 0 init");
    let out1 = t1.join().unwrap().expect("rank 1 init");

    for (rank, outcome) in [(0, &out0), (1, &out1)] {
        assert_eq!(outcome.client.platform(), "gpu");
        assert_eq!(outcome.client.kind(), ClientKind::StreamExecutor);
        assert_eq!(outcome.client.node_id(), rank);
        assert_eq!(outcome.client.num_nodes(), 2);
        // Two processes share the host, so each is pinned to its ordinal.
        let allowed = outcome.client.allowed_devices().expect("restricted");
        assert_eq!(allowed.iter().copied().collect::<Vec<_>>(), vec![rank]);
        assert_eq!(outcome.client.device_count(), 1);
    }

    let coord0 = out0.coordinator.as_ref().expect("rank 0 coordinated");
    let coord1 = out1.coordinator.as_ref().expect("rank 1 coordinated");
    assert!(coord0.is_leader());
    assert!(!coord1.is_leader());
    assert_eq!(coord0.endpoint(), coord1.endpoint());

    // The stores handed to the clients span the job.
    let store0 = out0.client.kv_store().expect("rank 0 store");
    let store1 = out1.client.kv_store().expect("rank 1 store");
    store0.set("collective/uid", "rank0-uid").expect("set");
    let seen = store1
        .get("collective/uid", Duration::from_secs(5))
        .expect("get");
    assert_eq!(seen, "rank0-uid");
}
