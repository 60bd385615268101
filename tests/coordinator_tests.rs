//! Multi-rank rendezvous tests over real loopback sockets.
//!
//! Each test reserves its own port, so tests can run in parallel without
//! stepping on one another.

mod common;

use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use accelforge::coordinator::{Coordinator, RendezvousConfig, RendezvousError};
use common::free_port;

fn config(rank: usize, world: usize, port: u16) -> RendezvousConfig {
    RendezvousConfig::new(rank, world)
        .with_address("127.0.0.1")
        .with_port(port.to_string())
        .with_timeout(Duration::from_secs(10))
}

#[test]
fn test_two_rank_rendezvous_completes() {
    let port = free_port();

    let leader = thread::spawn(move || Coordinator::bootstrap(config(0, 2, port)));
    let follower = thread::spawn(move || Coordinator::bootstrap(config(1, 2, port)));

    let leader = leader.join().unwrap().expect("leader bootstrap");
    let follower = follower.join().unwrap().expect("follower bootstrap");

    assert!(leader.is_leader());
    assert!(!follower.is_leader());
    assert_eq!(leader.global_world_size(), 2);
    assert_eq!(follower.global_rank(), 1);
    assert_eq!(leader.endpoint(), follower.endpoint());
}

#[test]
fn test_kv_exchange_between_ranks() {
    let port = free_port();

    let leader = thread::spawn(move || Coordinator::bootstrap(config(0, 2, port)));
    let follower = thread::spawn(move || Coordinator::bootstrap(config(1, 2, port)));
    let leader = leader.join().unwrap().expect("leader bootstrap");
    let follower = follower.join().unwrap().expect("follower bootstrap");

    let leader_store = leader.kv_store("gpu:");
    let follower_store = follower.kv_store("gpu:");

    // Value written before the read.
    leader_store.set("collective_id", "abc123").expect("set");
    let value = follower_store
        .get("collective_id", Duration::from_secs(5))
        .expect("get");
    assert_eq!(value, "abc123");

    // Value written after the read starts; the server parks the reader.
    let reader = {
        let store = follower.kv_store("gpu:");
        thread::spawn(move || store.get("late_key", Duration::from_secs(5)))
    };
    thread::sleep(Duration::from_millis(100));
    leader_store.set("late_key", "arrived").expect("set");
    assert_eq!(reader.join().unwrap().expect("waiting get"), "arrived");

    // Followers can publish too.
    follower_store.set("rank1_addr", "10.0.0.2").expect("set");
    assert_eq!(
        leader_store.try_get("rank1_addr").expect("try_get").as_deref(),
        Some("10.0.0.2")
    );
}

#[test]
fn test_kv_prefixes_isolate_backend_families() {
    let port = free_port();

    let leader = thread::spawn(move || Coordinator::bootstrap(config(0, 2, port)));
    let follower = thread::spawn(move || Coordinator::bootstrap(config(1, 2, port)));
    let leader = leader.join().unwrap().expect("leader bootstrap");
    let follower = follower.join().unwrap().expect("follower bootstrap");

    leader.kv_store("gpu:").set("token", "g").expect("set");

    let plugin_view = follower.kv_store("plugin:");
    assert_eq!(plugin_view.try_get("token").expect("try_get"), None);

    let gpu_view = follower.kv_store("gpu:");
    assert_eq!(gpu_view.try_get("token").expect("try_get").as_deref(), Some("g"));
}

#[test]
fn test_three_rank_rendezvous_with_fan_in() {
    let port = free_port();

    let mut handles = Vec::new();
    for rank in 0..3 {
        handles.push(thread::spawn(move || {
            let coordinator = Coordinator::bootstrap(config(rank, 3, port))?;
            let store = coordinator.kv_store("gpu:");
            store.set(&format!("addr/{rank}"), &format!("host-{rank}"))?;
            Ok::<_, RendezvousError>(coordinator)
        }));
    }

    let coordinators: Vec<Coordinator> = handles
        .into_iter()
        .map(|h| h.join().unwrap().expect("rank bootstrap"))
        .collect();

    // Every rank sees every address.
    for coordinator in &coordinators {
        let store = coordinator.kv_store("gpu:");
        for rank in 0..3 {
            let value = store
                .get(&format!("addr/{rank}"), Duration::from_secs(5))
                .expect("fan-in get");
            assert_eq!(value, format!("host-{rank}"));
        }
    }
}

#[test]
fn test_world_size_mismatch_is_rejected() {
    let port = free_port();

    let leader = thread::spawn(move || Coordinator::bootstrap(config(0, 2, port)));

    // A peer configured for a three-rank job is turned away without joining.
    let err = Coordinator::bootstrap(config(1, 3, port)).expect_err("mismatched world");
    match err {
        RendezvousError::Rejected { reason } => {
            assert!(reason.contains("world size mismatch"), "reason: {reason}")
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    // A correctly configured peer still completes the barrier.
    Coordinator::bootstrap(config(1, 2, port)).expect("correct follower");
    leader.join().unwrap().expect("leader bootstrap");
}

#[test]
fn test_duplicate_rank_is_rejected() {
    let port = free_port();

    let leader = thread::spawn(move || Coordinator::bootstrap(config(0, 3, port)));

    // Two processes claim rank 1. Whichever registers second is rejected,
    // regardless of arrival order.
    let first = thread::spawn(move || Coordinator::bootstrap(config(1, 3, port)));
    let second = thread::spawn(move || Coordinator::bootstrap(config(1, 3, port)));

    // Rank 2 completes the barrier so the surviving rank-1 claim resolves.
    thread::sleep(Duration::from_millis(200));
    let rank2 = Coordinator::bootstrap(config(2, 3, port)).expect("rank 2 bootstrap");

    let results = [first.join().unwrap(), second.join().unwrap()];
    let accepted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(accepted, 1, "exactly one rank-1 claim may join");
    let rejection = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one claim rejected");
    match rejection {
        RendezvousError::Rejected { reason } => {
            assert!(reason.contains("duplicate rank 1"), "reason: {reason}")
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    leader.join().unwrap().expect("leader bootstrap");
    drop(rank2);
}

#[test]
fn test_follower_times_out_without_leader() {
    let port = free_port();

    let config = RendezvousConfig::new(1, 2)
        .with_address("127.0.0.1")
        .with_port(port.to_string())
        .with_timeout(Duration::from_millis(300));

    let err = Coordinator::bootstrap(config).expect_err("nobody is listening");
    assert!(
        matches!(err, RendezvousError::Timeout { .. }),
        "expected timeout, got {err:?}"
    );
}

#[test]
fn test_follower_cancel_interrupts_wait() {
    let port = free_port();
    let cancel = CancellationToken::new();

    let config = RendezvousConfig::new(1, 2)
        .with_address("127.0.0.1")
        .with_port(port.to_string())
        .with_timeout(Duration::from_secs(30))
        .with_cancel(cancel.clone());

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        cancel.cancel();
    });

    let err = Coordinator::bootstrap(config).expect_err("cancelled before any leader appears");
    assert!(
        matches!(err, RendezvousError::Cancelled),
        "expected cancellation, got {err:?}"
    );
    canceller.join().unwrap();
}
