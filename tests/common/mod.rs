//! Common test utilities for bootstrap testing
//!
//! This module provides shared fixtures for tests that:
//! - Override process environment variables and restore them afterwards
//! - Reserve loopback ports for rendezvous tests
//!
//! Process environment is shared mutable state, so every test that touches
//! it through [`EnvGuard`] must also run under `#[serial]`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::TcpListener;

pub use serial_test::serial;

/// Scoped process-environment override.
///
/// Records the prior value of every touched key and restores it on drop,
/// so a failing test cannot leak environment state into the next one.
pub struct EnvGuard {
    saved: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            saved: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> &mut Self {
        self.save(key);
        std::env::set_var(key, value);
        self
    }

    pub fn unset(&mut self, key: &str) -> &mut Self {
        self.save(key);
        std::env::remove_var(key);
        self
    }

    fn save(&mut self, key: &str) {
        self.saved
            .entry(key.to_string())
            .or_insert_with(|| std::env::var(key).ok());
    }
}

impl Default for EnvGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain() {
            match value {
                Some(v) => std::env::set_var(&key, v),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Reserve an ephemeral loopback port and release it for the caller.
///
/// The port is free at return time; rendezvous tests bind it again right
/// away, so collisions with other processes are unlikely in practice.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}
