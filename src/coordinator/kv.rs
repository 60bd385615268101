//! Key-value store views used during the distributed handshake.
//!
//! Clients exchange small values (addresses, tokens, unique ids) through a
//! store scoped to their backend family. Reads block until the key appears
//! or the deadline passes, so a rank can ask for a value a peer has not
//! written yet.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::RendezvousError;

/// Shared storage for cross-process handshake values.
pub trait KeyValueStore: Send + Sync {
    /// Store a value. Overwrites are allowed.
    fn set(&self, key: &str, value: &str) -> Result<(), RendezvousError>;

    /// Read a value, waiting up to `timeout` for it to appear.
    fn get(&self, key: &str, timeout: Duration) -> Result<String, RendezvousError>;

    /// Read a value without waiting.
    fn try_get(&self, key: &str) -> Result<Option<String>, RendezvousError>;
}

/// Process-local store.
///
/// Backs single-process clients that still expect a store to be present, and
/// stands in for the distributed store in tests.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
    changed: Condvar,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryKvStore {
    fn set(&self, key: &str, value: &str) -> Result<(), RendezvousError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        self.changed.notify_all();
        Ok(())
    }

    fn get(&self, key: &str, timeout: Duration) -> Result<String, RendezvousError> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(value) = entries.get(key) {
                return Ok(value.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RendezvousError::KeyUnavailable {
                    key: key.to_string(),
                    waited: timeout,
                });
            }
            let (guard, wait) = self
                .changed
                .wait_timeout(entries, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            entries = guard;
            if wait.timed_out() && !entries.contains_key(key) {
                return Err(RendezvousError::KeyUnavailable {
                    key: key.to_string(),
                    waited: timeout,
                });
            }
        }
    }

    fn try_get(&self, key: &str) -> Result<Option<String>, RendezvousError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }
}

/// Namespacing wrapper. Distinct prefixes per backend family keep keys from
/// colliding when more than one family coordinates in the same process.
pub struct PrefixedStore {
    inner: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl PrefixedStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl KeyValueStore for PrefixedStore {
    fn set(&self, key: &str, value: &str) -> Result<(), RendezvousError> {
        self.inner.set(&self.scoped(key), value)
    }

    fn get(&self, key: &str, timeout: Duration) -> Result<String, RendezvousError> {
        self.inner.get(&self.scoped(key), timeout)
    }

    fn try_get(&self, key: &str) -> Result<Option<String>, RendezvousError> {
        self.inner.try_get(&self.scoped(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_set_then_get() {
        let store = InMemoryKvStore::new();
        store.set("nccl_id", "abc123").unwrap();
        assert_eq!(
            store.get("nccl_id", Duration::from_millis(10)).unwrap(),
            "abc123"
        );
        assert_eq!(store.try_get("nccl_id").unwrap().as_deref(), Some("abc123"));
    }

    #[test]
    fn test_get_waits_for_late_writer() {
        let store = Arc::new(InMemoryKvStore::new());
        let writer = Arc::clone(&store);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer.set("late", "value").unwrap();
        });

        let got = store.get("late", Duration::from_secs(2)).unwrap();
        assert_eq!(got, "value");
        handle.join().unwrap();
    }

    #[test]
    fn test_get_times_out_on_missing_key() {
        let store = InMemoryKvStore::new();
        let err = store
            .get("never", Duration::from_millis(30))
            .expect_err("missing key should time out");
        assert!(matches!(err, RendezvousError::KeyUnavailable { .. }));
    }

    #[test]
    fn test_try_get_does_not_wait() {
        let store = InMemoryKvStore::new();
        assert_eq!(store.try_get("missing").unwrap(), None);
    }

    #[test]
    fn test_prefix_isolation() {
        let backing: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::new());
        let gpu = PrefixedStore::new(Arc::clone(&backing), "gpu:");
        let plugin = PrefixedStore::new(Arc::clone(&backing), "plugin:");

        gpu.set("id", "gpu-value").unwrap();
        plugin.set("id", "plugin-value").unwrap();

        assert_eq!(gpu.get("id", Duration::from_millis(10)).unwrap(), "gpu-value");
        assert_eq!(
            plugin.get("id", Duration::from_millis(10)).unwrap(),
            "plugin-value"
        );
        assert_eq!(backing.try_get("gpu:id").unwrap().as_deref(), Some("gpu-value"));
    }

    #[test]
    fn test_overwrite_visible_to_readers() {
        let store = InMemoryKvStore::new();
        store.set("k", "first").unwrap();
        store.set("k", "second").unwrap();
        assert_eq!(store.get("k", Duration::from_millis(10)).unwrap(), "second");
    }
}
