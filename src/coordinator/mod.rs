//! Coordinator and key-value store bootstrap
//!
//! Stands up the rendezvous that multi-process backends need before client
//! construction: rank 0 binds a TCP service at `address:port` and every
//! other rank connects to it. The handshake is one-shot, blocking, bounded
//! by an explicit timeout, and cancellable through a token; it either yields
//! a [`Coordinator`] or a [`RendezvousError`] telling the caller whether it
//! timed out, was rejected, or hit the network. It never partially
//! succeeds.
//!
//! The coordinator owns the session for its lifetime and hands out
//! [`KeyValueStore`] views namespaced per backend family. The store must
//! stay alive as long as any client that might read from it; ownership of
//! the coordinator transfers to the caller with the initialization result.

mod kv;
mod service;

pub use kv::{InMemoryKvStore, KeyValueStore, PrefixedStore};

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::{keys, EnvSource};
use crate::topology::{ProcessTopology, TopologyError};
use service::{Request, Response, ServiceState};

/// Port the rendezvous leader binds when none is configured.
pub const DEFAULT_COORDINATOR_PORT: &str = "8547";

/// Handshake deadline when none is configured.
pub const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(300);

/// Delay between connect attempts while the leader is still coming up.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Slack added to a store read's deadline so the server-side wait, not the
/// socket timeout, decides the outcome.
const KV_EXCHANGE_GRACE: Duration = Duration::from_millis(500);

/// Why a rendezvous or store operation failed.
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// Not every participant arrived before the deadline
    #[error("rendezvous timed out after {waited:?}")]
    Timeout { waited: Duration },

    /// The caller's cancellation token fired
    #[error("rendezvous cancelled")]
    Cancelled,

    /// The leader refused this participant
    #[error("rejected by coordinator: {reason}")]
    Rejected { reason: String },

    /// The resolved rank/world-size relations are inconsistent
    #[error("inconsistent topology: {0}")]
    Topology(#[from] TopologyError),

    /// A peer spoke something other than the rendezvous protocol
    #[error("malformed coordinator exchange: {0}")]
    Protocol(String),

    /// A store read found no writer before its deadline
    #[error("key '{key}' not available within {waited:?}")]
    KeyUnavailable { key: String, waited: Duration },

    /// Bind, resolution, or socket failure
    #[error("coordinator I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a rendezvous needs to run.
#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    pub global_rank: usize,
    pub global_world_size: usize,
    pub address: String,
    pub port: String,
    pub timeout: Duration,
    pub cancel: Option<CancellationToken>,
}

impl RendezvousConfig {
    /// Config with the default endpoint and deadline.
    pub fn new(global_rank: usize, global_world_size: usize) -> Self {
        Self {
            global_rank,
            global_world_size,
            address: "localhost".to_string(),
            port: DEFAULT_COORDINATOR_PORT.to_string(),
            timeout: DEFAULT_RENDEZVOUS_TIMEOUT,
            cancel: None,
        }
    }

    /// Endpoint and deadline from the configuration source, ranks from the
    /// resolved topology.
    pub fn from_env(env: &EnvSource, topology: &ProcessTopology) -> Self {
        let address = env.get_string(keys::MASTER_ADDR, "localhost");
        let port = env.get_string(keys::COORDINATOR_PORT, DEFAULT_COORDINATOR_PORT);
        let timeout_secs = env.get_usize(
            keys::RENDEZVOUS_TIMEOUT_SECS,
            DEFAULT_RENDEZVOUS_TIMEOUT.as_secs() as usize,
        );
        Self {
            global_rank: topology.global_rank,
            global_world_size: topology.global_world_size,
            address,
            port,
            timeout: Duration::from_secs(timeout_secs as u64),
            cancel: None,
        }
    }

    /// Override the leader address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Override the leader port.
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    /// Override the handshake deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cancel the handshake from outside when the token fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// `address:port` as dialed and bound.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

enum Session {
    Leader(Arc<ServiceState>),
    Follower,
}

/// An established rendezvous session.
///
/// Rank 0 keeps the service alive for the session; every rank keeps a small
/// runtime for store operations. Dropping the coordinator tears the session
/// down, so it must outlive any client still using its store.
pub struct Coordinator {
    global_rank: usize,
    global_world_size: usize,
    address: String,
    port: String,
    timeout: Duration,
    handle: Handle,
    runtime: Option<Runtime>,
    cancel: CancellationToken,
    session: Session,
}

impl Coordinator {
    /// Run the rendezvous to completion.
    ///
    /// Blocks the calling thread until every participant has arrived, the
    /// deadline passes, the token fires, or the leader rejects this rank.
    pub fn bootstrap(mut config: RendezvousConfig) -> Result<Self, RendezvousError> {
        if config.global_rank >= config.global_world_size {
            return Err(RendezvousError::Topology(
                TopologyError::GlobalRankOutOfRange {
                    global_rank: config.global_rank,
                    global_world_size: config.global_world_size,
                },
            ));
        }

        let endpoint = config.endpoint();
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("accelforge-coordinator")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let cancel = config.cancel.clone().unwrap_or_default();
        let started = Instant::now();

        let session = if config.global_rank == 0 {
            let state = ServiceState::new(config.global_world_size);
            let listener = handle.block_on(TcpListener::bind(endpoint.as_str()))?;
            // Port 0 binds an ephemeral port; record the one actually bound.
            config.port = listener.local_addr()?.port().to_string();
            debug!(endpoint = %config.endpoint(), world_size = config.global_world_size,
                "rendezvous leader listening");
            handle.spawn(service::run_service(
                listener,
                Arc::clone(&state),
                cancel.clone(),
            ));

            let barrier = async {
                tokio::select! {
                    _ = state.barrier_complete() => Ok(()),
                    _ = cancel.cancelled() => Err(RendezvousError::Cancelled),
                }
            };
            match handle.block_on(async { tokio::time::timeout(config.timeout, barrier).await }) {
                Ok(Ok(())) => {}
                Ok(Err(cancelled)) => {
                    cancel.cancel();
                    return Err(cancelled);
                }
                Err(_) => {
                    cancel.cancel();
                    return Err(RendezvousError::Timeout {
                        waited: config.timeout,
                    });
                }
            }
            Session::Leader(state)
        } else {
            handle.block_on(join_as_follower(&endpoint, &config, &cancel))?;
            Session::Follower
        };

        info!(
            rank = config.global_rank,
            world_size = config.global_world_size,
            %endpoint,
            elapsed = ?started.elapsed(),
            "rendezvous complete"
        );

        Ok(Self {
            global_rank: config.global_rank,
            global_world_size: config.global_world_size,
            address: config.address,
            port: config.port,
            timeout: config.timeout,
            handle,
            runtime: Some(runtime),
            cancel,
            session,
        })
    }

    pub fn global_rank(&self) -> usize {
        self.global_rank
    }

    pub fn global_world_size(&self) -> usize {
        self.global_world_size
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Whether this process is the rendezvous leader.
    pub fn is_leader(&self) -> bool {
        matches!(self.session, Session::Leader(_))
    }

    /// `address:port` of the session.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Store view namespaced by `prefix`.
    ///
    /// Distinct prefixes per backend family ("gpu:", "plugin:") keep keys
    /// from colliding if more than one family coordinates in this process.
    pub fn kv_store(&self, prefix: &str) -> Arc<dyn KeyValueStore> {
        let inner: Arc<dyn KeyValueStore> = match &self.session {
            Session::Leader(state) => Arc::new(LeaderStore {
                state: Arc::clone(state),
                handle: self.handle.clone(),
            }),
            Session::Follower => Arc::new(SessionStore {
                endpoint: self.endpoint(),
                handle: self.handle.clone(),
                op_timeout: self.timeout,
            }),
        };
        Arc::new(PrefixedStore::new(inner, prefix))
    }

    /// Tear the session down. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(2));
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("global_rank", &self.global_rank)
            .field("global_world_size", &self.global_world_size)
            .field("endpoint", &self.endpoint())
            .field("leader", &self.is_leader())
            .finish()
    }
}

/// Follower side of the handshake: dial until the leader answers or the
/// deadline passes, then wait for the barrier to complete.
async fn join_as_follower(
    endpoint: &str,
    config: &RendezvousConfig,
    cancel: &CancellationToken,
) -> Result<(), RendezvousError> {
    let deadline = Instant::now() + config.timeout;
    let request = Request::Hello {
        rank: config.global_rank,
        world_size: config.global_world_size,
    };

    loop {
        if cancel.is_cancelled() {
            return Err(RendezvousError::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RendezvousError::Timeout {
                waited: config.timeout,
            });
        }

        match service::exchange(endpoint, &request, remaining).await {
            Ok(Response::Welcome { .. }) => return Ok(()),
            Ok(Response::Rejected { reason }) => {
                return Err(RendezvousError::Rejected { reason })
            }
            Ok(other) => {
                return Err(RendezvousError::Protocol(format!(
                    "unexpected rendezvous response: {other:?}"
                )))
            }
            Err(RendezvousError::Io(e)) => {
                // Leader may not be up yet; keep dialing until the deadline.
                trace!(error = %e, %endpoint, "coordinator not reachable, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(CONNECT_RETRY_INTERVAL) => {}
                    _ = cancel.cancelled() => return Err(RendezvousError::Cancelled),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Leader's view of the session store: straight into the service state.
struct LeaderStore {
    state: Arc<ServiceState>,
    handle: Handle,
}

impl KeyValueStore for LeaderStore {
    fn set(&self, key: &str, value: &str) -> Result<(), RendezvousError> {
        self.handle
            .block_on(self.state.put(key.to_string(), value.to_string()));
        Ok(())
    }

    fn get(&self, key: &str, timeout: Duration) -> Result<String, RendezvousError> {
        self.handle
            .block_on(self.state.get_waiting(key, timeout))
            .ok_or_else(|| RendezvousError::KeyUnavailable {
                key: key.to_string(),
                waited: timeout,
            })
    }

    fn try_get(&self, key: &str) -> Result<Option<String>, RendezvousError> {
        Ok(self.handle.block_on(self.state.try_get(key)))
    }
}

/// Follower's view of the session store: one exchange per operation.
struct SessionStore {
    endpoint: String,
    handle: Handle,
    op_timeout: Duration,
}

impl SessionStore {
    fn exchange(&self, request: &Request, deadline: Duration) -> Result<Response, RendezvousError> {
        self.handle
            .block_on(service::exchange(&self.endpoint, request, deadline))
    }
}

impl KeyValueStore for SessionStore {
    fn set(&self, key: &str, value: &str) -> Result<(), RendezvousError> {
        let request = Request::Put {
            key: key.to_string(),
            value: value.to_string(),
        };
        match self.exchange(&request, self.op_timeout)? {
            Response::Done => Ok(()),
            Response::Rejected { reason } => Err(RendezvousError::Rejected { reason }),
            other => Err(RendezvousError::Protocol(format!(
                "unexpected store response: {other:?}"
            ))),
        }
    }

    fn get(&self, key: &str, timeout: Duration) -> Result<String, RendezvousError> {
        let request = Request::Get {
            key: key.to_string(),
            wait_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
        match self.exchange(&request, timeout + KV_EXCHANGE_GRACE)? {
            Response::Value { value } => Ok(value),
            Response::Missing => Err(RendezvousError::KeyUnavailable {
                key: key.to_string(),
                waited: timeout,
            }),
            Response::Rejected { reason } => Err(RendezvousError::Rejected { reason }),
            other => Err(RendezvousError::Protocol(format!(
                "unexpected store response: {other:?}"
            ))),
        }
    }

    fn try_get(&self, key: &str) -> Result<Option<String>, RendezvousError> {
        let request = Request::Get {
            key: key.to_string(),
            wait_ms: 0,
        };
        match self.exchange(&request, KV_EXCHANGE_GRACE)? {
            Response::Value { value } => Ok(Some(value)),
            Response::Missing => Ok(None),
            Response::Rejected { reason } => Err(RendezvousError::Rejected { reason }),
            other => Err(RendezvousError::Protocol(format!(
                "unexpected store response: {other:?}"
            ))),
        }
    }
}
