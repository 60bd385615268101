//! Rendezvous leader service and wire protocol.
//!
//! Rank 0 serves line-framed JSON over TCP. Every connection carries exactly
//! one request and one response; followers reconnect per operation. The
//! service owns the session's key-value map, so `Get` can wait server-side
//! for a key a peer has not written yet.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::RendezvousError;

/// One request from a follower (or from the leader's own store view).
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum Request {
    /// Join the rendezvous; answered once every expected rank has joined.
    Hello { rank: usize, world_size: usize },
    /// Store a handshake value.
    Put { key: String, value: String },
    /// Read a handshake value, waiting up to `wait_ms` for it to appear.
    Get { key: String, wait_ms: u64 },
}

/// One response from the leader.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "re", rename_all = "snake_case")]
pub(crate) enum Response {
    Welcome { world_size: usize },
    Rejected { reason: String },
    Done,
    Value { value: String },
    Missing,
}

/// Shared state of one rendezvous session.
pub(crate) struct ServiceState {
    world_size: usize,
    joined: Mutex<HashSet<usize>>,
    complete: watch::Sender<bool>,
    entries: Mutex<HashMap<String, String>>,
    changed: Notify,
}

impl ServiceState {
    pub(crate) fn new(world_size: usize) -> Arc<Self> {
        // A world of one is complete before anyone connects.
        let (complete, _) = watch::channel(world_size <= 1);
        Arc::new(Self {
            world_size,
            joined: Mutex::new(HashSet::new()),
            complete,
            entries: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        })
    }

    /// Resolves once every expected follower has joined.
    pub(crate) async fn barrier_complete(&self) {
        let mut rx = self.complete.subscribe();
        // wait_for only errs when the sender is dropped, and the sender
        // lives in this same struct.
        let _ = rx.wait_for(|done| *done).await;
    }

    pub(crate) async fn put(&self, key: String, value: String) {
        self.entries.lock().await.insert(key, value);
        self.changed.notify_waiters();
    }

    pub(crate) async fn try_get(&self, key: &str) -> Option<String> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Read a value, waiting up to `wait` for a writer.
    pub(crate) async fn get_waiting(&self, key: &str, wait: Duration) -> Option<String> {
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);
        loop {
            // Register interest before checking so a racing put is not missed.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(value) = self.try_get(key).await {
                return Some(value);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = &mut deadline => return self.try_get(key).await,
            }
        }
    }

    async fn handle_hello(&self, rank: usize, world_size: usize) -> Response {
        if world_size != self.world_size {
            return Response::Rejected {
                reason: format!(
                    "world size mismatch: peer expects {world_size}, coordinator has {}",
                    self.world_size
                ),
            };
        }
        if rank == 0 || rank >= self.world_size {
            return Response::Rejected {
                reason: format!("rank {rank} out of range for world size {world_size}"),
            };
        }

        {
            let mut joined = self.joined.lock().await;
            if !joined.insert(rank) {
                return Response::Rejected {
                    reason: format!("duplicate rank {rank}"),
                };
            }
            debug!(rank, joined = joined.len(), expected = self.world_size - 1,
                "rendezvous participant joined");
            if joined.len() == self.world_size - 1 {
                self.complete.send_replace(true);
            }
        }

        self.barrier_complete().await;
        Response::Welcome {
            world_size: self.world_size,
        }
    }
}

/// Accept loop. Runs until cancelled; one task per connection.
pub(crate) async fn run_service(
    listener: TcpListener,
    state: Arc<ServiceState>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!(%peer, "coordinator accepted connection");
                    let state = Arc::clone(&state);
                    let cancel = cancel.clone();
                    tokio::spawn(handle_connection(stream, state, cancel));
                }
                Err(e) => {
                    warn!(error = %e, "coordinator accept failed");
                }
            },
            _ = cancel.cancelled() => {
                debug!("coordinator service shutting down");
                break;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<ServiceState>, cancel: CancellationToken) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let read = tokio::select! {
        read = reader.read_line(&mut line) => read,
        _ = cancel.cancelled() => return,
    };
    match read {
        Ok(0) => return,
        Ok(_) => {}
        Err(e) => {
            trace!(error = %e, "coordinator connection read failed");
            return;
        }
    }

    let response = match serde_json::from_str::<Request>(line.trim_end()) {
        Ok(request) => {
            let dispatch = async {
                match request {
                    Request::Hello { rank, world_size } => {
                        state.handle_hello(rank, world_size).await
                    }
                    Request::Put { key, value } => {
                        state.put(key, value).await;
                        Response::Done
                    }
                    Request::Get { key, wait_ms } => {
                        match state
                            .get_waiting(&key, Duration::from_millis(wait_ms))
                            .await
                        {
                            Some(value) => Response::Value { value },
                            None => Response::Missing,
                        }
                    }
                }
            };
            tokio::select! {
                response = dispatch => response,
                _ = cancel.cancelled() => Response::Rejected {
                    reason: "coordinator shutting down".to_string(),
                },
            }
        }
        Err(e) => Response::Rejected {
            reason: format!("malformed request: {e}"),
        },
    };

    let mut payload = match serde_json::to_string(&response) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "coordinator response encoding failed");
            return;
        }
    };
    payload.push('\n');
    if let Err(e) = write_half.write_all(payload.as_bytes()).await {
        trace!(error = %e, "coordinator response write failed");
    }
}

/// One request/response exchange against the leader, bounded by `deadline`.
pub(crate) async fn exchange(
    addr: &str,
    request: &Request,
    deadline: Duration,
) -> Result<Response, RendezvousError> {
    let attempt = async {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, mut write_half) = stream.into_split();

        let mut payload = serde_json::to_string(request)
            .map_err(|e| RendezvousError::Protocol(e.to_string()))?;
        payload.push('\n');
        write_half.write_all(payload.as_bytes()).await?;

        let mut line = String::new();
        let read = BufReader::new(read_half).read_line(&mut line).await?;
        if read == 0 {
            return Err(RendezvousError::Protocol(
                "coordinator closed the connection".to_string(),
            ));
        }
        serde_json::from_str::<Response>(line.trim_end())
            .map_err(|e| RendezvousError::Protocol(e.to_string()))
    };

    match tokio::time::timeout(deadline, attempt).await {
        Ok(result) => result,
        Err(_) => Err(RendezvousError::Timeout { waited: deadline }),
    }
}
