//! # Network Adapter and Pending Table
//!
//! Per-node plumbing between the protocol layer and the transport:
//!
//! - [`PendingTable`]: the request/response multiplexer. Every in-flight
//!   request registers a single-shot waiter under its RPC id; the one inbound
//!   stream pairs responses back to waiters by that id alone.
//! - [`Network`]: the adapter owning the node's outbound channel and its
//!   parked inbound receiver. [`Network::send`] registers, emits, and awaits
//!   with a timeout; [`Network::listen`] drains the inbound channel and
//!   dispatches each frame.
//!
//! ## Concurrency
//!
//! The pending table is a mutex-guarded map with O(1) critical sections; no
//! lock is ever held across a channel operation. `listen` spawns one task per
//! inbound request, so handler completion order is unconstrained — only the
//! id correlation pairs requests with responses.
//!
//! ## Failure model
//!
//! Transport losses are silent; they surface only as [`NetError::Timeout`] at
//! the initiator. Responses that arrive after their waiter is gone are
//! logged and discarded ([`PendingTable::deliver`] returns `false`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration};
use tracing::{debug, trace};

use crate::identity::{Address, Contact, NodeId};
use crate::rpc::Rpc;

/// How long a request waits for its response before the waiter is cancelled.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised by the adapter and pending table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NetError {
    /// The RPC id is already registered; the caller re-rolls the id.
    IdInUse,
    /// No response arrived within [`TIMEOUT`].
    Timeout,
    /// The node's channel to or from the transport is closed.
    ServerDown,
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            NetError::IdInUse => "RPC id in use",
            NetError::Timeout => "request timed out",
            NetError::ServerDown => "server down",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for NetError {}

/// Capability the adapter dispatches inbound requests into.
///
/// The transport side never holds the node directly; the node hands a handle
/// to itself to [`Network::listen`] at start-up.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, rpc: Rpc);
}

/// In-flight request registry: RPC id → single-shot waiter.
///
/// At most one entry per id; an entry is consumed by the first matching
/// `deliver` or removed by `cancel`.
#[derive(Default)]
pub struct PendingTable {
    waiters: Mutex<HashMap<NodeId, oneshot::Sender<Rpc>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `id` and returns its read handle.
    pub fn register(&self, id: NodeId) -> Result<oneshot::Receiver<Rpc>, NetError> {
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.contains_key(&id) {
            return Err(NetError::IdInUse);
        }
        let (tx, rx) = oneshot::channel();
        waiters.insert(id, tx);
        Ok(rx)
    }

    /// Posts `rpc` to the waiter registered under `id`, consuming the entry.
    /// Returns `false` if no waiter exists (late or unknown response).
    pub fn deliver(&self, id: NodeId, rpc: Rpc) -> bool {
        let waiter = self.waiters.lock().unwrap().remove(&id);
        match waiter {
            Some(tx) => {
                // The receiver may have been dropped by a racing timeout;
                // the entry is consumed either way.
                let _ = tx.send(rpc);
                true
            }
            None => false,
        }
    }

    /// Removes the waiter for `id` if present. Safe when absent.
    pub fn cancel(&self, id: NodeId) {
        self.waiters.lock().unwrap().remove(&id);
    }
}

/// Per-node transport adapter.
///
/// Cheap to clone: clones share the outbound channel and pending table. The
/// inbound receiver is parked until the first [`Network::listen`] call takes
/// it.
#[derive(Clone)]
pub struct Network {
    inbound: Arc<Mutex<Option<mpsc::Receiver<Rpc>>>>,
    outbound: mpsc::Sender<Rpc>,
    pending: Arc<PendingTable>,
    server_addr: Address,
    master: Contact,
}

impl Network {
    pub fn new(
        inbound: mpsc::Receiver<Rpc>,
        outbound: mpsc::Sender<Rpc>,
        server_addr: Address,
        master: Contact,
    ) -> Self {
        Self {
            inbound: Arc::new(Mutex::new(Some(inbound))),
            outbound,
            pending: Arc::new(PendingTable::new()),
            server_addr,
            master,
        }
    }

    /// The transport's well-known server address (ENTER destination).
    pub fn server_addr(&self) -> Address {
        self.server_addr
    }

    /// The bootstrap master node.
    pub fn master(&self) -> Contact {
        self.master
    }

    /// Emits `rpc` toward the transport.
    ///
    /// Responses are fire-and-forget. Requests register a waiter under a
    /// collision-free id (re-rolled on [`NetError::IdInUse`]) and then await
    /// the response, racing [`TIMEOUT`]; on expiry the waiter is cancelled
    /// and [`NetError::Timeout`] returned.
    pub async fn send(&self, mut rpc: Rpc) -> Result<Rpc, NetError> {
        if rpc.response {
            trace!(frame = %rpc, "sending response");
            self.outbound
                .send(rpc.clone())
                .await
                .map_err(|_| NetError::ServerDown)?;
            return Ok(rpc);
        }

        let waiter = loop {
            match self.pending.register(rpc.id) {
                Ok(rx) => break rx,
                Err(NetError::IdInUse) => rpc.id = NodeId::random(),
                Err(other) => return Err(other),
            }
        };

        trace!(frame = %rpc, "sending request");
        if self.outbound.send(rpc.clone()).await.is_err() {
            self.pending.cancel(rpc.id);
            return Err(NetError::ServerDown);
        }

        match time::timeout(TIMEOUT, waiter).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.cancel(rpc.id);
                Err(NetError::ServerDown)
            }
            Err(_) => {
                self.pending.cancel(rpc.id);
                debug!(id = %rpc.id.short(), cmd = %rpc.cmd, "request timed out");
                Err(NetError::Timeout)
            }
        }
    }

    /// Drains the inbound channel until it closes.
    ///
    /// Responses resolve their pending waiter; requests each run on a fresh
    /// task through `handler`. Returns [`NetError::ServerDown`] once the
    /// channel is closed (node shut down).
    pub async fn listen(&self, handler: Arc<dyn RequestHandler>) -> NetError {
        let inbound = self.inbound.lock().unwrap().take();
        let Some(mut inbound) = inbound else {
            return NetError::ServerDown;
        };

        while let Some(rpc) = inbound.recv().await {
            if rpc.response {
                let id = rpc.id;
                if !self.pending.deliver(id, rpc) {
                    debug!(id = %id.short(), "no matching RPC id, discarding late response");
                }
            } else {
                let handler = handler.clone();
                tokio::spawn(async move {
                    handler.handle_request(rpc).await;
                });
            }
        }
        NetError::ServerDown
    }
}
