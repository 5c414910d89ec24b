//! # Node Protocol
//!
//! This module implements the DHT node proper: the server-side RPC handler
//! and the client-side operations (PING, iterative FIND_NODE, record
//! store/find, ENTER bootstrap).
//!
//! ## Actor Architecture
//!
//! - [`Node`]: public handle, cheap to clone, carrying the contact, the
//!   network adapter, and a command channel
//! - `NodeActor`: owns the routing table and the held-record set; processes
//!   commands sequentially so neither needs a lock
//!
//! Full buckets resolve off-actor: the actor hands the stale contact to a
//! spawned ping and applies the probe result when it comes back, so routing
//! updates never block on the network.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `ping(addr)` | liveness probe; learns the responder's contact |
//! | `find_node(target)` | iterative lookup converging on the closest known contacts |
//! | `store_record(key)` | replicates a record marker onto the closest nodes |
//! | `find_record(key)` | checks that every closest node holds the record |
//! | `enter()` | transport-seeded bootstrap into the mesh |

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::identity::{merge_by_distance, Address, Contact, Distance, NodeId};
use crate::network::{Network, RequestHandler};
use crate::routing::{EvictionProbe, RoutingTable};
use crate::rpc::{Cmd, Rpc};

/// K, the bucket volume and replication width: how many contacts a bucket
/// holds and how many nodes a record is stored on.
pub const K: usize = 5;

/// Width of the initial lookup shortlist.
pub const REPLICATION: usize = 3;

/// α, the number of parallel probes issued per lookup round.
pub const CONCURRENCY: usize = 3;

const COMMAND_CHANNEL_SIZE: usize = 64;

/// FIND_RECORD found fewer confirmations than holders queried.
///
/// Carries the holder list the lookup produced so the caller can retry or
/// degrade with partial information.
#[derive(Clone, Debug)]
pub struct RecordNotFullyReplicated {
    pub holders: Vec<Contact>,
    pub confirmed: usize,
}

impl fmt::Display for RecordNotFullyReplicated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "record confirmed by {} of {} holders",
            self.confirmed,
            self.holders.len()
        )
    }
}

impl std::error::Error for RecordNotFullyReplicated {}

enum Command {
    ObserveContact(Contact),
    Closest(usize, NodeId, oneshot::Sender<Vec<Contact>>),
    LookupContact(NodeId, oneshot::Sender<Option<Contact>>),
    StoreRecord(NodeId),
    HasRecord(NodeId, oneshot::Sender<bool>),
    ApplyProbe(EvictionProbe, bool),
    Quit,
}

/// A DHT node: identity, network adapter, and a handle to the routing actor.
#[derive(Clone)]
pub struct Node {
    contact: Contact,
    network: Network,
    cmd_tx: mpsc::Sender<Command>,
}

struct NodeActor {
    routing: RoutingTable,
    records: HashSet<NodeId>,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    network: Network,
    contact: Contact,
}

impl Node {
    /// Builds a node around the channel pair the transport allocated for it
    /// and spawns its routing actor.
    pub fn new(
        id: NodeId,
        address: Address,
        inbound: mpsc::Receiver<Rpc>,
        outbound: mpsc::Sender<Rpc>,
        server_addr: Address,
        master: Contact,
    ) -> Self {
        let contact = Contact::new(id, address);
        let network = Network::new(inbound, outbound, server_addr, master);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        let actor = NodeActor {
            routing: RoutingTable::new(id, K),
            records: HashSet::new(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            network: network.clone(),
            contact,
        };
        tokio::spawn(actor.run());

        Self {
            contact,
            network,
            cmd_tx,
        }
    }

    pub fn id(&self) -> NodeId {
        self.contact.id()
    }

    pub fn address(&self) -> Address {
        self.contact.address()
    }

    pub fn contact(&self) -> Contact {
        self.contact
    }

    /// Spawns the listen loop and the entry sequence. `done` receives the
    /// node id once entry has finished (successfully or not).
    pub fn start(&self, done: mpsc::Sender<NodeId>) {
        let listener = self.clone();
        tokio::spawn(async move {
            let reason = listener.network.listen(Arc::new(listener.clone())).await;
            debug!(node = %listener.contact.id().short(), reason = %reason, "listen loop ended");
        });

        let joiner = self.clone();
        tokio::spawn(async move {
            joiner.enter().await;
            let _ = done.send(joiner.contact.id()).await;
        });
    }

    /// Joins the mesh through the transport's ENTER rendezvous, then warms
    /// the routing table: ping the first seed and the master, and look up
    /// the own id, the second seed, and the master id.
    pub async fn enter(&self) {
        let request = Rpc::request(self.contact).enter(self.network.server_addr());
        let reply = match self.network.send(request).await {
            Ok(reply) => reply,
            Err(error) => {
                debug!(node = %self.contact.id().short(), %error, "entry request failed");
                return;
            }
        };
        if reply.found_nodes.len() < 2 {
            warn!(node = %self.contact.id().short(), "entry reply carried no seed contacts");
            return;
        }
        let entry_seed = reply.found_nodes[0];
        let branch_seed = reply.found_nodes[1];
        if entry_seed.address() == Address::ZERO {
            warn!(node = %self.contact.id().short(), "entry reply carried an illegal seed");
        }
        let master = self.network.master();

        self.ping(entry_seed.address()).await;
        self.ping(master.address()).await;

        self.find_node(self.contact.id()).await;
        self.find_node(branch_seed.id()).await;
        self.find_node(master.id()).await;
    }

    /// Sends a PING to `address` and, on success, records the responder.
    pub async fn ping(&self, address: Address) {
        let request = Rpc::request(self.contact).ping(address);
        match self.network.send(request).await {
            Ok(reply) => self.observe_contact(reply.sender).await,
            Err(error) => {
                debug!(node = %self.contact.id().short(), to = %address, %error, "ping failed");
            }
        }
    }

    /// Iterative FIND_NODE: converges on the closest known contacts to
    /// `target`.
    ///
    /// Each round issues up to [`CONCURRENCY`] parallel FIND_NODE probes to
    /// shortlist members not yet queried in this lookup and merges the
    /// replies back into the shortlist, which stays distance-sorted and
    /// truncated to K. Known contacts are never dropped before they have
    /// been probed, so the closest shortlist distance is non-increasing
    /// across rounds; the loop ends once it stops strictly improving.
    /// Every contact reported in a reply is pinged in the background, which
    /// is how the local routing table learns the neighborhood.
    pub async fn find_node(&self, target: NodeId) -> Vec<Contact> {
        let mut shortlist = self.closest(REPLICATION, target).await;
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut best = shortlist
            .first()
            .map(|c| c.id().distance(target))
            .unwrap_or(Distance::MAX);

        loop {
            let probes: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.id()))
                .take(CONCURRENCY)
                .copied()
                .collect();
            if probes.is_empty() {
                return shortlist;
            }
            queried.extend(probes.iter().map(|c| c.id()));

            let mut round = JoinSet::new();
            for peer in probes {
                let node = self.clone();
                round.spawn(async move { node.find_node_query(peer, target).await });
            }

            let mut candidates: Vec<Contact> = Vec::new();
            while let Some(joined) = round.join_next().await {
                if let Ok(found) = joined {
                    candidates = merge_by_distance(&candidates, &found, target);
                }
            }

            trace!(
                node = %self.contact.id().short(),
                target = %target.short(),
                candidates = candidates.len(),
                "lookup round finished"
            );

            if candidates.is_empty() {
                return shortlist;
            }

            // Discoveries join the shortlist instead of replacing it, so
            // members not yet probed stay in play for later rounds.
            shortlist = merge_by_distance(&shortlist, &candidates, target);
            shortlist.truncate(K);

            let new_best = shortlist
                .first()
                .map(|c| c.id().distance(target))
                .unwrap_or(Distance::MAX);
            if new_best >= best {
                return shortlist;
            }
            best = new_best;
        }
    }

    /// One probe of the lookup round. Replies teach the routing table
    /// opportunistically: every reported contact gets a background ping.
    async fn find_node_query(&self, peer: Contact, target: NodeId) -> Vec<Contact> {
        let request = Rpc::request(self.contact).find_node(peer.address(), target);
        match self.network.send(request).await {
            Ok(reply) => {
                for found in &reply.found_nodes {
                    let node = self.clone();
                    let address = found.address();
                    tokio::spawn(async move {
                        node.ping(address).await;
                    });
                }
                reply.found_nodes
            }
            Err(error) => {
                debug!(
                    node = %self.contact.id().short(),
                    peer = %peer,
                    %error,
                    "lookup probe failed"
                );
                Vec::new()
            }
        }
    }

    /// Replicates `key` onto the closest nodes. Fire-and-forget: the sends
    /// run in the background and losses surface only as missing
    /// confirmations in a later [`Node::find_record`].
    pub async fn store_record(&self, key: NodeId) {
        let holders = self.find_node(key).await;
        debug!(
            node = %self.contact.id().short(),
            key = %key.short(),
            holders = holders.len(),
            "replicating record"
        );
        for holder in holders {
            let node = self.clone();
            tokio::spawn(async move {
                let request = Rpc::request(node.contact).store_record(holder.address(), key);
                if let Err(error) = node.network.send(request).await {
                    debug!(node = %node.contact.id().short(), to = %holder, %error, "store fan-out failed");
                }
            });
        }
    }

    /// Locates `key`: looks up the closest nodes and asks each whether it
    /// holds the record. `Ok` only if every queried holder confirms.
    pub async fn find_record(
        &self,
        key: NodeId,
    ) -> Result<Vec<Contact>, RecordNotFullyReplicated> {
        let holders = self.find_node(key).await;

        let mut queries = JoinSet::new();
        for holder in &holders {
            let node = self.clone();
            let holder = *holder;
            queries.spawn(async move {
                let request = Rpc::request(node.contact).find_record(holder.address(), key);
                match node.network.send(request).await {
                    Ok(reply) => reply.found_record,
                    Err(_) => false,
                }
            });
        }

        let mut confirmed = 0usize;
        while let Some(joined) = queries.join_next().await {
            if matches!(joined, Ok(true)) {
                confirmed += 1;
            }
        }

        if !holders.is_empty() && confirmed == holders.len() {
            Ok(holders)
        } else {
            Err(RecordNotFullyReplicated { holders, confirmed })
        }
    }

    /// Stops the routing actor. The listen loop ends separately, when the
    /// transport closes the node's inbound channel.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    /// Looks up a peer in the local routing table.
    pub async fn lookup_contact(&self, id: NodeId) -> Option<Contact> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::LookupContact(id, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    async fn observe_contact(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::ObserveContact(contact)).await;
    }

    async fn closest(&self, x: usize, target: NodeId) -> Vec<Contact> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Closest(x, target, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    async fn store_local(&self, key: NodeId) {
        let _ = self.cmd_tx.send(Command::StoreRecord(key)).await;
    }

    async fn has_record(&self, key: NodeId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::HasRecord(key, tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

#[async_trait]
impl RequestHandler for Node {
    /// Server side of the protocol. Every request first teaches the routing
    /// table about its sender; the reply reuses the request id and goes back
    /// to the sender's mailbox.
    async fn handle_request(&self, rpc: Rpc) {
        self.observe_contact(rpc.sender).await;

        let reply = match rpc.cmd {
            Cmd::Ping => Rpc::response(rpc.id, self.contact).ping(rpc.sender.address()),
            Cmd::FindNode => {
                let closest = self.closest(K, rpc.find_target).await;
                Rpc::response(rpc.id, self.contact)
                    .find_node(rpc.sender.address(), rpc.find_target)
                    .with_found_nodes(closest)
            }
            Cmd::FindRecord => {
                let held = self.has_record(rpc.find_target).await;
                Rpc::response(rpc.id, self.contact)
                    .find_record(rpc.sender.address(), rpc.find_target)
                    .with_found_record(held)
            }
            Cmd::StoreRecord => {
                self.store_local(rpc.find_target).await;
                Rpc::response(rpc.id, self.contact).store_record(rpc.sender.address(), rpc.find_target)
            }
            Cmd::Enter => {
                // The transport synthesizes ENTER replies; a request-side
                // ENTER reaching a node is a routing defect.
                warn!(node = %self.contact.id().short(), "ENTER request reached a node handler");
                return;
            }
        };

        if let Err(error) = self.network.send(reply).await {
            debug!(node = %self.contact.id().short(), %error, "failed to send reply");
        }
    }
}

impl NodeActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::ObserveContact(contact) => {
                    if let Some(probe) = self.routing.add_contact(contact) {
                        self.probe_stale_entry(probe);
                    }
                }
                Command::Closest(x, target, reply) => {
                    let _ = reply.send(self.routing.closest(x, target));
                }
                Command::LookupContact(id, reply) => {
                    let _ = reply.send(self.routing.lookup_contact(id));
                }
                Command::StoreRecord(key) => {
                    self.records.insert(key);
                }
                Command::HasRecord(key, reply) => {
                    let _ = reply.send(self.records.contains(&key));
                }
                Command::ApplyProbe(probe, stale_alive) => {
                    self.routing.apply_probe(probe, stale_alive);
                }
                Command::Quit => break,
            }
        }
    }

    /// Pings the stale end of a full bucket off-actor and reports back.
    fn probe_stale_entry(&self, probe: EvictionProbe) {
        let network = self.network.clone();
        let cmd_tx = self.cmd_tx.clone();
        let contact = self.contact;
        tokio::spawn(async move {
            let request = Rpc::request(contact).ping(probe.stale.address());
            let alive = network.send(request).await.is_ok();
            let _ = cmd_tx.send(Command::ApplyProbe(probe, alive)).await;
        });
    }
}
