//! # kadmesh — Kademlia-style DHT over a simulated transport
//!
//! kadmesh implements the routing core of a Kademlia-style distributed hash
//! table: a mesh of peers that locate one another through the XOR metric and
//! replicate small record markers keyed by 160-bit identifiers. The
//! transport is an in-process simulation ("simnet") whose drop behavior and
//! ENTER seeding are part of the protocol contract.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | 160-bit ids, XOR distance, addresses, contacts, distance ordering |
//! | `rpc` | the RPC frame and its command tags |
//! | `network` | per-node adapter: pending table, send with timeout, listen loop |
//! | `routing` | 160 k-buckets with stale-probe eviction |
//! | `node` | protocol: PING, iterative FIND_NODE, record store/find, ENTER |
//! | `simnet` | process-wide router: mailboxes, drop simulation, cluster spawning |
//!
//! ## Architecture
//!
//! Components communicate over channels and each node's mutable routing
//! state is owned by an actor task:
//!
//! - A [`Node`] is a cheap-to-clone handle; its actor owns the routing table
//!   and record set and processes commands sequentially.
//! - The [`Network`] adapter multiplexes concurrent in-flight requests over
//!   one inbound channel, pairing responses to waiters by RPC id through the
//!   [`PendingTable`].
//! - The [`Simnet`] dispatcher drains a shared listener channel and routes
//!   each frame on its own task; per-mailbox FIFO is preserved, handler
//!   completion order is not.
//!
//! ## Failure Model
//!
//! Transport losses are silent and surface only as [`NetError::Timeout`] at
//! the initiator. Application-level degradation
//! ([`RecordNotFullyReplicated`]) carries partial results so callers can
//! retry.

mod identity;
mod network;
mod node;
mod routing;
mod rpc;
mod simnet;

pub use identity::{
    dedup_contacts, merge_by_distance, sort_by_distance, Address, Contact, Distance, NodeId,
    KEYSPACE,
};
pub use network::{NetError, Network, PendingTable, RequestHandler, TIMEOUT};
pub use node::{Node, RecordNotFullyReplicated, CONCURRENCY, K, REPLICATION};
pub use rpc::{Cmd, Rpc};
pub use simnet::Simnet;
