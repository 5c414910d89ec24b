//! # RPC Frames
//!
//! The single message type exchanged between nodes. A frame is a plain value:
//! it is created per call, handed to the transport through a channel, and
//! discarded after delivery. There is no wire encoding — the transport is
//! in-process.
//!
//! ## Correlation
//!
//! Requests carry a fresh random 160-bit id; a response echoes the id of the
//! request it answers, and that id is the only thing pairing the two. The
//! `response` flag decides which side of the pending table a delivered frame
//! lands on.
//!
//! | Tag | Request payload | Response payload |
//! |-----|-----------------|------------------|
//! | `Ping` | — | sender only |
//! | `FindNode` | `find_target` | `found_nodes` |
//! | `FindRecord` | `find_target` | `found_record` |
//! | `StoreRecord` | `find_target` | sender only |
//! | `Enter` | — | `found_nodes` (synthesized by the transport) |

use std::fmt;

use crate::identity::{Address, Contact, NodeId};

/// Command tag of an RPC frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Cmd {
    #[default]
    Ping,
    StoreRecord,
    FindNode,
    FindRecord,
    Enter,
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cmd::Ping => "PING",
            Cmd::StoreRecord => "STORE RECORD",
            Cmd::FindNode => "FIND NODE",
            Cmd::FindRecord => "FIND RECORD",
            Cmd::Enter => "ENTER",
        };
        f.write_str(name)
    }
}

/// One RPC frame, request or response.
///
/// `sender` is the originator of *this* frame, so on a response it names the
/// replier. `receiver` is the destination mailbox the transport routes by.
#[derive(Clone, Debug, Default)]
pub struct Rpc {
    pub id: NodeId,
    pub cmd: Cmd,
    pub response: bool,
    pub sender: Contact,
    pub receiver: Address,
    pub find_target: NodeId,
    pub found_nodes: Vec<Contact>,
    pub found_record: bool,
}

impl Rpc {
    /// A fresh request frame with a random correlation id.
    pub fn request(sender: Contact) -> Self {
        Rpc {
            id: NodeId::random(),
            sender,
            ..Default::default()
        }
    }

    /// A response frame borrowing only the correlation id of the request it
    /// answers.
    pub fn response(id: NodeId, sender: Contact) -> Self {
        Rpc {
            id,
            sender,
            response: true,
            ..Default::default()
        }
    }

    pub fn ping(mut self, receiver: Address) -> Self {
        self.cmd = Cmd::Ping;
        self.receiver = receiver;
        self
    }

    pub fn find_node(mut self, receiver: Address, target: NodeId) -> Self {
        self.cmd = Cmd::FindNode;
        self.receiver = receiver;
        self.find_target = target;
        self
    }

    pub fn store_record(mut self, receiver: Address, key: NodeId) -> Self {
        self.cmd = Cmd::StoreRecord;
        self.receiver = receiver;
        self.find_target = key;
        self
    }

    pub fn find_record(mut self, receiver: Address, key: NodeId) -> Self {
        self.cmd = Cmd::FindRecord;
        self.receiver = receiver;
        self.find_target = key;
        self
    }

    pub fn enter(mut self, receiver: Address) -> Self {
        self.cmd = Cmd::Enter;
        self.receiver = receiver;
        self
    }

    pub fn with_found_nodes(mut self, nodes: Vec<Contact>) -> Self {
        self.found_nodes = nodes;
        self
    }

    pub fn with_found_record(mut self, held: bool) -> Self {
        self.found_record = held;
        self
    }
}

impl fmt::Display for Rpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} id={} from={} to={}",
            self.cmd,
            if self.response { "response" } else { "request" },
            self.id.short(),
            self.sender,
            self.receiver,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_response_share_the_correlation_id() {
        let sender = Contact::new(NodeId::random(), Address::random());
        let replier = Contact::new(NodeId::random(), Address::random());

        let request = Rpc::request(sender).find_node(replier.address(), NodeId::random());
        let reply = Rpc::response(request.id, replier)
            .find_node(sender.address(), request.find_target)
            .with_found_nodes(vec![sender]);

        assert_eq!(reply.id, request.id);
        assert!(!request.response);
        assert!(reply.response);
        assert_eq!(reply.receiver, sender.address());
        assert_eq!(reply.found_nodes, vec![sender]);
    }

    #[test]
    fn fresh_requests_get_distinct_ids() {
        let sender = Contact::new(NodeId::random(), Address::random());
        let a = Rpc::request(sender);
        let b = Rpc::request(sender);

        assert_ne!(a.id, b.id);
        assert!(!a.id.is_zero());
    }

    #[test]
    fn builders_set_tag_receiver_and_payload() {
        let sender = Contact::new(NodeId::random(), Address::random());
        let to = Address::from_octets([10, 0, 0, 1]);
        let key = NodeId::random();

        let store = Rpc::request(sender).store_record(to, key);
        assert_eq!(store.cmd, Cmd::StoreRecord);
        assert_eq!(store.receiver, to);
        assert_eq!(store.find_target, key);

        let find = Rpc::request(sender).find_record(to, key).with_found_record(true);
        assert_eq!(find.cmd, Cmd::FindRecord);
        assert!(find.found_record);

        let enter = Rpc::request(sender).enter(Address::ZERO);
        assert_eq!(enter.cmd, Cmd::Enter);
        assert_eq!(enter.receiver, Address::ZERO);
    }

    #[test]
    fn every_cmd_tag_has_a_name() {
        let tags = [
            Cmd::Ping,
            Cmd::StoreRecord,
            Cmd::FindNode,
            Cmd::FindRecord,
            Cmd::Enter,
        ];
        for tag in tags {
            assert!(!tag.to_string().is_empty());
        }
        assert_eq!(Cmd::FindNode.to_string(), "FIND NODE");
    }
}
