//! # Identifiers and Distance Primitives
//!
//! This module defines the core identity types used throughout kadmesh:
//!
//! - [`NodeId`]: 160-bit identifier stored as five big-endian 32-bit words
//! - [`Distance`]: XOR distance between two identifiers, totally ordered
//! - [`Address`]: opaque 4-byte mailbox tag used by the transport
//! - [`Contact`]: the (id, address) binding peers exchange
//!
//! ## Identity Model
//!
//! Identifiers double as routing keys: nodes, records, and RPC correlation
//! ids all live in the same 160-bit keyspace and are compared with the XOR
//! metric. The all-zero identifier is reserved (the transport uses it as its
//! server sentinel), so [`NodeId::random`] never yields it.
//!
//! ## Ordering Invariants
//!
//! - `d(a, b) = a XOR b`, compared word-wise from the most significant word
//! - `d(a, a) == Distance::ZERO`; `d(a, b) == d(b, a)`
//! - `prefix_len(a, b)` is the number of leading zero bits of `d(a, b)`,
//!   160 iff `a == b`
//! - [`sort_by_distance`] orders ascending by distance to a target, breaking
//!   ties larger-id-first so that [`dedup_contacts`] collapses equal ids
//!   without reordering distinct ones

use std::fmt;

use rand::Rng;

/// Width of the identifier space in bits, and the bucket count of the
/// routing table.
pub const KEYSPACE: usize = 160;

const ID_WORDS: usize = 5;

/// A 160-bit identifier: five 32-bit words, most significant first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId([u32; ID_WORDS]);

impl NodeId {
    /// The reserved all-zero identifier. Never assigned to a live node.
    pub const ZERO: NodeId = NodeId([0; ID_WORDS]);

    /// Returns a uniformly random, non-zero identifier.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut words = [0u32; ID_WORDS];
            for word in words.iter_mut() {
                *word = rng.gen();
            }
            let id = NodeId(words);
            if !id.is_zero() {
                return id;
            }
        }
    }

    pub const fn from_words(words: [u32; ID_WORDS]) -> Self {
        NodeId(words)
    }

    pub const fn words(&self) -> [u32; ID_WORDS] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// XOR distance to `other`.
    pub fn distance(&self, other: NodeId) -> Distance {
        let mut words = [0u32; ID_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.0[i] ^ other.0[i];
        }
        Distance(words)
    }

    /// Shared prefix length with `other` in bits: the number of leading zero
    /// bits of the XOR distance. 160 iff the ids are equal.
    pub fn prefix_len(&self, other: NodeId) -> usize {
        self.distance(other).leading_zeros()
    }

    /// Big-endian byte rendering, used for hex display.
    pub fn to_be_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        for (i, word) in self.0.iter().enumerate() {
            out[i * 4..(i + 1) * 4].copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.to_be_bytes()[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_be_bytes()))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

/// XOR distance between two identifiers.
///
/// The derived ordering is lexicographic over the big-endian words, which is
/// exactly the unsigned-integer order on the 160-bit value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Distance([u32; ID_WORDS]);

impl Distance {
    pub const ZERO: Distance = Distance([0; ID_WORDS]);
    pub const MAX: Distance = Distance([u32::MAX; ID_WORDS]);

    /// Number of leading zero bits, in `[0, 160]`.
    pub fn leading_zeros(&self) -> usize {
        let mut total = 0;
        for word in self.0 {
            let zeros = word.leading_zeros() as usize;
            total += zeros;
            if zeros != 32 {
                break;
            }
        }
        total
    }
}

/// Opaque 4-byte destination tag. The simulated transport treats it as a
/// synthetic IPv4-like mailbox key; nothing requires it to be routable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address([u8; 4]);

impl Address {
    /// The reserved all-zero address: the transport's well-known server tag.
    pub const ZERO: Address = Address([0; 4]);

    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Address(rng.gen())
    }

    pub const fn from_octets(octets: [u8; 4]) -> Self {
        Address(octets)
    }

    pub const fn octets(&self) -> [u8; 4] {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

/// A peer binding: identifier plus mailbox address.
///
/// Equality and hashing consider the id only; an address change does not make
/// a different peer.
#[derive(Clone, Copy, Debug, Default)]
pub struct Contact {
    id: NodeId,
    address: Address,
}

impl Contact {
    pub const fn new(id: NodeId, address: Address) -> Self {
        Contact { id, address }
    }

    pub const fn id(&self) -> NodeId {
        self.id
    }

    pub const fn address(&self) -> Address {
        self.address
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.short(), self.address)
    }
}

/// Sorts contacts ascending by distance to `target`.
///
/// Equidistant contacts (equal ids, since the metric is injective in one
/// argument) order larger-id-first, so a following [`dedup_contacts`] pass
/// removes duplicates without disturbing distinct entries.
pub fn sort_by_distance(contacts: &mut [Contact], target: NodeId) {
    contacts.sort_by(|a, b| {
        a.id()
            .distance(target)
            .cmp(&b.id().distance(target))
            .then_with(|| b.id().cmp(&a.id()))
    });
}

/// Removes consecutive contacts with equal ids. Call after
/// [`sort_by_distance`] to drop all duplicates.
pub fn dedup_contacts(contacts: &mut Vec<Contact>) {
    contacts.dedup_by(|a, b| a.id() == b.id());
}

/// Merges two contact lists: concatenate, sort by distance to `target`,
/// remove duplicate ids.
pub fn merge_by_distance(a: &[Contact], b: &[Contact], target: NodeId) -> Vec<Contact> {
    let mut merged = Vec::with_capacity(a.len() + b.len());
    merged.extend_from_slice(a);
    merged.extend_from_slice(b);
    sort_by_distance(&mut merged, target);
    dedup_contacts(&mut merged);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(words: [u32; 5]) -> NodeId {
        NodeId::from_words(words)
    }

    fn contact(words: [u32; 5]) -> Contact {
        Contact::new(id(words), Address::random())
    }

    #[test]
    fn random_id_is_never_zero() {
        for _ in 0..64 {
            assert!(!NodeId::random().is_zero());
        }
    }

    #[test]
    fn distance_is_symmetric_with_zero_identity() {
        let a = NodeId::random();
        let b = NodeId::random();

        assert_eq!(a.distance(a), Distance::ZERO);
        assert_eq!(a.distance(b), b.distance(a));
    }

    #[test]
    fn distance_orders_like_the_unsigned_value() {
        let target = id([0, 0, 0, 0, 0]);
        let near = id([0, 0, 0, 0, 7]);
        let far = id([1, 0, 0, 0, 0]);

        assert!(near.distance(target) < far.distance(target));
        assert!(far.distance(target) > near.distance(target));
    }

    #[test]
    fn prefix_len_counts_leading_shared_bits() {
        let a = id([0xFFFF_0000, 0, 0, 0, 0]);
        let b = id([0xFFFF_8000, 0, 0, 0, 0]);

        assert_eq!(a.prefix_len(a), KEYSPACE);
        assert_eq!(a.prefix_len(b), 16);
        assert_eq!(id([0, 0, 0, 0, 0]).prefix_len(id([0, 0, 0, 0, 1])), 159);
    }

    #[test]
    fn sort_breaks_ties_larger_id_first() {
        let target = id([0, 0, 0, 0, 0]);
        let small = contact([0, 0, 0, 0, 2]);
        let large = contact([0, 0, 0, 0, 9]);
        let dup = Contact::new(large.id(), Address::random());

        let mut list = vec![small, large, dup];
        sort_by_distance(&mut list, target);

        assert_eq!(list[0].id(), small.id());
        assert_eq!(list[1].id(), large.id());
        assert_eq!(list[2].id(), large.id());
    }

    #[test]
    fn dedup_after_sort_is_idempotent() {
        // dedup(sort(L)) == dedup(sort(dedup(L)))
        let target = NodeId::random();
        let a = contact([1, 2, 3, 4, 5]);
        let b = contact([5, 4, 3, 2, 1]);
        let list = vec![a, b, a, b, a];

        let mut once = list.clone();
        sort_by_distance(&mut once, target);
        dedup_contacts(&mut once);

        let mut twice = list;
        twice.dedup_by(|x, y| x.id() == y.id());
        sort_by_distance(&mut twice, target);
        dedup_contacts(&mut twice);

        assert_eq!(once, twice);
        assert_eq!(once.len(), 2);
    }

    #[test]
    fn merge_sorts_and_removes_duplicates() {
        let target = id([0, 0, 0, 0, 0]);
        let near = contact([0, 0, 0, 0, 1]);
        let far = contact([0, 0, 0, 9, 0]);
        let near_dup = Contact::new(near.id(), Address::random());

        let merged = merge_by_distance(&[far, near], &[near_dup], target);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id(), near.id());
        assert_eq!(merged[1].id(), far.id());
    }

    #[test]
    fn contact_equality_ignores_address() {
        let id = NodeId::random();
        let a = Contact::new(id, Address::from_octets([1, 2, 3, 4]));
        let b = Contact::new(id, Address::from_octets([9, 9, 9, 9]));

        assert_eq!(a, b);
    }
}
