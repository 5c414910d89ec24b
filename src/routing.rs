//! # Routing Table (k-buckets)
//!
//! 160 buckets indexed by the shared-prefix length between the local id and
//! a contact's id. Bucket `i` holds up to K contacts whose distance to the
//! local node has exactly `i` leading zero bits; the self bucket (prefix 160)
//! can never be reached because the local id is rejected on insert.
//!
//! Bucket discipline is least-recently-seen eviction with a liveness probe:
//! the fresh end is the back of the bucket, the stale end the front. A full
//! bucket does not accept a newcomer directly — [`RoutingTable::add_contact`]
//! hands back an [`EvictionProbe`] and the caller pings the stale entry,
//! reporting the outcome through [`RoutingTable::apply_probe`]. A live stale
//! entry is refreshed and the newcomer dropped; a dead one is evicted and the
//! newcomer inserted fresh.

use crate::identity::{sort_by_distance, Contact, NodeId, KEYSPACE};

/// A full bucket waiting on a liveness probe of its stale entry.
#[derive(Clone, Debug)]
pub(crate) struct EvictionProbe {
    pub bucket: usize,
    pub stale: Contact,
    pub candidate: Contact,
}

enum TouchOutcome {
    Settled,
    Full { stale: Contact },
}

#[derive(Default)]
struct Bucket {
    // Stale end at the front, fresh end at the back.
    contacts: Vec<Contact>,
}

impl Bucket {
    fn touch(&mut self, contact: Contact, k: usize) -> TouchOutcome {
        if let Some(pos) = self.contacts.iter().position(|c| c.id() == contact.id()) {
            self.contacts.remove(pos);
            self.contacts.push(contact);
            return TouchOutcome::Settled;
        }
        if self.contacts.len() < k {
            self.contacts.push(contact);
            return TouchOutcome::Settled;
        }
        TouchOutcome::Full {
            stale: self.contacts[0],
        }
    }

    fn refresh(&mut self, id: NodeId) {
        if let Some(pos) = self.contacts.iter().position(|c| c.id() == id) {
            let existing = self.contacts.remove(pos);
            self.contacts.push(existing);
        }
    }

    fn remove(&mut self, id: NodeId) {
        self.contacts.retain(|c| c.id() != id);
    }
}

pub(crate) struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(KEYSPACE);
        buckets.resize_with(KEYSPACE, Bucket::default);
        Self {
            self_id,
            k,
            buckets,
        }
    }

    fn bucket_index(&self, id: NodeId) -> usize {
        // prefix_len == KEYSPACE only for the local id, which never inserts.
        self.self_id.prefix_len(id).min(KEYSPACE - 1)
    }

    /// Records that `contact` was seen. Self and the reserved zero id are
    /// ignored. Returns a probe when the target bucket is full; the contact
    /// is not inserted until [`RoutingTable::apply_probe`] reports the stale
    /// entry dead.
    pub fn add_contact(&mut self, contact: Contact) -> Option<EvictionProbe> {
        if contact.id() == self.self_id || contact.id().is_zero() {
            return None;
        }
        let bucket = self.bucket_index(contact.id());
        match self.buckets[bucket].touch(contact, self.k) {
            TouchOutcome::Settled => None,
            TouchOutcome::Full { stale } => Some(EvictionProbe {
                bucket,
                stale,
                candidate: contact,
            }),
        }
    }

    /// Applies the result of a stale-entry liveness probe.
    pub fn apply_probe(&mut self, probe: EvictionProbe, stale_alive: bool) {
        let bucket = &mut self.buckets[probe.bucket];
        if stale_alive {
            bucket.refresh(probe.stale.id());
            return;
        }
        bucket.remove(probe.stale.id());
        if bucket.contacts.iter().any(|c| c.id() == probe.candidate.id()) {
            return;
        }
        if bucket.contacts.len() < self.k {
            bucket.contacts.push(probe.candidate);
        }
    }

    /// The up-to-`x` known contacts closest to `target`, never including the
    /// local node.
    ///
    /// Collection starts at the target's own bucket and expands outward
    /// (`i-1, i+1, i-2, i+2, …`) until enough contacts are gathered or every
    /// bucket is visited; the gathered set is then distance-sorted and
    /// truncated.
    pub fn closest(&self, x: usize, target: NodeId) -> Vec<Contact> {
        if x == 0 {
            return Vec::new();
        }
        let start = self.bucket_index(target);
        let mut gathered = self.buckets[start].contacts.clone();
        let (mut lo, mut hi) = (start, start);
        while gathered.len() < x && (lo > 0 || hi < KEYSPACE - 1) {
            if lo > 0 {
                lo -= 1;
                gathered.extend_from_slice(&self.buckets[lo].contacts);
            }
            if gathered.len() >= x {
                break;
            }
            if hi < KEYSPACE - 1 {
                hi += 1;
                gathered.extend_from_slice(&self.buckets[hi].contacts);
            }
        }
        sort_by_distance(&mut gathered, target);
        gathered.truncate(x);
        gathered
    }

    pub fn lookup_contact(&self, id: NodeId) -> Option<Contact> {
        if id == self.self_id {
            return None;
        }
        self.buckets[self.bucket_index(id)]
            .contacts
            .iter()
            .find(|c| c.id() == id)
            .copied()
    }

    #[cfg(test)]
    fn contact_count(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }
}
