//! # Routing Table (XOR metric)
//!
//! Kademlia routing table keyed by XOR distance from our own public key.
//!
//! - Bucket index = number of leading zero bits in `self_key XOR other`
//! - Each bucket holds up to `capacity` identities, ordered least- to
//!   most-recently updated
//! - A full bucket keeps its existing entries and rejects the newcomer
//!
//! Anonymous nodes have no key of their own (`self_key = None`); their
//! entries are bucketed against the all-zero key.
//!
//! Only the node mutates the table: on handshake completion, on disconnect,
//! and with the results of FindNode lookups.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::identity::{distance_cmp, Distance, Identity, PublicKey, PUBLIC_KEY_LEN};

/// Default bucket size, also the number of identities returned per lookup.
pub const DEFAULT_K: usize = 16;

const BUCKET_COUNT: usize = PUBLIC_KEY_LEN * 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Inserted,
    Refreshed,
    /// The identity's bucket is at capacity; the table is unchanged.
    BucketFull,
    /// The identity is our own key.
    Ignored,
}

#[derive(Debug, Clone)]
struct Entry {
    identity: Identity,
    /// Logical clock value of the last `update`.
    seen: u64,
}

#[derive(Debug, Clone, Default)]
struct RoutingBucket {
    entries: Vec<Entry>,
}

impl RoutingBucket {
    fn touch(&mut self, identity: Identity, seen: u64, capacity: usize) -> UpdateOutcome {
        if let Some(pos) = self.entries.iter().position(|e| e.identity.key() == identity.key()) {
            self.entries.remove(pos);
            self.entries.push(Entry { identity, seen });
            return UpdateOutcome::Refreshed;
        }
        if self.entries.len() < capacity {
            self.entries.push(Entry { identity, seen });
            UpdateOutcome::Inserted
        } else {
            UpdateOutcome::BucketFull
        }
    }

    fn remove(&mut self, key: &PublicKey) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.identity.key() == key) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }
}

fn bucket_index(reference: &PublicKey, other: &PublicKey) -> usize {
    let dist = reference.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    BUCKET_COUNT - 1
}

#[derive(Debug)]
pub struct RoutingTable {
    self_key: Option<PublicKey>,
    capacity: usize,
    buckets: Vec<RoutingBucket>,
    clock: u64,
}

impl RoutingTable {
    pub fn new(self_key: Option<PublicKey>, capacity: usize) -> Self {
        Self {
            self_key,
            capacity: capacity.max(1),
            buckets: vec![RoutingBucket::default(); BUCKET_COUNT],
            clock: 0,
        }
    }

    pub fn self_key(&self) -> Option<&PublicKey> {
        self.self_key.as_ref()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn reference(&self) -> PublicKey {
        self.self_key.unwrap_or(PublicKey::from_bytes([0u8; PUBLIC_KEY_LEN]))
    }

    /// Insert `identity`, or refresh its recency (and address) if already present.
    pub fn update(&mut self, identity: Identity) -> UpdateOutcome {
        if self.self_key.as_ref() == Some(identity.key()) {
            return UpdateOutcome::Ignored;
        }
        self.clock += 1;
        let idx = bucket_index(&self.reference(), identity.key());
        self.buckets[idx].touch(identity, self.clock, self.capacity)
    }

    pub fn delete(&mut self, key: &PublicKey) -> bool {
        let idx = bucket_index(&self.reference(), key);
        self.buckets[idx].remove(key)
    }

    pub fn get(&self, key: &PublicKey) -> Option<&Identity> {
        let idx = bucket_index(&self.reference(), key);
        self.buckets[idx]
            .entries
            .iter()
            .find(|e| e.identity.key() == key)
            .map(|e| &e.identity)
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }

    /// Every identity in the table, closest buckets last.
    pub fn identities(&self) -> Vec<Identity> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.identity.clone()))
            .collect()
    }

    /// Up to `k` identities sorted by ascending distance to `target`,
    /// ties broken by most recent update.
    pub fn closest_to(&self, target: &PublicKey, k: usize) -> Vec<Identity> {
        if k == 0 {
            return Vec::new();
        }

        struct Candidate<'a> {
            dist: Distance,
            seen: u64,
            entry: &'a Entry,
        }

        impl PartialEq for Candidate<'_> {
            fn eq(&self, other: &Self) -> bool {
                self.cmp(other) == Ordering::Equal
            }
        }

        impl Eq for Candidate<'_> {}

        // Greater = worse: farther, or equally far and less recent.
        impl Ord for Candidate<'_> {
            fn cmp(&self, other: &Self) -> Ordering {
                distance_cmp(&self.dist, &other.dist).then_with(|| other.seen.cmp(&self.seen))
            }
        }

        impl PartialOrd for Candidate<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<Candidate<'_>> = BinaryHeap::with_capacity(k + 1);
        for bucket in &self.buckets {
            for entry in &bucket.entries {
                let candidate = Candidate {
                    dist: entry.identity.key().xor_distance(target),
                    seen: entry.seen,
                    entry,
                };
                if heap.len() < k {
                    heap.push(candidate);
                } else if let Some(worst) = heap.peek()
                    && candidate < *worst
                {
                    heap.push(candidate);
                    heap.pop();
                }
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|c| c.entry.identity.clone())
            .collect()
    }
}
