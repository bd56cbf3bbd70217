//! Kademlia routing table: one k-bucket per distance bit.

use std::collections::BTreeMap;
use std::slice::Iter;

use crate::common::{Contact, Id, ID_BITS};

/// K = the maximum size of a k-bucket, and the breadth of lookups.
pub const MAX_BUCKET_SIZE_K: usize = 20;

/// Outcome of offering a contact to a bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketInsert {
    /// The contact was already present; it moved to the tail with a fresh
    /// last-seen time.
    Updated,
    /// The bucket had room and the contact was appended at the tail.
    Added,
    /// The bucket is full and was not mutated. Carries the head, the least
    /// recently seen contact and the eviction candidate: the caller decides
    /// its fate by pinging it.
    Full(Contact),
}

/// A bounded list of up to K contacts ordered by last-seen time: the head is
/// the least recently seen, the tail the most recently seen.
#[derive(Debug, Clone, Default)]
pub struct KBucket {
    contacts: Vec<Contact>,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket {
            contacts: Vec::with_capacity(MAX_BUCKET_SIZE_K),
        }
    }

    // === Getters ===

    pub fn head(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    pub fn tail(&self) -> Option<&Contact> {
        self.contacts.last()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= MAX_BUCKET_SIZE_K
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.iter().any(|contact| contact.id() == id)
    }

    pub fn iter(&self) -> Iter<'_, Contact> {
        self.contacts.iter()
    }

    // === Public Methods ===

    /// Offers a contact to the bucket. A full bucket is never mutated here;
    /// [BucketInsert::Full] hands the head back so the caller can run the
    /// liveness check that decides between the head and the newcomer.
    pub fn insert(&mut self, incoming: Contact) -> BucketInsert {
        if let Some(index) = self
            .contacts
            .iter()
            .position(|contact| contact.id() == incoming.id())
        {
            // Move to the tail, refreshing last_seen and the address.
            self.contacts.remove(index);
            self.contacts.push(incoming);

            BucketInsert::Updated
        } else if self.contacts.len() < MAX_BUCKET_SIZE_K {
            self.contacts.push(incoming);

            BucketInsert::Added
        } else {
            BucketInsert::Full(self.contacts[0].clone())
        }
    }

    pub fn remove(&mut self, id: &Id) {
        self.contacts.retain(|contact| contact.id() != id);
    }
}

#[derive(Debug, Clone)]
/// All contacts this node knows, bucketed by the index of their distance bit
/// relative to this node's id. Empty buckets are simply absent from the map.
pub struct RoutingTable {
    id: Id,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            buckets: BTreeMap::new(),
        }
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the map of bucket indexes and their [KBucket].
    pub(crate) fn buckets(&self) -> &BTreeMap<u8, KBucket> {
        &self.buckets
    }

    /// Return the number of contacts in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.len())
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    pub fn contains(&self, id: &Id) -> bool {
        match self.id.bucket_index(id) {
            Some(index) => self
                .buckets
                .get(&index)
                .map(|bucket| bucket.contains(id))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Returns an iterator over all contacts, bucket by bucket.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.values().flat_map(|bucket| bucket.iter())
    }

    // === Public Methods ===

    /// Offers a contact to the bucket its distance selects. Returns None for
    /// this node's own id, which is never added.
    pub fn insert(&mut self, contact: Contact) -> Option<BucketInsert> {
        let index = self.id.bucket_index(contact.id())?;

        Some(self.buckets.entry(index).or_default().insert(contact))
    }

    /// Remove a contact from this routing table.
    pub fn remove(&mut self, id: &Id) {
        if let Some(index) = self.id.bucket_index(id) {
            if let Some(bucket) = self.buckets.get_mut(&index) {
                bucket.remove(id);
            }
        }
    }

    /// Return the up-to-n closest contacts to the target, sorted by
    /// nondecreasing XOR distance.
    ///
    /// Scans buckets starting at the target's bucket and walks outward in
    /// whole distance bands: the target's bucket first, then every bucket
    /// below it (which all share the next band), then each bucket above in
    /// turn. Partial results are grouped by band, so one exact sort and a
    /// truncation finish the job.
    pub fn closest(&self, target: &Id, n: usize) -> Vec<Contact> {
        let start = self.id.bucket_index(target).unwrap_or(0);

        let mut result: Vec<Contact> = Vec::with_capacity(n);

        let collect_band = |result: &mut Vec<Contact>, indexes: &mut dyn Iterator<Item = u8>| {
            if result.len() >= n {
                return;
            }
            for index in indexes {
                if let Some(bucket) = self.buckets.get(&index) {
                    result.extend(bucket.iter().cloned());
                }
            }
        };

        collect_band(&mut result, &mut std::iter::once(start));
        collect_band(&mut result, &mut (0..start).rev());
        for index in start + 1..ID_BITS as u8 {
            collect_band(&mut result, &mut std::iter::once(index));
        }

        result.sort_by_key(|contact| contact.id().xor(target));
        result.truncate(n);
        result
    }
}
