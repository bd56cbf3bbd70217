//! The working set of an iterative lookup: candidates sorted by distance to
//! the target, each tagged with its query state.

use crate::common::{Contact, Id};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    /// Known but not yet queried.
    Unqueried,
    /// A request is in flight.
    Pending,
    /// Replied before the timeout.
    Responded,
    /// Timed out or returned an error; kept only so peers re-announcing it
    /// don't get it queried again.
    Failed,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    contact: Contact,
    state: CandidateState,
    returned_value: bool,
}

#[derive(Debug)]
pub struct Shortlist {
    target: Id,
    candidates: Vec<Candidate>,
}

impl Shortlist {
    pub fn new(target: Id) -> Shortlist {
        Shortlist {
            target,
            candidates: Vec::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.candidates.iter().any(|c| c.contact.id() == id)
    }

    /// The distance of the closest non-failed candidate.
    pub fn best_distance(&self) -> Option<Id> {
        self.candidates
            .iter()
            .find(|c| c.state != CandidateState::Failed)
            .map(|c| c.contact.id().xor(&self.target))
    }

    pub fn has_unqueried(&self) -> bool {
        self.candidates
            .iter()
            .any(|c| c.state == CandidateState::Unqueried)
    }

    pub fn pending_count(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Pending)
            .count()
    }

    /// True when at least `k` non-failed candidates are known and every one
    /// of the `k` closest has responded; the lookup cannot do better.
    pub fn k_closest_all_responded(&self, k: usize) -> bool {
        let mut seen = 0;

        for candidate in &self.candidates {
            if candidate.state == CandidateState::Failed {
                continue;
            }
            if candidate.state != CandidateState::Responded {
                return false;
            }
            seen += 1;
            if seen == k {
                return true;
            }
        }

        false
    }

    /// The up-to-k closest candidates that responded, in distance order.
    pub fn closest_responded(&self, k: usize) -> Vec<Contact> {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .take(k)
            .map(|c| c.contact.clone())
            .collect()
    }

    /// The closest responded candidate that did not return a value; the
    /// caching target after a successful value lookup.
    pub fn closest_responded_without_value(&self) -> Option<&Contact> {
        self.candidates
            .iter()
            .find(|c| c.state == CandidateState::Responded && !c.returned_value)
            .map(|c| &c.contact)
    }

    // === Public Methods ===

    /// Adds a candidate in distance order. Duplicates (by id) are ignored,
    /// including previously failed candidates. Returns true when inserted.
    pub fn insert(&mut self, contact: Contact) -> bool {
        if self.contains(contact.id()) {
            return false;
        }

        let seek = contact.id().xor(&self.target);
        let position = self
            .candidates
            .partition_point(|c| c.contact.id().xor(&self.target) < seek);

        self.candidates.insert(
            position,
            Candidate {
                contact,
                state: CandidateState::Unqueried,
                returned_value: false,
            },
        );

        true
    }

    /// Marks up to `n` of the closest unqueried candidates as pending and
    /// returns their contacts for querying.
    pub fn take_unqueried(&mut self, n: usize) -> Vec<Contact> {
        self.candidates
            .iter_mut()
            .filter(|c| c.state == CandidateState::Unqueried)
            .take(n)
            .map(|c| {
                c.state = CandidateState::Pending;
                c.contact.clone()
            })
            .collect()
    }

    pub fn mark_responded(&mut self, id: &Id) {
        self.mark(id, CandidateState::Responded);
    }

    pub fn mark_failed(&mut self, id: &Id) {
        self.mark(id, CandidateState::Failed);
    }

    /// Remembers that this candidate's response carried the value.
    pub fn mark_returned_value(&mut self, id: &Id) {
        if let Some(candidate) = self
            .candidates
            .iter_mut()
            .find(|c| c.contact.id() == id)
        {
            candidate.returned_value = true;
        }
    }

    /// Fails every pending candidate, used when the lookup deadline passes.
    pub fn fail_pending(&mut self) {
        for candidate in &mut self.candidates {
            if candidate.state == CandidateState::Pending {
                candidate.state = CandidateState::Failed;
            }
        }
    }

    /// Bounds the shortlist to its `k` closest non-failed candidates.
    /// Failed entries stay so they are never queried twice.
    pub fn truncate(&mut self, k: usize) {
        let mut kept = 0;
        self.candidates.retain(|candidate| {
            if candidate.state == CandidateState::Failed {
                true
            } else {
                kept += 1;
                kept <= k
            }
        });
    }

    // === Private Methods ===

    fn mark(&mut self, id: &Id, state: CandidateState) {
        if let Some(candidate) = self
            .candidates
            .iter_mut()
            .find(|c| c.contact.id() == id)
        {
            candidate.state = state;
        }
    }
}
