//! Manage iterative lookups and store fan-outs, and their corresponding
//! request/response state machines.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, trace};

use crate::common::messages::{ErrorSpecific, RequestSpecific, RequestTypeSpecific, ResponseSpecific};
use crate::common::{Contact, Id, MAX_BUCKET_SIZE_K};
use crate::rpc::shortlist::Shortlist;
use crate::rpc::socket::RpcSocket;
use crate::{Error, Result};

/// ALPHA: how many requests a lookup keeps in flight at once.
pub const ALPHA: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    /// FIND_NODE traversal: converge on the k closest contacts.
    Nodes,
    /// FIND_VALUE traversal: stop at the first value, fall back to Nodes
    /// behavior on a miss.
    Value,
}

#[derive(Debug, Clone)]
pub enum LookupResult {
    /// The k closest responding contacts to the target.
    Nodes(Vec<Contact>),
    /// A value returned by some contact (value lookups only).
    Value(Value),
    /// No contact returned the value; carries the k closest responding
    /// contacts so callers can still store to them.
    NotFound(Vec<Contact>),
}

/// An iterative process of querying the closest known contacts to a target
/// in rounds of up to [ALPHA] parallel requests, merging the contacts each
/// response returns, until no round gets closer and the closest k known
/// contacts have all responded, or candidates run out.
#[derive(Debug)]
pub struct IterativeQuery {
    kind: LookupKind,
    self_contact: Contact,
    shortlist: Shortlist,
    /// Transaction id -> the candidate it was sent to.
    inflight_requests: HashMap<u16, Id>,
    /// Best distance when the current round started; no improvement over a
    /// full round is half of the termination rule.
    round_start_best: Option<Id>,
    started_at: Instant,
    deadline: Duration,
    senders: Vec<flume::Sender<LookupResult>>,
    result: Option<LookupResult>,
}

impl IterativeQuery {
    pub fn new(
        target: Id,
        kind: LookupKind,
        self_contact: Contact,
        deadline: Duration,
    ) -> IterativeQuery {
        trace!(?target, ?kind, "New query");

        IterativeQuery {
            kind,
            self_contact,
            shortlist: Shortlist::new(target),
            inflight_requests: HashMap::new(),
            round_start_best: None,
            started_at: Instant::now(),
            deadline,
            senders: Vec::new(),
            result: None,
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.shortlist.target()
    }

    pub fn is_done(&self) -> bool {
        self.result.is_some()
    }

    /// The closest responding contacts, available once the query is done.
    pub fn closest_responded(&self) -> Vec<Contact> {
        self.shortlist.closest_responded(MAX_BUCKET_SIZE_K)
    }

    // === Public Methods ===

    /// A value lookup answers every need a nodes lookup does, so an active
    /// nodes query can be upgraded in place when a caller wants the value.
    pub fn upgrade_to_value(&mut self) {
        self.kind = LookupKind::Value;
    }

    /// Registers a caller for the result. Queries can be shared: a second
    /// caller asking for an in-flight target just subscribes to it. If the
    /// query is already done the result is delivered immediately.
    pub fn add_sender(&mut self, sender: Option<flume::Sender<LookupResult>>) {
        if let Some(sender) = sender {
            if let Some(result) = &self.result {
                let _ = sender.send(result.clone());
            } else {
                self.senders.push(sender);
            }
        }
    }

    /// Adds a candidate contact, keeping the shortlist deduplicated and
    /// skipping this node itself.
    pub fn add_candidate(&mut self, contact: Contact) {
        if contact.id() == self.self_contact.id() {
            return;
        }

        self.shortlist.insert(contact);
    }

    /// Launches the first round.
    pub fn start(&mut self, socket: &mut RpcSocket) {
        self.begin_round(socket);
    }

    /// Claims a transaction id if this query issued it, returning the
    /// candidate it was addressed to.
    pub fn remove_inflight(&mut self, transaction_id: u16) -> Option<Id> {
        self.inflight_requests.remove(&transaction_id)
    }

    /// Feeds a response from a candidate into the query.
    pub fn handle_response(
        &mut self,
        candidate: Id,
        response: &ResponseSpecific,
        socket: &mut RpcSocket,
    ) {
        if self.is_done() {
            return;
        }

        self.shortlist.mark_responded(&candidate);

        if let Some(nodes) = &response.nodes {
            for contact in nodes {
                self.add_candidate(contact.clone());
            }
        }

        if self.kind == LookupKind::Value {
            if let Some(value) = &response.value {
                self.shortlist.mark_returned_value(&candidate);
                self.finish_with_value(value.clone(), socket);
            }
        }
    }

    /// Marks a candidate failed after a timeout or an error response.
    pub fn handle_failure(&mut self, candidate: Id) {
        self.shortlist.mark_failed(&candidate);
    }

    /// Advances the query: enforces the deadline, and when the current round
    /// has fully settled decides between terminating and launching the next
    /// round. Returns true when the query is done.
    pub fn tick(&mut self, socket: &mut RpcSocket) -> bool {
        if self.is_done() {
            return true;
        }

        if self.started_at.elapsed() > self.deadline {
            debug!(target = ?self.target(), "Query deadline exceeded");
            self.shortlist.fail_pending();
            self.inflight_requests.clear();
            self.finalize();
            return true;
        }

        if self.inflight_requests.is_empty() {
            self.end_round(socket);
        }

        self.is_done()
    }

    // === Private Methods ===

    fn begin_round(&mut self, socket: &mut RpcSocket) {
        debug_assert!(self.shortlist.pending_count() == 0);

        self.round_start_best = self.shortlist.best_distance();

        let target = self.target();
        for contact in self.shortlist.take_unqueried(ALPHA) {
            let request = match self.kind {
                LookupKind::Nodes => RequestTypeSpecific::FindNode { target },
                LookupKind::Value => RequestTypeSpecific::FindValue { target },
            };

            let tid = socket.request(
                contact.address(),
                RequestSpecific {
                    sender: self.self_contact.clone(),
                    request,
                },
            );

            self.inflight_requests.insert(tid, *contact.id());
        }
    }

    fn end_round(&mut self, socket: &mut RpcSocket) {
        self.shortlist.truncate(MAX_BUCKET_SIZE_K);

        let improved = match (&self.round_start_best, self.shortlist.best_distance()) {
            (Some(before), Some(after)) => after < *before,
            (None, Some(_)) => true,
            _ => false,
        };

        // No round may get closer, but the query only rests once the k
        // closest known contacts have all answered.
        if !improved && self.shortlist.k_closest_all_responded(MAX_BUCKET_SIZE_K) {
            self.finalize();
            return;
        }

        if self.shortlist.has_unqueried() {
            self.begin_round(socket);
        }

        if self.inflight_requests.is_empty() {
            // Out of candidates to query.
            self.finalize();
        }
    }

    fn finish_with_value(&mut self, value: Value, socket: &mut RpcSocket) {
        // Cache at the closest miss: the nearest responding contact that did
        // not hold the value gets a copy, shortening the next lookup.
        if let Some(contact) = self.shortlist.closest_responded_without_value() {
            debug!(target = ?self.target(), to = ?contact.id(), "Caching value at closest miss");

            socket.request(
                contact.address(),
                RequestSpecific {
                    sender: self.self_contact.clone(),
                    request: RequestTypeSpecific::Store {
                        key: self.target(),
                        value: value.clone(),
                    },
                },
            );
        }

        self.settle(LookupResult::Value(value));
    }

    fn finalize(&mut self) {
        let closest = self.closest_responded();

        let result = match self.kind {
            LookupKind::Nodes => LookupResult::Nodes(closest),
            LookupKind::Value => LookupResult::NotFound(closest),
        };

        self.settle(result);
    }

    fn settle(&mut self, result: LookupResult) {
        debug!(
            target = ?self.target(),
            candidates = self.shortlist.len(),
            "Query done"
        );

        for sender in self.senders.drain(..) {
            let _ = sender.send(result.clone());
        }

        self.result = Some(result);
    }
}

/// Once an [IterativeQuery] converges, a StoreQuery fans a STORE out to the
/// closest contacts it found and tracks acknowledging nodes and errors.
#[derive(Debug)]
pub struct StoreQuery {
    target: Id,
    value: Value,
    self_contact: Contact,
    /// Nodes that confirmed success.
    stored_at: usize,
    /// Error responses, ordered by how often each code was seen.
    errors: Vec<(usize, ErrorSpecific)>,
    inflight_requests: Vec<u16>,
    started: bool,
    done: bool,
    sender: Option<flume::Sender<Result<usize>>>,
}

impl StoreQuery {
    pub fn new(
        target: Id,
        value: Value,
        self_contact: Contact,
        sender: Option<flume::Sender<Result<usize>>>,
    ) -> StoreQuery {
        StoreQuery {
            target,
            value,
            self_contact,
            stored_at: 0,
            errors: Vec::new(),
            inflight_requests: Vec::new(),
            started: false,
            done: false,
            sender,
        }
    }

    // === Getters ===

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    // === Public Methods ===

    /// Sends STORE to each of the closest contacts in parallel.
    pub fn start(&mut self, socket: &mut RpcSocket, closest: &[Contact]) {
        self.started = true;

        let target = self.target;
        trace!(?target, nodes = closest.len(), "StoreQuery start");

        if closest.is_empty() {
            self.settle(Err(Error::NoClosestNodes));
            return;
        }

        for contact in closest.iter().take(MAX_BUCKET_SIZE_K) {
            let tid = socket.request(
                contact.address(),
                RequestSpecific {
                    sender: self.self_contact.clone(),
                    request: RequestTypeSpecific::Store {
                        key: self.target,
                        value: self.value.clone(),
                    },
                },
            );

            self.inflight_requests.push(tid);
        }
    }

    /// Claims a transaction id if this store issued it.
    pub fn remove_inflight(&mut self, transaction_id: u16) -> bool {
        if let Some(position) = self
            .inflight_requests
            .iter()
            .position(|tid| *tid == transaction_id)
        {
            self.inflight_requests.swap_remove(position);
            return true;
        }
        false
    }

    pub fn success(&mut self) {
        debug!(target = ?self.target, "StoreQuery got success response");
        self.stored_at += 1;
    }

    pub fn error(&mut self, error: ErrorSpecific) {
        debug!(target = ?self.target, ?error, "StoreQuery got error");

        if let Some(position) = self
            .errors
            .iter()
            .position(|(_, existing)| existing.code == error.code)
        {
            // Bump the count and bubble it up to keep the most common first.
            self.errors[position].0 += 1;

            let mut i = position;
            while i > 0 && self.errors[i].0 > self.errors[i - 1].0 {
                self.errors.swap(i, i - 1);
                i -= 1;
            }
        } else {
            self.errors.push((1, error));
        }
    }

    /// Settles once every request was answered or timed out. Success does
    /// not require unanimity: one acknowledgment is enough; with none, the
    /// most common error (or a bare timeout) is the aggregate.
    pub fn tick(&mut self) -> bool {
        if self.done {
            return true;
        }

        if self.started && self.inflight_requests.is_empty() {
            if self.stored_at > 0 {
                let target = self.target;
                debug!(?target, stored_at = self.stored_at, "StoreQuery done");

                let stored_at = self.stored_at;
                self.settle(Ok(stored_at));
            } else if let Some((_, error)) = self.errors.first() {
                self.settle(Err(Error::StoreRejected(error.message.clone())));
            } else {
                self.settle(Err(Error::StoreTimeout));
            }
        }

        self.done
    }

    // === Private Methods ===

    fn settle(&mut self, result: Result<usize>) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(result);
        }
        self.done = true;
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddrV4;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::common::messages::MessageBody;
    use crate::rpc::socket::testing::channel_transport;

    fn socket() -> (RpcSocket, crate::rpc::socket::testing::TestWire) {
        let (transport, wire) = channel_transport(4000);
        (
            RpcSocket::new(Box::new(transport), Duration::from_secs(2)),
            wire,
        )
    }

    fn contact(port: u16) -> Contact {
        Contact::new(
            Id::random(),
            SocketAddrV4::new([127, 0, 0, 1].into(), port),
        )
    }

    #[test]
    fn rounds_are_capped_at_alpha() {
        let (mut socket, wire) = socket();
        let me = contact(4000);

        let mut query =
            IterativeQuery::new(Id::random(), LookupKind::Nodes, me, Duration::from_secs(30));

        for port in 5000..5010 {
            query.add_candidate(contact(port));
        }

        query.start(&mut socket);

        let mut sent = 0;
        while wire.recv_message().is_some() {
            sent += 1;
        }
        assert_eq!(sent, ALPHA);

        // Nothing new goes out while the round is pending.
        assert!(!query.tick(&mut socket));
        assert!(wire.recv_message().is_none());
    }

    #[test]
    fn exhausting_candidates_finishes_the_query() {
        let (mut socket, wire) = socket();
        let me = contact(4000);
        let peer = contact(5000);

        let (tx, rx) = flume::unbounded();

        let mut query = IterativeQuery::new(
            Id::random(),
            LookupKind::Nodes,
            me,
            Duration::from_secs(30),
        );
        query.add_sender(Some(tx));
        query.add_candidate(peer.clone());
        query.start(&mut socket);

        let (message, _) = wire.recv_message().unwrap();
        assert!(matches!(
            message.body,
            MessageBody::Request(RequestSpecific {
                request: RequestTypeSpecific::FindNode { .. },
                ..
            })
        ));

        let tid = message.transaction_id;
        assert_eq!(query.remove_inflight(tid), Some(*peer.id()));

        // An empty nodes reply: no improvement, nothing left to ask.
        query.handle_response(
            *peer.id(),
            &ResponseSpecific {
                sender: peer.clone(),
                nodes: Some(vec![]),
                value: None,
            },
            &mut socket,
        );

        assert!(query.tick(&mut socket));

        match rx.try_recv().unwrap() {
            LookupResult::Nodes(nodes) => assert_eq!(nodes, vec![peer]),
            other => panic!("expected Nodes, got {other:?}"),
        }
    }

    #[test]
    fn value_terminates_immediately_and_caches_at_closest_miss() {
        let (mut socket, wire) = socket();
        let me = contact(4000);
        let target = Id::random();

        // Make `near` closer to the target than `far`, deterministically.
        let mut near = contact(5001);
        let mut far = contact(5002);
        if near.id().xor(&target) > far.id().xor(&target) {
            std::mem::swap(&mut near, &mut far);
        }

        let (tx, rx) = flume::unbounded();

        let mut query =
            IterativeQuery::new(target, LookupKind::Value, me, Duration::from_secs(30));
        query.add_sender(Some(tx));
        query.add_candidate(near.clone());
        query.add_candidate(far.clone());
        query.start(&mut socket);

        let (first, _) = wire.recv_message().unwrap();
        let (second, _) = wire.recv_message().unwrap();

        // The near contact misses, the far one has the value.
        query.remove_inflight(first.transaction_id);
        query.handle_response(
            *near.id(),
            &ResponseSpecific {
                sender: near.clone(),
                nodes: Some(vec![]),
                value: None,
            },
            &mut socket,
        );

        query.remove_inflight(second.transaction_id);
        query.handle_response(
            *far.id(),
            &ResponseSpecific {
                sender: far.clone(),
                nodes: None,
                value: Some(json!("boop")),
            },
            &mut socket,
        );

        assert!(query.is_done());
        assert!(matches!(rx.try_recv().unwrap(), LookupResult::Value(v) if v == json!("boop")));

        // The caching STORE went to the closest miss.
        let (cache, to) = wire.recv_message().unwrap();
        assert_eq!(to, near.address());
        match cache.body {
            MessageBody::Request(RequestSpecific {
                request: RequestTypeSpecific::Store { key, value },
                ..
            }) => {
                assert_eq!(key, target);
                assert_eq!(value, json!("boop"));
            }
            other => panic!("expected STORE, got {other:?}"),
        }
    }

    #[test]
    fn deadline_fails_pending_and_finishes() {
        let (mut socket, _wire) = socket();
        let me = contact(4000);

        let mut query =
            IterativeQuery::new(Id::random(), LookupKind::Value, me, Duration::ZERO);
        query.add_candidate(contact(5000));
        query.start(&mut socket);

        std::thread::sleep(Duration::from_millis(1));

        assert!(query.tick(&mut socket));
        assert!(matches!(
            query.result,
            Some(LookupResult::NotFound(ref nodes)) if nodes.is_empty()
        ));
    }

    #[test]
    fn store_query_aggregates() {
        let (mut socket, wire) = socket();
        let me = contact(4000);

        // One ack is success even when others stay silent.
        let (tx, rx) = flume::unbounded();
        let mut store = StoreQuery::new(Id::random(), json!("v"), me.clone(), Some(tx));
        store.start(&mut socket, &[contact(5000), contact(5001)]);

        let (first, _) = wire.recv_message().unwrap();
        assert!(store.remove_inflight(first.transaction_id));
        store.success();

        assert!(!store.tick());

        let (second, _) = wire.recv_message().unwrap();
        assert!(store.remove_inflight(second.transaction_id));

        assert!(store.tick());
        assert_eq!(rx.try_recv().unwrap().unwrap(), 1);

        // No closest nodes at all fails immediately.
        let (tx, rx) = flume::unbounded();
        let mut store = StoreQuery::new(Id::random(), json!("v"), me, Some(tx));
        store.start(&mut socket, &[]);

        assert!(store.is_done());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(Error::NoClosestNodes)
        ));
    }
}
