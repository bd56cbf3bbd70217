//! The protocol engine: one tick loop owning the routing table, the socket,
//! the storage handle, and every in-flight query.

pub mod config;
pub(crate) mod query;
pub mod server;
pub(crate) mod shortlist;
pub mod socket;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::common::messages::{
    ErrorSpecific, Message, MessageBody, RequestSpecific, RequestTypeSpecific, ResponseSpecific,
};
use crate::common::{
    now_millis, BucketInsert, Contact, Id, Record, RoutingTable, MAX_BUCKET_SIZE_K,
};
use crate::storage::Storage;
use crate::{Error, Result};

use config::Config;
use query::{IterativeQuery, LookupKind, LookupResult, StoreQuery};
use server::{HandlerReply, Validate};
use socket::{RpcSocket, Transport, UdpTransport};

/// The protocol engine, driven by calling [Rpc::tick] in a loop.
///
/// Wraps a [Transport] in request/response correlation, dispatches inbound
/// requests to handlers, advances iterative lookups, runs the liveness-aware
/// bucket eviction protocol, and fires the periodic maintenance passes.
#[derive(Debug)]
pub struct Rpc {
    id: Id,
    address: SocketAddrV4,

    socket: RpcSocket,

    routing_table: RoutingTable,
    /// Transaction ids of PINGs probing full-bucket heads, mapped to the
    /// head under probe and the newcomer waiting on the outcome.
    pending_evictions: HashMap<u16, EvictionCheck>,

    queries: HashMap<Id, IterativeQuery>,
    /// Store queries wait for the lookup on the same target to converge,
    /// then fan out to the closest contacts it found.
    store_queries: HashMap<Id, StoreQuery>,

    join: Option<JoinState>,

    storage: Box<dyn Storage>,
    validator: Option<Box<dyn Validate>>,

    lookup_timeout: Duration,
    replicate_interval: Duration,
    republish_after: Duration,
    expire_after: Duration,
    last_replicate: Instant,
    last_expire: Instant,
}

#[derive(Debug)]
struct EvictionCheck {
    head: Id,
    candidate: Contact,
}

#[derive(Debug)]
struct JoinState {
    stage: JoinStage,
    sender: flume::Sender<Result<()>>,
}

#[derive(Debug)]
enum JoinStage {
    /// Looking up our own id to populate the nearest buckets.
    SelfLookup,
    /// Refreshing buckets farther than the closest neighbor; holds the
    /// refresh lookup targets still running.
    Refreshing(HashSet<Id>),
}

impl Rpc {
    /// Create a new Rpc over the default UDP transport.
    pub fn new(
        config: Config,
        storage: Box<dyn Storage>,
        validator: Option<Box<dyn Validate>>,
    ) -> Result<Rpc> {
        let transport = UdpTransport::bind(config.port)?;

        Ok(Rpc::with_transport(
            config,
            Box::new(transport),
            storage,
            validator,
        ))
    }

    /// Create a new Rpc over any [Transport].
    pub fn with_transport(
        config: Config,
        transport: Box<dyn Transport>,
        storage: Box<dyn Storage>,
        validator: Option<Box<dyn Validate>>,
    ) -> Rpc {
        let socket = RpcSocket::new(transport, config.request_timeout);

        let local = socket.local_addr();
        let address = SocketAddrV4::new(config.address.unwrap_or(*local.ip()), local.port());

        // Without an explicit id, derive one from the advertised endpoint.
        let id = config
            .node_id
            .unwrap_or_else(|| Id::from_seed(address.to_string()));

        Rpc {
            id,
            address,
            socket,
            routing_table: RoutingTable::new(id),
            pending_evictions: HashMap::new(),
            queries: HashMap::new(),
            store_queries: HashMap::new(),
            join: None,
            storage,
            validator,
            lookup_timeout: config.lookup_timeout,
            replicate_interval: config.replicate_interval,
            republish_after: config.republish_after,
            expire_after: config.expire_after,
            last_replicate: Instant::now(),
            last_expire: Instant::now(),
        }
    }

    // === Getters ===

    /// Returns the node's Id.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns the address the node is listening on.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    /// This node as a contact, the way it introduces itself in messages.
    pub fn self_contact(&self) -> Contact {
        Contact::new(self.id, self.address)
    }

    /// Returns the routing table size.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table.size()
    }

    // === Public Methods ===

    /// Advance the whole engine one step: release timed-out requests,
    /// receive one inbound message, advance queries, and run whatever
    /// maintenance is due.
    pub fn tick(&mut self) {
        for transaction_id in self.socket.take_expired() {
            self.handle_timeout(transaction_id);
        }

        if let Some((message, from)) = self.socket.recv_from() {
            self.handle_message(message, from);
        }

        let mut finished_stores = Vec::new();
        for (target, store_query) in self.store_queries.iter_mut() {
            if store_query.tick() {
                finished_stores.push(*target);
            }
        }
        for target in finished_stores {
            self.store_queries.remove(&target);
        }

        let mut finished = Vec::new();
        for (target, query) in self.queries.iter_mut() {
            if query.tick(&mut self.socket) {
                finished.push(*target);
            }
        }
        for target in finished {
            if let Some(query) = self.queries.remove(&target) {
                self.on_query_done(target, &query);
            }
        }

        self.run_maintenance();
    }

    /// Store a value under a key: validate locally, converge a nodes lookup
    /// on the key, then STORE to the k closest contacts found. The sender
    /// receives the aggregate: how many nodes acknowledged, or the failure.
    pub fn put(&mut self, key: Id, value: Value, sender: Option<flume::Sender<Result<usize>>>) {
        if let Some(validator) = &self.validator {
            if !validator.validate(&key, &value) {
                debug!(?key, "Local validator rejected value");
                if let Some(sender) = sender {
                    let _ = sender.send(Err(Error::InvalidValue));
                }
                return;
            }
        }

        let store_query = StoreQuery::new(key, value, self.self_contact(), sender);
        self.store_queries.insert(key, store_query);

        self.start_query(key, LookupKind::Nodes, None);
    }

    /// Retrieve the value under a key: local storage first, then a value
    /// lookup across the network.
    pub fn get(&mut self, key: Id, sender: Option<flume::Sender<LookupResult>>) {
        match self.storage.get(&key) {
            Ok(Some(bytes)) => match Record::from_bytes(&bytes) {
                Ok(record) => {
                    trace!(?key, "Get answered from local storage");
                    if let Some(sender) = sender {
                        let _ = sender.send(LookupResult::Value(record.value));
                    }
                    return;
                }
                Err(e) => warn!(?key, ?e, "Stored record is undecodable, looking up"),
            },
            Ok(None) => {}
            Err(e) => warn!(?key, ?e, "Storage read failed, looking up"),
        }

        self.start_query(key, LookupKind::Value, sender);
    }

    /// Join the network through a seed contact: insert it, look up our own
    /// id, then refresh every non-empty bucket farther than the closest
    /// neighbor. The sender resolves when the refreshes are done.
    pub fn join(&mut self, seed: Contact, sender: flume::Sender<Result<()>>) {
        debug!(seed = ?seed.id(), "Joining the network");

        self.update_contact(seed);
        self.join = Some(JoinState {
            stage: JoinStage::SelfLookup,
            sender,
        });

        let self_id = self.id;
        self.start_query(self_id, LookupKind::Nodes, None);
    }

    // === Private Methods ===

    /// The single entry point for observed peers; every well-formed message
    /// passes through here before anything else happens.
    ///
    /// Implements the liveness rule for full buckets: the head gets a PING,
    /// and only if it fails to answer does the newcomer take its place.
    fn update_contact(&mut self, contact: Contact) {
        if contact.id() == &self.id {
            return;
        }

        if let Some(BucketInsert::Full(head)) = self.routing_table.insert(contact.clone()) {
            if self
                .pending_evictions
                .values()
                .any(|check| check.head == *head.id())
            {
                // The head is already under probe; this newcomer loses.
                return;
            }

            trace!(head = ?head.id(), candidate = ?contact.id(), "Bucket full, pinging head");

            let transaction_id = self.socket.request(
                head.address(),
                RequestSpecific {
                    sender: self.self_contact(),
                    request: RequestTypeSpecific::Ping,
                },
            );

            self.pending_evictions.insert(
                transaction_id,
                EvictionCheck {
                    head: *head.id(),
                    candidate: contact,
                },
            );
        }
    }

    fn handle_message(&mut self, message: Message, from: SocketAddrV4) {
        let transaction_id = message.transaction_id;

        match message.body {
            MessageBody::Request(request) => {
                // The routing table learns about the requester first, from
                // its claimed id at its observed address.
                let sender = Contact::new(*request.sender.id(), from);
                self.update_contact(sender.clone());

                let self_contact = self.self_contact();
                let reply = server::handle_request(
                    &self_contact,
                    &self.routing_table,
                    &mut self.storage,
                    self.validator.as_deref(),
                    &sender,
                    &request.request,
                );

                match reply {
                    HandlerReply::Response(response) => {
                        self.socket.response(from, transaction_id, response)
                    }
                    HandlerReply::Error(error) => self.socket.error(from, transaction_id, error),
                }
            }
            MessageBody::Response(response) => {
                self.update_contact(Contact::new(*response.sender.id(), from));
                self.correlate_response(transaction_id, &response);
            }
            MessageBody::Error(error) => {
                self.correlate_error(transaction_id, from, error);
            }
        }
    }

    fn correlate_response(&mut self, transaction_id: u16, response: &ResponseSpecific) {
        if self.pending_evictions.remove(&transaction_id).is_some() {
            // The head answered; update_contact already moved it to the
            // tail, and the newcomer is discarded.
            debug!(head = ?response.sender.id(), "Bucket head answered, keeping it");
            return;
        }

        for query in self.queries.values_mut() {
            if let Some(candidate) = query.remove_inflight(transaction_id) {
                query.handle_response(candidate, response, &mut self.socket);
                return;
            }
        }

        for store_query in self.store_queries.values_mut() {
            if store_query.remove_inflight(transaction_id) {
                store_query.success();
                return;
            }
        }

        trace!(
            ?transaction_id,
            "Response does not correlate to an active query"
        );
    }

    fn correlate_error(&mut self, transaction_id: u16, from: SocketAddrV4, error: ErrorSpecific) {
        debug!(?error, "RPC error response");

        if let Some(check) = self.pending_evictions.remove(&transaction_id) {
            // Any reply proves the head is alive.
            self.update_contact(Contact::new(check.head, from));
            return;
        }

        for query in self.queries.values_mut() {
            if let Some(candidate) = query.remove_inflight(transaction_id) {
                query.handle_failure(candidate);
                return;
            }
        }

        for store_query in self.store_queries.values_mut() {
            if store_query.remove_inflight(transaction_id) {
                store_query.error(error);
                return;
            }
        }
    }

    /// A request expired without a response: the peer is treated as dead for
    /// this exchange. The routing table is only touched for failed eviction
    /// probes, never for plain lookup timeouts.
    fn handle_timeout(&mut self, transaction_id: u16) {
        if let Some(check) = self.pending_evictions.remove(&transaction_id) {
            debug!(
                head = ?check.head,
                replacement = ?check.candidate.id(),
                "Bucket head unresponsive, evicting"
            );

            self.routing_table.remove(&check.head);
            self.routing_table.insert(check.candidate);
            return;
        }

        for query in self.queries.values_mut() {
            if let Some(candidate) = query.remove_inflight(transaction_id) {
                query.handle_failure(candidate);
                return;
            }
        }

        for store_query in self.store_queries.values_mut() {
            if store_query.remove_inflight(transaction_id) {
                // A silent node simply does not count toward the aggregate.
                return;
            }
        }
    }

    fn start_query(
        &mut self,
        target: Id,
        kind: LookupKind,
        sender: Option<flume::Sender<LookupResult>>,
    ) {
        if let Some(query) = self.queries.get_mut(&target) {
            if kind == LookupKind::Value {
                query.upgrade_to_value();
            }
            query.add_sender(sender);
            return;
        }

        let mut query = IterativeQuery::new(target, kind, self.self_contact(), self.lookup_timeout);
        query.add_sender(sender);

        // Seed the query with the closest contacts we know about.
        for contact in self.routing_table.closest(&target, MAX_BUCKET_SIZE_K) {
            query.add_candidate(contact);
        }

        query.start(&mut self.socket);

        self.queries.insert(target, query);
    }

    fn on_query_done(&mut self, target: Id, query: &IterativeQuery) {
        let closest = query.closest_responded();

        if let Some(store_query) = self.store_queries.get_mut(&target) {
            if !store_query.started() {
                store_query.start(&mut self.socket, &closest);
            }
        }

        self.advance_join(target, &closest);
    }

    fn advance_join(&mut self, target: Id, closest: &[Contact]) {
        let Some(mut join) = self.join.take() else {
            return;
        };

        match join.stage {
            JoinStage::SelfLookup if target == self.id => {
                if closest.is_empty() {
                    debug!("Could not bootstrap the routing table");
                    let _ = join.sender.send(Err(Error::NoClosestNodes));
                    return;
                }

                let targets = self.refresh_targets();

                if targets.is_empty() {
                    debug!(table_size = self.routing_table.size(), "Joined the network");
                    let _ = join.sender.send(Ok(()));
                    return;
                }

                let mut pending = HashSet::new();
                for refresh_target in targets {
                    pending.insert(refresh_target);
                    self.start_query(refresh_target, LookupKind::Nodes, None);
                }

                join.stage = JoinStage::Refreshing(pending);
                self.join = Some(join);
            }
            JoinStage::Refreshing(ref mut pending) => {
                pending.remove(&target);

                if pending.is_empty() {
                    debug!(table_size = self.routing_table.size(), "Joined the network");
                    let _ = join.sender.send(Ok(()));
                } else {
                    self.join = Some(join);
                }
            }
            _ => self.join = Some(join),
        }
    }

    /// Random lookup targets, one per non-empty bucket farther from us than
    /// the closest neighbor's bucket.
    fn refresh_targets(&self) -> Vec<Id> {
        let occupied: Vec<u8> = self
            .routing_table
            .buckets()
            .iter()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(index, _)| *index)
            .collect();

        let Some(closest_index) = occupied.first() else {
            return Vec::new();
        };

        occupied
            .iter()
            .filter(|index| *index > closest_index)
            .map(|index| self.id.random_within_bucket(*index))
            .collect()
    }

    fn run_maintenance(&mut self) {
        if self.last_replicate.elapsed() >= self.replicate_interval {
            self.last_replicate = Instant::now();
            self.replicate();
        }

        if self.last_expire.elapsed() >= self.expire_after {
            self.last_expire = Instant::now();
            self.expire();
        }
    }

    /// Republish every record that has not been touched in the republish
    /// window, ours and others' alike, so the k closest nodes keep holding
    /// it under churn. Failures are logged; the next pass retries.
    fn replicate(&mut self) {
        let due_after = self.republish_after.as_millis() as u64;
        let now = now_millis();

        let mut due = Vec::new();
        for entry in self.storage.scan() {
            let (key, bytes) = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(?e, "Replicate pass aborted by scan failure");
                    break;
                }
            };

            match Record::from_bytes(&bytes) {
                Ok(record) if now.saturating_sub(record.timestamp) >= due_after => {
                    due.push((key, record.value));
                }
                Ok(_) => {}
                Err(e) => warn!(?key, ?e, "Skipping undecodable record"),
            }
        }

        for (key, value) in due {
            debug!(?key, "Republishing record");
            self.put(key, value, None);
        }
    }

    /// Delete every record whose age has reached the expiry window; a
    /// record accepted just now always survives.
    fn expire(&mut self) {
        let threshold = self.expire_after.as_millis() as u64;
        let now = now_millis();

        let mut expired = Vec::new();
        for entry in self.storage.scan() {
            let (key, bytes) = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(?e, "Expire pass aborted by scan failure");
                    break;
                }
            };

            match Record::from_bytes(&bytes) {
                Ok(record) if now.saturating_sub(record.timestamp) >= threshold => {
                    expired.push(key);
                }
                Ok(_) => {}
                Err(e) => warn!(?key, ?e, "Skipping undecodable record"),
            }
        }

        for key in expired {
            debug!(?key, "Expiring record");
            if let Err(e) = self.storage.del(&key) {
                warn!(?key, ?e, "Failed to delete expired record");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::{json, Value};

    use super::socket::testing::{channel_transport, TestWire};
    use super::*;
    use crate::common::ID_SIZE;
    use crate::storage::MemoryStore;

    fn rpc() -> (Rpc, TestWire) {
        rpc_with(Config::default(), MemoryStore::new(), None)
    }

    fn rpc_with(
        config: Config,
        storage: MemoryStore,
        validator: Option<Box<dyn Validate>>,
    ) -> (Rpc, TestWire) {
        let (transport, wire) = channel_transport(4000);
        (
            Rpc::with_transport(config, Box::new(transport), Box::new(storage), validator),
            wire,
        )
    }

    fn peer(port: u16) -> Contact {
        Contact::new(
            Id::random(),
            SocketAddrV4::new([127, 0, 0, 1].into(), port),
        )
    }

    /// A contact in bucket 159 of a node with an all-zero id.
    fn far_peer(low_byte: u8, port: u16) -> Contact {
        let mut bytes = [0_u8; ID_SIZE];
        bytes[0] = 0x80;
        bytes[ID_SIZE - 1] = low_byte;
        Contact::new(
            Id::from_bytes(bytes).unwrap(),
            SocketAddrV4::new([127, 0, 0, 1].into(), port),
        )
    }

    fn zero_id_config() -> Config {
        Config {
            node_id: Some(Id::from_bytes([0; ID_SIZE]).unwrap()),
            ..Default::default()
        }
    }

    fn request(transaction_id: u16, sender: &Contact, request: RequestTypeSpecific) -> Message {
        Message {
            transaction_id,
            body: MessageBody::Request(RequestSpecific {
                sender: sender.clone(),
                request,
            }),
        }
    }

    fn ack_from(transaction_id: u16, sender: &Contact) -> Message {
        Message {
            transaction_id,
            body: MessageBody::Response(ResponseSpecific::ack(sender.clone())),
        }
    }

    fn nodes_from(transaction_id: u16, sender: &Contact, nodes: Vec<Contact>) -> Message {
        Message {
            transaction_id,
            body: MessageBody::Response(ResponseSpecific {
                sender: sender.clone(),
                nodes: Some(nodes),
                value: None,
            }),
        }
    }

    #[test]
    fn ping_reply_echoes_transaction_id() {
        let (mut rpc, wire) = rpc();
        let sender = peer(5000);

        wire.send_message(
            &request(77, &sender, RequestTypeSpecific::Ping),
            sender.address(),
        );

        rpc.tick();

        let (reply, to) = wire.recv_message().unwrap();

        assert_eq!(to, sender.address());
        assert_eq!(reply.transaction_id, 77);
        match reply.body {
            MessageBody::Response(response) => assert_eq!(*response.sender.id(), rpc.id()),
            other => panic!("expected response, got {other:?}"),
        }

        // Any well-formed message teaches the routing table its sender.
        assert!(rpc.routing_table.contains(sender.id()));
    }

    #[test]
    fn full_bucket_keeps_live_head() {
        let (mut rpc, wire) = rpc_with(zero_id_config(), MemoryStore::new(), None);

        for i in 0..MAX_BUCKET_SIZE_K as u8 {
            rpc.routing_table.insert(far_peer(i, 1000 + i as u16));
        }

        let head = rpc.routing_table.buckets()[&159].head().cloned().unwrap();
        let candidate = far_peer(0xff, 2000);

        rpc.update_contact(candidate.clone());

        // The head gets pinged before anyone is evicted.
        let (probe, to) = wire.recv_message().unwrap();
        assert_eq!(to, head.address());
        assert!(matches!(
            probe.body,
            MessageBody::Request(RequestSpecific {
                request: RequestTypeSpecific::Ping,
                ..
            })
        ));

        wire.send_message(&ack_from(probe.transaction_id, &head), head.address());
        rpc.tick();

        // The live head survives at the tail; the newcomer is discarded.
        let bucket = &rpc.routing_table.buckets()[&159];
        assert!(!bucket.contains(candidate.id()));
        assert_eq!(bucket.tail().unwrap().id(), head.id());
        assert_eq!(bucket.len(), MAX_BUCKET_SIZE_K);
    }

    #[test]
    fn full_bucket_evicts_dead_head() {
        let config = Config {
            request_timeout: Duration::ZERO,
            ..zero_id_config()
        };
        let (mut rpc, wire) = rpc_with(config, MemoryStore::new(), None);

        for i in 0..MAX_BUCKET_SIZE_K as u8 {
            rpc.routing_table.insert(far_peer(i, 1000 + i as u16));
        }

        let head = rpc.routing_table.buckets()[&159].head().cloned().unwrap();
        let candidate = far_peer(0xff, 2000);

        rpc.update_contact(candidate.clone());
        assert!(wire.recv_message().is_some(), "head should be pinged");

        std::thread::sleep(Duration::from_millis(1));
        rpc.tick();

        let bucket = &rpc.routing_table.buckets()[&159];
        assert!(!bucket.contains(head.id()));
        assert_eq!(bucket.tail().unwrap().id(), candidate.id());
        assert_eq!(bucket.len(), MAX_BUCKET_SIZE_K);
    }

    #[test]
    fn store_rejected_by_validator_stores_nothing() {
        #[derive(Debug, Clone)]
        struct RejectAll;

        impl Validate for RejectAll {
            fn validate(&self, _key: &Id, _value: &Value) -> bool {
                false
            }
        }

        let (mut rpc, wire) = rpc_with(
            Config::default(),
            MemoryStore::new(),
            Some(Box::new(RejectAll)),
        );

        let sender = peer(5000);
        let key = Id::from_seed("beep");

        wire.send_message(
            &request(
                9,
                &sender,
                RequestTypeSpecific::Store {
                    key,
                    value: json!("value"),
                },
            ),
            sender.address(),
        );

        rpc.tick();

        let (reply, _) = wire.recv_message().unwrap();
        match reply.body {
            MessageBody::Error(error) => assert_eq!(error.code, server::CODE_VALUE_REJECTED),
            other => panic!("expected error, got {other:?}"),
        }

        assert!(rpc.storage.get(&key).unwrap().is_none());
    }

    #[test]
    fn find_value_miss_replies_with_nodes() {
        let (mut rpc, wire) = rpc();
        let sender = peer(5000);

        wire.send_message(
            &request(
                3,
                &sender,
                RequestTypeSpecific::FindValue {
                    target: Id::random(),
                },
            ),
            sender.address(),
        );

        rpc.tick();

        let (reply, _) = wire.recv_message().unwrap();
        match reply.body {
            MessageBody::Response(response) => {
                assert!(response.nodes.is_some());
                assert!(response.value.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn get_short_circuits_on_local_hit() {
        let mut storage = MemoryStore::new();
        let key = Id::from_seed("beep");
        let record = Record::new(json!("boop"), Id::random());
        storage.put(key, record.to_bytes().unwrap()).unwrap();

        let (mut rpc, wire) = rpc_with(Config::default(), storage, None);

        let (tx, rx) = flume::unbounded();
        rpc.get(key, Some(tx));

        assert!(matches!(rx.try_recv().unwrap(), LookupResult::Value(v) if v == json!("boop")));
        // No lookup was started and nothing went out.
        assert!(rpc.queries.is_empty());
        assert!(wire.recv_message().is_none());
    }

    #[test]
    fn put_converges_then_stores_at_closest() {
        let (mut rpc, wire) = rpc();
        let remote = peer(5000);
        rpc.routing_table.insert(remote.clone());

        let key = Id::from_seed("beep");
        let (tx, rx) = flume::unbounded();
        rpc.put(key, json!("boop"), Some(tx));

        // The nodes lookup goes out first.
        let (lookup, to) = wire.recv_message().unwrap();
        assert_eq!(to, remote.address());
        assert!(matches!(
            lookup.body,
            MessageBody::Request(RequestSpecific {
                request: RequestTypeSpecific::FindNode { target },
                ..
            }) if target == key
        ));

        wire.send_message(
            &nodes_from(lookup.transaction_id, &remote, vec![]),
            remote.address(),
        );
        rpc.tick();
        rpc.tick();

        // The lookup converged on the only responder; STORE follows.
        let (store, to) = wire.recv_message().unwrap();
        assert_eq!(to, remote.address());
        match &store.body {
            MessageBody::Request(RequestSpecific {
                request: RequestTypeSpecific::Store { key: k, value },
                ..
            }) => {
                assert_eq!(*k, key);
                assert_eq!(*value, json!("boop"));
            }
            other => panic!("expected STORE, got {other:?}"),
        }

        wire.send_message(&ack_from(store.transaction_id, &remote), remote.address());
        rpc.tick();
        rpc.tick();

        assert_eq!(rx.try_recv().unwrap().unwrap(), 1);
        assert!(rpc.store_queries.is_empty());
    }

    #[test]
    fn put_with_empty_routing_table_fails() {
        let (mut rpc, _wire) = rpc();

        let (tx, rx) = flume::unbounded();
        rpc.put(Id::from_seed("beep"), json!("boop"), Some(tx));

        rpc.tick();
        rpc.tick();

        assert!(matches!(rx.try_recv().unwrap(), Err(Error::NoClosestNodes)));
    }

    #[test]
    fn local_put_respects_validator() {
        #[derive(Debug, Clone)]
        struct RejectAll;

        impl Validate for RejectAll {
            fn validate(&self, _key: &Id, _value: &Value) -> bool {
                false
            }
        }

        let (mut rpc, wire) = rpc_with(
            Config::default(),
            MemoryStore::new(),
            Some(Box::new(RejectAll)),
        );

        let (tx, rx) = flume::unbounded();
        rpc.put(Id::from_seed("beep"), json!("boop"), Some(tx));

        assert!(matches!(rx.try_recv().unwrap(), Err(Error::InvalidValue)));
        assert!(rpc.queries.is_empty());
        assert!(wire.recv_message().is_none());
    }

    #[test]
    fn join_through_a_single_seed() {
        let (mut rpc, wire) = rpc();
        let seed = peer(5000);

        let (tx, rx) = flume::unbounded();
        rpc.join(seed.clone(), tx);

        let (lookup, to) = wire.recv_message().unwrap();
        assert_eq!(to, seed.address());
        assert!(matches!(
            lookup.body,
            MessageBody::Request(RequestSpecific {
                request: RequestTypeSpecific::FindNode { target },
                ..
            }) if target == rpc.id()
        ));

        wire.send_message(
            &nodes_from(lookup.transaction_id, &seed, vec![]),
            seed.address(),
        );
        rpc.tick();
        rpc.tick();

        // One occupied bucket means nothing farther to refresh.
        assert!(rx.try_recv().unwrap().is_ok());
        assert!(rpc.routing_table.contains(seed.id()));
    }

    #[test]
    fn join_refreshes_buckets_beyond_the_closest() {
        let (mut rpc, wire) = rpc();

        // A seed close to us and another far away: the far bucket gets a
        // refresh lookup once the self-lookup converges.
        let near = Contact::new(
            rpc.id().random_within_bucket(10),
            SocketAddrV4::new([127, 0, 0, 1].into(), 5000),
        );
        let far = Contact::new(
            rpc.id().random_within_bucket(159),
            SocketAddrV4::new([127, 0, 0, 1].into(), 5001),
        );
        rpc.routing_table.insert(far.clone());

        let (tx, rx) = flume::unbounded();
        rpc.join(near.clone(), tx);

        // Self-lookup goes to both known contacts.
        let mut lookups = Vec::new();
        while let Some(message) = wire.recv_message() {
            lookups.push(message);
        }
        assert_eq!(lookups.len(), 2);

        for (message, from) in &lookups {
            let sender = if *from == near.address() { &near } else { &far };
            wire.send_message(&nodes_from(message.transaction_id, sender, vec![]), *from);
            rpc.tick();
        }
        rpc.tick();

        // Not joined yet: the far bucket refresh is still running.
        assert!(rx.try_recv().is_err());

        // The refresh queries every known contact about a random id in the
        // far bucket.
        let mut refreshes = Vec::new();
        while let Some(message) = wire.recv_message() {
            refreshes.push(message);
        }
        assert!(!refreshes.is_empty());

        for (message, from) in &refreshes {
            let target = match &message.body {
                MessageBody::Request(RequestSpecific {
                    request: RequestTypeSpecific::FindNode { target },
                    ..
                }) => *target,
                other => panic!("expected FIND_NODE, got {other:?}"),
            };
            assert_eq!(rpc.id().bucket_index(&target), Some(159));

            let sender = if *from == near.address() { &near } else { &far };
            wire.send_message(&nodes_from(message.transaction_id, sender, vec![]), *from);
            rpc.tick();
        }
        rpc.tick();

        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn replicate_republishes_due_records() {
        let mut storage = MemoryStore::new();

        let due_key = Id::from_seed("due");
        let mut due_record = Record::new(json!("old"), Id::from_seed("other_node"));
        due_record.timestamp = now_millis() - DEFAULT_REPUBLISH_AFTER_MILLIS;
        storage.put(due_key, due_record.to_bytes().unwrap()).unwrap();

        let fresh_key = Id::from_seed("fresh");
        let fresh_record = Record::new(json!("new"), Id::from_seed("other_node"));
        storage
            .put(fresh_key, fresh_record.to_bytes().unwrap())
            .unwrap();

        let (mut rpc, _wire) = rpc_with(Config::default(), storage, None);

        rpc.replicate();

        // Exactly the due record is re-published.
        assert_eq!(rpc.store_queries.len(), 1);
        assert!(rpc.store_queries.contains_key(&due_key));
        assert!(rpc.queries.contains_key(&due_key));
    }

    #[test]
    fn expire_honors_threshold() {
        let mut storage = MemoryStore::new();

        let old_key = Id::from_seed("old");
        let mut old_record = Record::new(json!("old"), Id::random());
        old_record.timestamp = now_millis() - DEFAULT_EXPIRE_AFTER_MILLIS;
        storage.put(old_key, old_record.to_bytes().unwrap()).unwrap();

        let fresh_key = Id::from_seed("fresh");
        let fresh_record = Record::new(json!("fresh"), Id::random());
        storage
            .put(fresh_key, fresh_record.to_bytes().unwrap())
            .unwrap();

        let (mut rpc, _wire) = rpc_with(Config::default(), storage, None);

        rpc.expire();

        assert!(rpc.storage.get(&old_key).unwrap().is_none());
        assert!(rpc.storage.get(&fresh_key).unwrap().is_some());
    }

    const DEFAULT_REPUBLISH_AFTER_MILLIS: u64 =
        config::DEFAULT_REPUBLISH_AFTER.as_millis() as u64;
    const DEFAULT_EXPIRE_AFTER_MILLIS: u64 = config::DEFAULT_EXPIRE_AFTER.as_millis() as u64;
}
