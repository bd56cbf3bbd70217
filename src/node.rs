//! The public node handle: an actor thread driving the [Rpc] engine, and
//! blocking methods talking to it over channels.

use std::net::SocketAddrV4;
use std::thread::{self, JoinHandle};

use serde_json::Value;
use tracing::debug;

use crate::common::{Contact, Id};
use crate::rpc::config::Config;
use crate::rpc::query::LookupResult;
use crate::rpc::server::Validate;
use crate::rpc::socket::Transport;
use crate::rpc::Rpc;
use crate::storage::{MemoryStore, Storage};
use crate::{Error, Result};

#[derive(Debug)]
/// A running DHT node.
///
/// Owns a background thread that ticks the [Rpc] engine; the handle's
/// methods block until the engine answers. Clones share the same node.
pub struct Node {
    id: Id,
    local_addr: SocketAddrV4,
    sender: flume::Sender<ActorMessage>,
    handle: Option<JoinHandle<()>>,
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Node {
            id: self.id,
            local_addr: self.local_addr,
            sender: self.sender.clone(),
            handle: None,
        }
    }
}

#[derive(Debug)]
enum ActorMessage {
    Put(Id, Value, flume::Sender<Result<usize>>),
    Get(Id, flume::Sender<LookupResult>),
    Join(Contact, flume::Sender<Result<()>>),
    Info(flume::Sender<Info>),
    Shutdown,
}

#[derive(Debug, Clone)]
/// A snapshot of the node's state.
pub struct Info {
    pub id: Id,
    pub local_addr: SocketAddrV4,
    pub routing_table_size: usize,
}

#[derive(Debug, Default)]
/// Builds a [Node], collecting its configuration and collaborators.
pub struct NodeBuilder {
    config: Config,
    storage: Option<Box<dyn Storage>>,
    validator: Option<Box<dyn Validate>>,
    transport: Option<Box<dyn Transport>>,
}

impl NodeBuilder {
    /// Set an explicit UDP port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    /// Set the advertised IPv4 address, also hashed into the node id.
    pub fn address(mut self, address: std::net::Ipv4Addr) -> Self {
        self.config.address = Some(address);
        self
    }

    /// Set an explicit node id instead of deriving one from the endpoint.
    pub fn node_id(mut self, id: Id) -> Self {
        self.config.node_id = Some(id);
        self
    }

    /// Override the per-request timeout.
    pub fn request_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Override the total per-lookup deadline.
    pub fn lookup_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.lookup_timeout = timeout;
        self
    }

    /// Use the given storage engine instead of the in-memory default.
    pub fn storage(mut self, storage: impl Storage + 'static) -> Self {
        self.storage = Some(Box::new(storage));
        self
    }

    /// Install a validity predicate consulted before any record is accepted
    /// locally or published.
    pub fn validator(mut self, validator: impl Validate + 'static) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Use the given transport instead of binding a UDP socket.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Bind the socket and start the node's actor thread.
    pub fn build(self) -> Result<Node> {
        let storage = self
            .storage
            .unwrap_or_else(|| Box::new(MemoryStore::new()));

        let rpc = match self.transport {
            Some(transport) => Rpc::with_transport(self.config, transport, storage, self.validator),
            None => Rpc::new(self.config, storage, self.validator)?,
        };

        Ok(Node::spawn(rpc))
    }
}

impl Node {
    /// Returns a builder for a node with default configuration.
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    fn spawn(rpc: Rpc) -> Node {
        let id = rpc.id();
        let local_addr = rpc.local_addr();

        let (sender, receiver) = flume::unbounded();

        let handle = thread::spawn(move || run(rpc, receiver));

        Node {
            id,
            local_addr,
            sender,
            handle: Some(handle),
        }
    }

    // === Getters ===

    /// Returns this node's id.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns the address the node is listening on.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// This node as a contact other nodes can join through.
    pub fn contact(&self) -> Contact {
        Contact::new(self.id, self.local_addr)
    }

    /// Returns a snapshot of the node's state.
    pub fn info(&self) -> Result<Info> {
        let (tx, rx) = flume::bounded(1);
        self.sender
            .send(ActorMessage::Info(tx))
            .map_err(|_| Error::Shutdown)?;
        rx.recv().map_err(|_| Error::Shutdown)
    }

    // === Public Methods ===

    /// Store a value in the network under the key derived from `key_seed`.
    /// Returns the key. Succeeds when at least one of the closest nodes
    /// acknowledged the store.
    pub fn put<T: AsRef<[u8]>>(&self, key_seed: T, value: Value) -> Result<Id> {
        let key = Id::from_seed(key_seed);

        let (tx, rx) = flume::bounded(1);
        self.sender
            .send(ActorMessage::Put(key, value, tx))
            .map_err(|_| Error::Shutdown)?;

        rx.recv().map_err(|_| Error::Shutdown)??;

        Ok(key)
    }

    /// Retrieve the value stored under the key derived from `key_seed`,
    /// from local storage when present, otherwise through a value lookup.
    pub fn get<T: AsRef<[u8]>>(&self, key_seed: T) -> Result<Value> {
        let key = Id::from_seed(key_seed);

        let (tx, rx) = flume::bounded(1);
        self.sender
            .send(ActorMessage::Get(key, tx))
            .map_err(|_| Error::Shutdown)?;

        match rx.recv().map_err(|_| Error::Shutdown)? {
            LookupResult::Value(value) => Ok(value),
            LookupResult::NotFound(_) | LookupResult::Nodes(_) => Err(Error::NotFound),
        }
    }

    /// Join the network through a known contact. Blocks until the routing
    /// table is populated and distant buckets are refreshed.
    pub fn join(&self, seed: Contact) -> Result<()> {
        let (tx, rx) = flume::bounded(1);
        self.sender
            .send(ActorMessage::Join(seed, tx))
            .map_err(|_| Error::Shutdown)?;

        rx.recv().map_err(|_| Error::Shutdown)?
    }

    /// Stop the actor thread and wait for it to drain.
    pub fn shutdown(&mut self) {
        let _ = self.sender.send(ActorMessage::Shutdown);

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.sender.send(ActorMessage::Shutdown);
        }
    }
}

fn run(mut rpc: Rpc, receiver: flume::Receiver<ActorMessage>) {
    let id = rpc.id();
    debug!(?id, address = ?rpc.local_addr(), "Node actor started");

    loop {
        match receiver.try_recv() {
            Ok(ActorMessage::Put(key, value, sender)) => rpc.put(key, value, Some(sender)),
            Ok(ActorMessage::Get(key, sender)) => rpc.get(key, Some(sender)),
            Ok(ActorMessage::Join(seed, sender)) => rpc.join(seed, sender),
            Ok(ActorMessage::Info(sender)) => {
                let _ = sender.send(Info {
                    id: rpc.id(),
                    local_addr: rpc.local_addr(),
                    routing_table_size: rpc.routing_table_size(),
                });
            }
            Ok(ActorMessage::Shutdown) | Err(flume::TryRecvError::Disconnected) => break,
            Err(flume::TryRecvError::Empty) => {}
        }

        rpc.tick();
    }

    debug!(?id, "Node actor stopped");
}
