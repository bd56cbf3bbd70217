//! # Kadmos
//!
//! A Kademlia distributed hash table node: k-bucket routing with
//! liveness-aware eviction, iterative FIND_NODE / FIND_VALUE lookups, the
//! four-message RPC protocol over JSON datagrams, and the periodic
//! republish / replicate / expire passes that keep records alive under
//! churn.
//!
//! Storage, transport, and record validation are pluggable: the node is
//! constructed with a [Storage] engine (defaulting to [MemoryStore]), an
//! optional [Validate] predicate, and, at the [rpc::Rpc] layer, any
//! [Transport] implementation.
//!
//! ```no_run
//! use kadmos::Node;
//! use serde_json::json;
//!
//! let node = Node::builder().build().unwrap();
//! node.put("beep", json!("boop")).unwrap();
//! assert_eq!(node.get("beep").unwrap(), json!("boop"));
//! ```

mod common;
mod error;

pub mod node;
pub mod rpc;
pub mod storage;

pub use crate::common::{
    messages, BucketInsert, Contact, Id, KBucket, Record, RoutingTable, ID_BITS, ID_SIZE,
    MAX_BUCKET_SIZE_K,
};
pub use error::Error;
pub use node::{Info, Node, NodeBuilder};
pub use rpc::config::Config;
pub use rpc::server::Validate;
pub use rpc::socket::{Transport, UdpTransport};
pub use storage::{MemoryStore, Storage, StorageError};

// Alias Result to be the crate Result.
pub type Result<T, E = Error> = core::result::Result<T, E>;
