//! Main Crate Error

use crate::storage::StorageError;

#[derive(thiserror::Error, Debug)]
/// Kadmos crate error enum.
pub enum Error {
    /// Indicates that an identifier could not be built from the given bytes.
    #[error("Invalid identifier size: {0}")]
    InvalidIdSize(usize),

    /// Indicates that an identifier string is not valid hex of length 40.
    #[error("Invalid identifier encoding: {0}")]
    InvalidIdEncoding(String),

    /// Indicates that an inbound message is missing required fields.
    #[error("Malformed message: {0}")]
    MalformedMessage(&'static str),

    #[error("Failed to encode or decode JSON: {0}")]
    /// Errors related to serializing wire messages or stored records.
    Json(#[from] serde_json::Error),

    /// The configured validator rejected the value.
    #[error("Value rejected by validator")]
    InvalidValue,

    /// The key is neither stored locally nor held by any reachable node.
    #[error("Value not found")]
    NotFound,

    /// Failed to find any nodes close to the target, usually means the
    /// routing table is empty because the node never joined a network.
    #[error("Failed to find any nodes close to the target")]
    NoClosestNodes,

    /// A store fanned out to the closest nodes but none replied with an
    /// acknowledgment or an error before the request timeout.
    #[error("No node acknowledged the store request")]
    StoreTimeout,

    /// The closest nodes rejected the store request; contains the most
    /// common error response.
    #[error("Store request rejected: {0}")]
    StoreRejected(String),

    #[error(transparent)]
    /// Transparent [StorageError]
    Storage(#[from] StorageError),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    Io(#[from] std::io::Error),

    /// The node actor thread is no longer running.
    #[error("Node actor has shut down")]
    Shutdown,
}
