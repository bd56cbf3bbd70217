use std::net::Ipv4Addr;
use std::time::Duration;

use crate::common::Id;

use super::socket::DEFAULT_REQUEST_TIMEOUT;

/// Total deadline for a single iterative lookup; exceeding it terminates the
/// lookup as if all pending queries failed.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the replicate pass walks local storage.
pub const DEFAULT_REPLICATE_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// A record untouched for this long is due for republication.
pub const DEFAULT_REPUBLISH_AFTER: Duration = Duration::from_secs(24 * 60 * 60);
/// How often the expire pass walks local storage, and the age beyond which
/// records are deleted.
pub const DEFAULT_EXPIRE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
/// Node configuration.
pub struct Config {
    /// Explicit UDP port to listen on.
    ///
    /// Defaults to None: the default port, falling back to an OS-assigned
    /// one when taken.
    pub port: Option<u16>,
    /// The IPv4 address advertised to peers and hashed into the node id.
    ///
    /// Defaults to None, where the bound socket's address is used.
    pub address: Option<Ipv4Addr>,
    /// Explicit node id.
    ///
    /// Defaults to None, where the id is derived by hashing
    /// `{address}:{port}`.
    pub node_id: Option<Id>,
    /// How long to wait for a response before an outgoing request counts as
    /// failed and its correlation slot is released.
    ///
    /// The longer this duration is, the longer lookups take before they are
    /// deemed done; the shorter it is, the more responses from busy nodes
    /// are missed.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT].
    pub request_timeout: Duration,
    /// Total deadline for one iterative lookup.
    ///
    /// Defaults to [DEFAULT_LOOKUP_TIMEOUT].
    pub lookup_timeout: Duration,
    /// Cadence of the replicate maintenance pass.
    ///
    /// Defaults to [DEFAULT_REPLICATE_INTERVAL].
    pub replicate_interval: Duration,
    /// Age after which a record is republished by the replicate pass.
    ///
    /// Defaults to [DEFAULT_REPUBLISH_AFTER].
    pub republish_after: Duration,
    /// Cadence of the expire pass and the age beyond which records are
    /// deleted locally.
    ///
    /// Defaults to [DEFAULT_EXPIRE_AFTER].
    pub expire_after: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            address: None,
            node_id: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            replicate_interval: DEFAULT_REPLICATE_INTERVAL,
            republish_after: DEFAULT_REPUBLISH_AFTER,
            expire_after: DEFAULT_EXPIRE_AFTER,
        }
    }
}
