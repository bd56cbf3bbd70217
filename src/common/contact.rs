//! Struct and implementation of the Contact entry in the routing table.

use std::fmt::{self, Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::common::Id;

#[derive(Clone)]
/// A routable peer descriptor: node id, socket address, and the last time
/// any message from it was observed.
///
/// Identity is the node id alone; two contacts with the same id compare
/// equal even if their addresses differ.
pub struct Contact {
    id: Id,
    address: SocketAddrV4,
    last_seen: Instant,
}

impl Contact {
    /// Creates a new Contact from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Contact {
        Contact {
            id,
            address,
            last_seen: Instant::now(),
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Creates a contact with a random id for testing purposes.
    pub fn random() -> Contact {
        Contact::new(Id::random(), SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Debug for Contact {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Contact")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("last_seen", &self.last_seen.elapsed().as_secs())
            .finish()
    }
}

/// Wire representation: `{"id": hex, "address": ip, "port": n}`.
#[derive(Serialize, Deserialize)]
struct WireContact {
    id: Id,
    address: Ipv4Addr,
    port: u16,
}

impl Serialize for Contact {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireContact {
            id: self.id,
            address: *self.address.ip(),
            port: self.address.port(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Contact {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Contact, D::Error> {
        let wire = WireContact::deserialize(deserializer)?;

        Ok(Contact::new(
            wire.id,
            SocketAddrV4::new(wire.address, wire.port),
        ))
    }
}
