//! The record persisted under a key: the value itself plus provenance.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::Id;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// What the node keeps in storage for a key: the opaque value, the id of the
/// node that last published it, and the wall-clock instant (unix
/// milliseconds) this node accepted it.
///
/// The storage layer only ever sees the serialized bytes.
pub struct Record {
    pub value: Value,
    pub publisher: Id,
    pub timestamp: u64,
}

impl Record {
    /// Creates a record accepted right now.
    pub fn new(value: Value, publisher: Id) -> Record {
        Record {
            value,
            publisher,
            timestamp: now_millis(),
        }
    }

    /// Serializes the record into the opaque form the storage layer holds.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }

    /// Decodes a record from storage bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Record> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Milliseconds since this node last accepted the record.
    pub fn elapsed(&self) -> u64 {
        now_millis().saturating_sub(self.timestamp)
    }
}

/// Current wall-clock time in unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
