//! Handlers answering the four inbound request methods.

use std::fmt::Debug;

use dyn_clone::DynClone;
use serde_json::Value;
use tracing::{debug, warn};

use crate::common::messages::{ErrorSpecific, RequestTypeSpecific, ResponseSpecific};
use crate::common::{Contact, Id, Record, RoutingTable, MAX_BUCKET_SIZE_K};
use crate::storage::Storage;

/// Error code returned when the configured validator rejects a STORE.
pub const CODE_VALUE_REJECTED: u16 = 403;
/// Error code returned when accepting a record fails internally.
pub const CODE_INTERNAL: u16 = 500;

/// An application-supplied validity predicate over `(key, value)` pairs,
/// consulted before a record is accepted locally or published remotely.
/// When no validator is configured, all writes are accepted.
pub trait Validate: Send + Sync + Debug + DynClone {
    /// Returns true if the value may be stored under the key.
    fn validate(&self, key: &Id, value: &Value) -> bool;
}

dyn_clone::clone_trait_object!(Validate);

/// A reply to an inbound request; the dispatcher sends it back with the
/// request's transaction id.
#[derive(Debug)]
pub(crate) enum HandlerReply {
    Response(ResponseSpecific),
    Error(ErrorSpecific),
}

/// Returns the reply for a request. The routing table update for the sender
/// has already happened by the time this runs.
pub(crate) fn handle_request(
    self_contact: &Contact,
    routing_table: &RoutingTable,
    storage: &mut Box<dyn Storage>,
    validator: Option<&dyn Validate>,
    sender: &Contact,
    request: &RequestTypeSpecific,
) -> HandlerReply {
    match request {
        RequestTypeSpecific::Ping => {
            HandlerReply::Response(ResponseSpecific::ack(self_contact.clone()))
        }
        RequestTypeSpecific::Store { key, value } => {
            handle_store(self_contact, storage, validator, sender, *key, value)
        }
        RequestTypeSpecific::FindNode { target } => HandlerReply::Response(ResponseSpecific {
            sender: self_contact.clone(),
            nodes: Some(routing_table.closest(target, MAX_BUCKET_SIZE_K)),
            value: None,
        }),
        RequestTypeSpecific::FindValue { target } => {
            handle_find_value(self_contact, routing_table, storage, target)
        }
    }
}

fn handle_store(
    self_contact: &Contact,
    storage: &mut Box<dyn Storage>,
    validator: Option<&dyn Validate>,
    sender: &Contact,
    key: Id,
    value: &Value,
) -> HandlerReply {
    if let Some(validator) = validator {
        if !validator.validate(&key, value) {
            debug!(?key, from = ?sender.id(), "Validator rejected inbound record");

            return HandlerReply::Error(ErrorSpecific {
                code: CODE_VALUE_REJECTED,
                message: "Value rejected".to_string(),
            });
        }
    }

    let record = Record::new(value.clone(), *sender.id());

    let stored = record
        .to_bytes()
        .map_err(|e| e.to_string())
        .and_then(|bytes| storage.put(key, bytes).map_err(|e| e.to_string()));

    match stored {
        Ok(()) => {
            debug!(?key, publisher = ?sender.id(), "Stored record");
            HandlerReply::Response(ResponseSpecific::ack(self_contact.clone()))
        }
        Err(e) => {
            warn!(?key, error = %e, "Failed to store record");
            HandlerReply::Error(ErrorSpecific {
                code: CODE_INTERNAL,
                message: "Failed to store record".to_string(),
            })
        }
    }
}

fn handle_find_value(
    self_contact: &Contact,
    routing_table: &RoutingTable,
    storage: &mut Box<dyn Storage>,
    target: &Id,
) -> HandlerReply {
    match storage.get(target) {
        Ok(Some(bytes)) => match Record::from_bytes(&bytes) {
            Ok(record) => {
                return HandlerReply::Response(ResponseSpecific {
                    sender: self_contact.clone(),
                    nodes: None,
                    value: Some(record.value),
                });
            }
            Err(e) => {
                warn!(key = ?target, ?e, "Stored record is undecodable, answering with nodes");
            }
        },
        Ok(None) => {}
        Err(e) => {
            warn!(key = ?target, ?e, "Storage read failed, answering with nodes");
        }
    }

    // A miss answers exactly like FIND_NODE.
    HandlerReply::Response(ResponseSpecific {
        sender: self_contact.clone(),
        nodes: Some(routing_table.closest(target, MAX_BUCKET_SIZE_K)),
        value: None,
    })
}
