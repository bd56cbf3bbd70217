//! Wire messages: JSON requests, responses and errors correlated by id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{Contact, Id};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
/// A parsed wire message. Requests carry a method and params; responses a
/// result; errors an error object. All three share the correlation id.
pub struct Message {
    pub transaction_id: u16,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Request(RequestSpecific),
    Response(ResponseSpecific),
    Error(ErrorSpecific),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpecific {
    pub sender: Contact,
    pub request: RequestTypeSpecific,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestTypeSpecific {
    Ping,
    Store { key: Id, value: Value },
    FindNode { target: Id },
    FindValue { target: Id },
}

#[derive(Debug, Clone, PartialEq)]
/// A result payload. `nodes` is present on FIND_NODE replies and FIND_VALUE
/// misses; `value` on FIND_VALUE hits; plain acknowledgments carry neither.
pub struct ResponseSpecific {
    pub sender: Contact,
    pub nodes: Option<Vec<Contact>>,
    pub value: Option<Value>,
}

impl ResponseSpecific {
    /// A bare acknowledgment, used for PING and STORE replies.
    pub fn ack(sender: Contact) -> ResponseSpecific {
        ResponseSpecific {
            sender,
            nodes: None,
            value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSpecific {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
enum Method {
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "STORE")]
    Store,
    #[serde(rename = "FIND_NODE")]
    FindNode,
    #[serde(rename = "FIND_VALUE")]
    FindValue,
}

/// The JSON shape on the wire. A request has `method` and `params`; a
/// response has `result`; an error has `error`.
#[derive(Serialize, Deserialize)]
struct WireMessage {
    id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<Method>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<WirePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<WirePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorSpecific>,
}

/// Params and results share one shape; each method uses a subset.
#[derive(Serialize, Deserialize)]
struct WirePayload {
    contact: Contact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nodes: Option<Vec<Contact>>,
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_wire())?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        let wire: WireMessage = serde_json::from_slice(bytes)?;
        Message::from_wire(wire)
    }

    fn to_wire(&self) -> WireMessage {
        let mut wire = WireMessage {
            id: self.transaction_id,
            method: None,
            params: None,
            result: None,
            error: None,
        };

        match &self.body {
            MessageBody::Request(request) => {
                let (method, key, value) = match &request.request {
                    RequestTypeSpecific::Ping => (Method::Ping, None, None),
                    RequestTypeSpecific::Store { key, value } => {
                        (Method::Store, Some(*key), Some(value.clone()))
                    }
                    RequestTypeSpecific::FindNode { target } => {
                        (Method::FindNode, Some(*target), None)
                    }
                    RequestTypeSpecific::FindValue { target } => {
                        (Method::FindValue, Some(*target), None)
                    }
                };

                wire.method = Some(method);
                wire.params = Some(WirePayload {
                    contact: request.sender.clone(),
                    key,
                    value,
                    nodes: None,
                });
            }
            MessageBody::Response(response) => {
                wire.result = Some(WirePayload {
                    contact: response.sender.clone(),
                    key: None,
                    value: response.value.clone(),
                    nodes: response.nodes.clone(),
                });
            }
            MessageBody::Error(error) => {
                wire.error = Some(error.clone());
            }
        }

        wire
    }

    fn from_wire(wire: WireMessage) -> Result<Message> {
        let body = if let Some(method) = wire.method {
            let params = wire
                .params
                .ok_or(Error::MalformedMessage("request without params"))?;

            let request = match method {
                Method::Ping => RequestTypeSpecific::Ping,
                Method::Store => RequestTypeSpecific::Store {
                    key: params.key.ok_or(Error::MalformedMessage("STORE without key"))?,
                    value: params
                        .value
                        .ok_or(Error::MalformedMessage("STORE without value"))?,
                },
                Method::FindNode => RequestTypeSpecific::FindNode {
                    target: params
                        .key
                        .ok_or(Error::MalformedMessage("FIND_NODE without key"))?,
                },
                Method::FindValue => RequestTypeSpecific::FindValue {
                    target: params
                        .key
                        .ok_or(Error::MalformedMessage("FIND_VALUE without key"))?,
                },
            };

            MessageBody::Request(RequestSpecific {
                sender: params.contact,
                request,
            })
        } else if let Some(result) = wire.result {
            MessageBody::Response(ResponseSpecific {
                sender: result.contact,
                nodes: result.nodes,
                value: result.value,
            })
        } else if let Some(error) = wire.error {
            MessageBody::Error(error)
        } else {
            return Err(Error::MalformedMessage(
                "neither a request, a response, nor an error",
            ));
        };

        Ok(Message {
            transaction_id: wire.id,
            body,
        })
    }
}
