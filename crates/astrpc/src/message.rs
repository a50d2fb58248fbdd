//! # Protocol Frames
//!
//! Request:  `{ "jsonrpc": "jsonast", "id": <token>, "method": <node> }`
//!
//! Response: `{ "jsonrpc": "jsonast", "id": <token>, "result": <value> }`
//! or        `{ "jsonrpc": "jsonast", "id": <token>, "error": {code, message, data?} }`
//!
//! ## Invariants
//! - **Panic Safety**: Decoding never panics on unknown data.
//! - **Key presence decides the kind**: A frame with `method` is a request; one
//!   with `result` or `error` is a response, even when `result` is `null`.
//! - **Recoverable ids**: Shape errors carry the frame's id when it was readable,
//!   so the receive loop can answer them.

use serde_json::Map;
use serde_json::Value;

use crate::ast::AstNode;
use crate::codec;
use crate::error::ProtocolError;
use crate::error::Result;
use crate::error::RpcError;

/// The value of the `jsonrpc` field.
pub const PROTOCOL: &str = "jsonast";

/// An inbound call.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub id: String,
    pub method: AstNode,
}

/// The answer to a [`Request`].
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// `None` only for errors answering frames whose id was unreadable.
    pub id: Option<String>,
    pub outcome: std::result::Result<Value, RpcError>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn request(id: impl Into<String>, method: AstNode) -> Self {
        Self::Request(Request { id: id.into(), method })
    }

    pub fn response(id: impl Into<String>, result: Value) -> Self {
        Self::Response(Response { id: Some(id.into()), outcome: Ok(result) })
    }

    pub fn error(id: Option<String>, error: RpcError) -> Self {
        Self::Response(Response { id, outcome: Err(error) })
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Response(resp) => resp.id.as_deref(),
        }
    }

    /// Decodes a frame.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Decodes an already-parsed frame.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::invalid("frame must be an object"));
        };

        let id = match map.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let invalid = |reason: &str| ProtocolError::InvalidRequest {
            id: id.clone(),
            reason: reason.to_string(),
        };

        match map.get("jsonrpc") {
            Some(Value::String(p)) if p == PROTOCOL => {}
            Some(Value::String(p)) => return Err(invalid(&format!("unsupported protocol '{}'", p))),
            _ => return Err(invalid("missing jsonrpc field")),
        }

        if let Some(method) = map.get("method") {
            let Some(request_id) = id.clone() else {
                return Err(invalid("request without id"));
            };
            let node = codec::decode(method).map_err(|e| e.with_id(&request_id))?;
            return Ok(Self::request(request_id, node));
        }

        if let Some(error) = map.remove("error") {
            if !error.is_null() {
                let error: RpcError = serde_json::from_value(error)
                    .map_err(|e| invalid(&format!("malformed error object: {}", e)))?;
                return Ok(Self::error(id.clone(), error));
            }
        }

        if let Some(result) = map.remove("result") {
            let Some(response_id) = id.clone() else {
                return Err(invalid("response without id"));
            };
            return Ok(Self::response(response_id, result));
        }

        Err(invalid("frame is neither a request nor a response"))
    }

    /// Encodes the frame as a JSON value.
    pub fn to_value(&self) -> Result<Value> {
        let mut map = Map::new();
        map.insert("jsonrpc".into(), Value::from(PROTOCOL));

        match self {
            Self::Request(req) => {
                map.insert("id".into(), Value::from(req.id.as_str()));
                map.insert("method".into(), codec::encode(&req.method)?);
            }
            Self::Response(resp) => {
                let id = resp.id.as_deref().map(Value::from).unwrap_or(Value::Null);
                map.insert("id".into(), id);
                match &resp.outcome {
                    Ok(result) => {
                        map.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        map.insert("error".into(), serde_json::to_value(error)?);
                    }
                }
            }
        }

        Ok(Value::Object(map))
    }

    /// Encodes the frame as JSON text.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_value()?)?)
    }
}
