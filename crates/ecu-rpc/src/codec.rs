//! Text encoding and classification of JSON-RPC messages.
//!
//! [`decode`] turns one text frame into an [`Incoming`] message or a
//! [`ProtocolError`] carrying the JSON-RPC code the frame deserves:
//!
//! | Input | Outcome |
//! |---|---|
//! | not JSON | `Parse` (-32700) |
//! | not an object, batch array, `jsonrpc` != `"2.0"` | `InvalidRequest` (-32600) |
//! | `method` not a string, id not a string/number | `InvalidRequest` |
//! | `params` neither object nor array | `InvalidParams` (-32602) |
//! | no `method`, not exactly one of `result`/`error` | `InvalidRequest` |
//! | malformed `error` member | `InvalidRequest` |

use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::ProtocolError;
use crate::types::{
    ErrorObject, Incoming, Notification, Request, Response, ResponsePayload, RpcId, VERSION,
    Version,
};

/// Classify one inbound text frame.
pub fn decode(raw: &str) -> Result<Incoming, ProtocolError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ProtocolError::Parse {
        message: e.to_string(),
    })?;
    classify(value)
}

/// Classify an already-parsed JSON value.
pub fn classify(value: Value) -> Result<Incoming, ProtocolError> {
    let mut object = match value {
        Value::Object(object) => object,
        Value::Array(_) => return Err(ProtocolError::invalid("batch requests are not supported")),
        _ => return Err(ProtocolError::invalid("message must be a JSON object")),
    };

    match object.get("jsonrpc") {
        Some(Value::String(v)) if v == VERSION => {}
        Some(other) => {
            return Err(ProtocolError::invalid(format!(
                "unsupported jsonrpc version {other}"
            )));
        }
        None => return Err(ProtocolError::invalid("missing jsonrpc member")),
    }

    match object.remove("method") {
        Some(Value::String(method)) => call(method, object),
        Some(_) => Err(ProtocolError::invalid("method must be a string")),
        None => response(object),
    }
}

fn call(method: String, mut object: Map<String, Value>) -> Result<Incoming, ProtocolError> {
    if method.is_empty() {
        return Err(ProtocolError::invalid("method must not be empty"));
    }
    let params = match object.remove("params") {
        None | Some(Value::Null) => None,
        Some(p @ (Value::Object(_) | Value::Array(_))) => Some(p),
        Some(other) => {
            return Err(ProtocolError::InvalidParams {
                method,
                message: format!("params must be an object or array, got {}", kind(&other)),
            });
        }
    };

    match object.remove("id") {
        None => Ok(Incoming::Notification(Notification {
            jsonrpc: Version,
            method,
            params,
        })),
        Some(id) => {
            let id = request_id(id)?;
            Ok(Incoming::Request(Request {
                jsonrpc: Version,
                id,
                method,
                params,
            }))
        }
    }
}

fn response(mut object: Map<String, Value>) -> Result<Incoming, ProtocolError> {
    let id = match object.remove("id") {
        None => return Err(ProtocolError::invalid("message has neither method nor id")),
        Some(Value::Null) => None,
        Some(id) => Some(request_id(id)?),
    };

    let payload = match (object.remove("result"), object.remove("error")) {
        (Some(result), None) => ResponsePayload::Result(result),
        (None, Some(error)) => ResponsePayload::Error(error_object(error)?),
        (Some(_), Some(_)) => {
            return Err(ProtocolError::invalid(
                "response must not carry both result and error",
            ));
        }
        (None, None) => {
            return Err(ProtocolError::invalid(
                "response must carry result or error",
            ));
        }
    };

    if id.is_none() && matches!(payload, ResponsePayload::Result(_)) {
        return Err(ProtocolError::invalid("successful response requires an id"));
    }

    Ok(Incoming::Response(Response {
        jsonrpc: Version,
        id,
        payload,
    }))
}

fn request_id(id: Value) -> Result<RpcId, ProtocolError> {
    match id {
        Value::String(s) => Ok(RpcId::String(s)),
        Value::Number(n) => n
            .as_i64()
            .map(RpcId::Number)
            .ok_or_else(|| ProtocolError::invalid("numeric id must be an integer")),
        other => Err(ProtocolError::invalid(format!(
            "id must be a string or number, got {}",
            kind(&other)
        ))),
    }
}

fn error_object(error: Value) -> Result<ErrorObject, ProtocolError> {
    serde_json::from_value(error)
        .map_err(|e| ProtocolError::invalid(format!("malformed error member: {e}")))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Serialize an outbound message to a text frame.
pub fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
