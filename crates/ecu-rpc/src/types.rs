//! JSON-RPC 2.0 wire types exchanged with devices.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codes;

/// The `"jsonrpc": "2.0"` marker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Version;

/// Protocol version string.
pub const VERSION: &str = "2.0";

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(VERSION)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == VERSION {
            Ok(Self)
        } else {
            Err(de::Error::custom(format!("unsupported jsonrpc version {raw:?}")))
        }
    }
}

/// Request identifier: a JSON number or string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    /// Integer id (what the gateway allocates).
    Number(i64),
    /// String id (what some device firmware uses).
    String(String),
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RpcId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RpcId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

/// A call that expects a response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Always `2.0`.
    pub jsonrpc: Version,
    /// Correlation id.
    pub id: RpcId,
    /// Method name.
    pub method: String,
    /// Structured parameters (object or array).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Build a request.
    pub fn new(id: impl Into<RpcId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A call without an id; no response is sent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Always `2.0`.
    pub jsonrpc: Version,
    /// Method name.
    pub method: String,
    /// Structured parameters (object or array).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    /// Build a notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            method: method.into(),
            params,
        }
    }
}

/// Error member of a failed response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct ErrorObject {
    /// Numeric error code (see [`codes`]).
    pub code: i64,
    /// Short description.
    pub message: String,
    /// Additional detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Error with no `data`.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `-32601` for `method`.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// `-32603` with a message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }
}

/// Success or error member of a response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Call succeeded.
    #[serde(rename = "result")]
    Result(Value),
    /// Call failed.
    #[serde(rename = "error")]
    Error(ErrorObject),
}

/// Reply to a [`Request`]. `id` is `null` when the request could not be
/// identified.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Always `2.0`.
    pub jsonrpc: Version,
    /// Id of the request being answered.
    pub id: Option<RpcId>,
    /// `result` or `error`.
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl Response {
    /// Successful reply.
    pub fn success(id: impl Into<RpcId>, result: Value) -> Self {
        Self {
            jsonrpc: Version,
            id: Some(id.into()),
            payload: ResponsePayload::Result(result),
        }
    }

    /// Failed reply.
    pub fn error(id: Option<RpcId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: Version,
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    /// Whether the call succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self.payload, ResponsePayload::Result(_))
    }

    /// Split into the outcome.
    pub fn into_result(self) -> Result<Value, ErrorObject> {
        match self.payload {
            ResponsePayload::Result(value) => Ok(value),
            ResponsePayload::Error(error) => Err(error),
        }
    }
}

/// Any classified inbound message.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    /// Device call expecting a reply.
    Request(Request),
    /// Device call without a reply.
    Notification(Notification),
    /// Reply to a gateway request.
    Response(Response),
}

impl Incoming {
    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── serialization ───────────────────────────────────────────────

    #[test]
    fn request_wire_shape() {
        let req = Request::new(7, "ping", Some(json!({})));
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v, json!({"jsonrpc": "2.0", "id": 7, "method": "ping", "params": {}}));
    }

    #[test]
    fn notification_has_no_id() {
        let note = Notification::new("heartbeat", None);
        let v = serde_json::to_value(&note).unwrap();
        assert_eq!(v, json!({"jsonrpc": "2.0", "method": "heartbeat"}));
    }

    #[test]
    fn success_response_wire_shape() {
        let resp = Response::success(3, json!({"pong": true}));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v, json!({"jsonrpc": "2.0", "id": 3, "result": {"pong": true}}));
    }

    #[test]
    fn error_response_serializes_null_id() {
        let resp = Response::error(None, ErrorObject::new(codes::PARSE_ERROR, "Parse error"));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            v,
            json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "Parse error"}})
        );
    }

    #[test]
    fn error_data_is_kept() {
        let err = ErrorObject::new(codes::DEVICE_BUSY, "busy").with_data(json!({"retry_after": 5}));
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["data"]["retry_after"], 5);
    }

    // ── deserialization ─────────────────────────────────────────────

    #[test]
    fn response_from_wire() {
        let resp: Response =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"req_1","result":{"status":"ok"}}"#)
                .unwrap();
        assert_eq!(resp.id, Some(RpcId::from("req_1")));
        assert_eq!(resp.into_result().unwrap()["status"], "ok");
    }

    #[test]
    fn wrong_version_rejected() {
        let bad = serde_json::from_str::<Notification>(r#"{"jsonrpc":"1.0","method":"x"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn id_display() {
        assert_eq!(RpcId::Number(42).to_string(), "42");
        assert_eq!(RpcId::from("abc").to_string(), "abc");
    }
}
