//! Device handshake: the first frame on a new socket names the device.
//!
//! ```json
//! {"ecu_id": "gate_001", "port": 5020}
//! ```
//!
//! The server answers with a `connected` acknowledgement or a JSON-RPC
//! error carrying `id: null`, then closes.

use chrono::Utc;
use ecu_core::EcuId;
use ecu_rpc::{ErrorObject, Response, ResponsePayload, Version, codes, encode};
use serde_json::{Value, json};

use crate::errors::HandshakeError;

/// A validated handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// Device identity.
    pub ecu_id: EcuId,
    /// Port the device reports listening on, if any.
    pub port: Option<u16>,
}

/// Validate the first frame.
pub fn parse_handshake(text: &str) -> Result<Handshake, HandshakeError> {
    let value: Value = serde_json::from_str(text).map_err(|_| HandshakeError::NotAnObject)?;
    let Value::Object(fields) = value else {
        return Err(HandshakeError::NotAnObject);
    };

    let raw_id = match fields.get("ecu_id") {
        Some(Value::String(s)) => s.trim(),
        Some(_) => return Err(HandshakeError::InvalidEcuId("ecu_id must be a string".into())),
        None => return Err(HandshakeError::InvalidEcuId("ecu_id is required".into())),
    };
    let ecu_id = EcuId::parse(raw_id).map_err(|e| HandshakeError::InvalidEcuId(e.to_string()))?;

    let port = match fields.get("port") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or(HandshakeError::InvalidPort)?,
        ),
    };
    Ok(Handshake { ecu_id, port })
}

/// Acknowledgement sent once the session is registered.
pub fn ack(ecu_id: &EcuId) -> Result<String, serde_json::Error> {
    encode(&Response {
        jsonrpc: Version,
        id: None,
        payload: ResponsePayload::Result(json!({
            "status": "connected",
            "ecu_id": ecu_id,
            "server_time": Utc::now().to_rfc3339(),
        })),
    })
}

/// Error reply with `id: null`.
pub fn reject(code: i64, message: &str) -> Result<String, serde_json::Error> {
    encode(&Response::error(None, ErrorObject::new(code, message)))
}

/// Error reply for a refused handshake.
pub fn reject_handshake(err: &HandshakeError) -> Result<String, serde_json::Error> {
    reject(codes::INVALID_REQUEST, &err.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn accepts_id_and_port() {
        let hs = parse_handshake(r#"{"ecu_id":"gate_001","port":5020}"#).unwrap();
        assert_eq!(hs.ecu_id.as_str(), "gate_001");
        assert_eq!(hs.port, Some(5020));
    }

    #[test]
    fn port_is_optional() {
        let hs = parse_handshake(r#"{"ecu_id":"bike_001","firmware":"2.1"}"#).unwrap();
        assert_eq!(hs.port, None);
    }

    #[test]
    fn rejects_non_objects() {
        assert_matches!(parse_handshake("not json"), Err(HandshakeError::NotAnObject));
        assert_matches!(parse_handshake("[1,2]"), Err(HandshakeError::NotAnObject));
    }

    #[test]
    fn rejects_missing_or_empty_id() {
        assert_matches!(parse_handshake("{}"), Err(HandshakeError::InvalidEcuId(_)));
        assert_matches!(
            parse_handshake(r#"{"ecu_id":"  "}"#),
            Err(HandshakeError::InvalidEcuId(_))
        );
        assert_matches!(
            parse_handshake(r#"{"ecu_id":42}"#),
            Err(HandshakeError::InvalidEcuId(_))
        );
    }

    #[test]
    fn rejects_bad_port() {
        assert_matches!(
            parse_handshake(r#"{"ecu_id":"gate_001","port":70000}"#),
            Err(HandshakeError::InvalidPort)
        );
        assert_matches!(
            parse_handshake(r#"{"ecu_id":"gate_001","port":"80"}"#),
            Err(HandshakeError::InvalidPort)
        );
    }

    #[test]
    fn ack_shape() {
        let ecu_id = EcuId::parse("gate_001").unwrap();
        let v: Value = serde_json::from_str(&ack(&ecu_id).unwrap()).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert!(v["id"].is_null());
        assert_eq!(v["result"]["status"], "connected");
        assert_eq!(v["result"]["ecu_id"], "gate_001");
        assert!(v["result"]["server_time"].is_string());
    }

    #[test]
    fn reject_shape() {
        let text = reject_handshake(&HandshakeError::NotAnObject).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert!(v["id"].is_null());
        assert_eq!(v["error"]["code"], -32600);
    }
}
