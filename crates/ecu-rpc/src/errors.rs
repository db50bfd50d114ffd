//! Classification failures for inbound payloads.

use crate::codes;
use crate::types::{ErrorObject, Response};

/// Why an inbound payload is not a usable JSON-RPC message.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Not valid JSON.
    #[error("parse error: {message}")]
    Parse {
        /// Decoder message.
        message: String,
    },

    /// Valid JSON, but not a JSON-RPC 2.0 message.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What is wrong.
        message: String,
    },

    /// Well-formed call whose `params` member is not structured.
    #[error("invalid params for {method}: {message}")]
    InvalidParams {
        /// Method of the call.
        method: String,
        /// What is wrong.
        message: String,
    },
}

impl ProtocolError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// JSON-RPC error code for this failure.
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse { .. } => codes::PARSE_ERROR,
            Self::InvalidRequest { .. } => codes::INVALID_REQUEST,
            Self::InvalidParams { .. } => codes::INVALID_PARAMS,
        }
    }

    /// Wire error object.
    pub fn to_error_object(&self) -> ErrorObject {
        let message = match self {
            Self::Parse { .. } => "Parse error",
            Self::InvalidRequest { .. } => "Invalid Request",
            Self::InvalidParams { .. } => "Invalid params",
        };
        ErrorObject::new(self.code(), message).with_data(serde_json::Value::String(self.to_string()))
    }

    /// Error reply with a `null` id.
    pub fn to_response(&self) -> Response {
        Response::error(None, self.to_error_object())
    }
}
