//! Branded ID newtypes for type safety.
//!
//! [`EcuId`] is the stable external key a device announces itself with; it
//! is validated on construction so an empty or oversized key never reaches
//! the registry or the store. [`ConnectionId`] identifies one transport
//! connection and is generated as a UUID v7 (time-ordered).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::constants::MAX_ECU_ID_LEN;

/// Errors raised while validating identifiers and tags.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// The device ID was empty or whitespace only.
    #[error("ecu_id must not be empty")]
    Empty,
    /// The device ID exceeded the column width.
    #[error("ecu_id is {len} characters, maximum is {max}")]
    TooLong {
        /// Actual length in characters.
        len: usize,
        /// Permitted maximum.
        max: usize,
    },
    /// The protocol tag is not one the gateway knows.
    #[error("unknown protocol tag: {0}")]
    UnknownProtocol(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// EcuId
// ─────────────────────────────────────────────────────────────────────────────

/// Stable external key of a device (e.g. `test_bike_001`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EcuId(String);

impl EcuId {
    /// Validate and wrap a device ID.
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(IdError::Empty);
        }
        let len = raw.chars().count();
        if len > MAX_ECU_ID_LEN {
            return Err(IdError::TooLong {
                len,
                max: MAX_ECU_ID_LEN,
            });
        }
        Ok(Self(raw))
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume self and return the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl TryFrom<String> for EcuId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EcuId> for String {
    fn from(id: EcuId) -> Self {
        id.0
    }
}

impl FromStr for EcuId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::ops::Deref for EcuId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for EcuId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for EcuId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EcuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionId
// ─────────────────────────────────────────────────────────────────────────────

/// Identifier of a single transport connection (UUID v7).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a new time-ordered connection ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Protocol
// ─────────────────────────────────────────────────────────────────────────────

/// Transport a device is attached through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// WebSocket (`/ws/ecu`).
    Websocket,
    /// Modbus TCP bridge.
    Modbus,
    /// In-process device simulator.
    Simulator,
}

impl Protocol {
    /// The short tag stored in `ecu_connections.protocol`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Websocket => "websocket",
            Self::Modbus => "modbus",
            Self::Simulator => "simulator",
        }
    }
}

impl FromStr for Protocol {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "websocket" => Ok(Self::Websocket),
            "modbus" => Ok(Self::Modbus),
            "simulator" => Ok(Self::Simulator),
            other => Err(IdError::UnknownProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
