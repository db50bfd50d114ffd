//! # ecu-rpc
//!
//! JSON-RPC 2.0 as spoken between the gateway and ECU devices.
//!
//! - **Wire types**: [`Request`], [`Notification`], [`Response`], [`ErrorObject`]
//! - **Classification**: [`decode`] sorts a text frame into [`Incoming`] or
//!   a [`ProtocolError`] with the matching error code
//! - **Codes**: standard and device-level error codes in [`codes`]
//! - **Methods**: device method names in [`methods`]

#![deny(unsafe_code)]

pub mod codec;
pub mod codes;
pub mod errors;
pub mod methods;
pub mod types;

pub use codec::{classify, decode, encode};
pub use errors::ProtocolError;
pub use types::{
    ErrorObject, Incoming, Notification, Request, Response, ResponsePayload, RpcId, Version,
};
