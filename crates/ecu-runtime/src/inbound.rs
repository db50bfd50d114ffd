//! Handling of requests and notifications initiated by devices.

use std::sync::Arc;

use async_trait::async_trait;
use ecu_core::EcuId;
use ecu_rpc::{ErrorObject, codes, methods};
use serde_json::{Value, json};

use crate::registry::SessionRegistry;

/// Collaborator that answers device-initiated calls. For requests the
/// returned value becomes the JSON-RPC response; for notifications it is
/// discarded.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle one call from `ecu_id`.
    async fn handle(
        &self,
        ecu_id: &EcuId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ErrorObject>;
}

/// Built-in handler: `heartbeat` and `status_update` count as liveness,
/// everything else is `MethodNotFound`.
pub struct DeviceInbound {
    registry: Arc<SessionRegistry>,
}

impl DeviceInbound {
    /// Handler bound to `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl InboundHandler for DeviceInbound {
    async fn handle(
        &self,
        ecu_id: &EcuId,
        method: &str,
        _params: Option<Value>,
    ) -> Result<Value, ErrorObject> {
        match method {
            methods::HEARTBEAT | methods::STATUS_UPDATE => self
                .registry
                .heartbeat(ecu_id)
                .map(|()| json!({"status": "ok"}))
                .map_err(|e| ErrorObject::new(codes::INVALID_STATE, e.to_string())),
            other => Err(ErrorObject::method_not_found(other)),
        }
    }
}
