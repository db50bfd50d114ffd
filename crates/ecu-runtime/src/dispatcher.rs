//! JSON-RPC command dispatcher.
//!
//! Outbound requests get a gateway-unique integer id and a pending entry
//! holding a oneshot sender. Exactly one of response, timeout and cancel
//! resolves a request: whichever removes the pending entry first wins, and
//! the others find nothing to remove.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ecu_core::EcuId;
use ecu_events::{
    ActionData, ActionLogEntry, ActionLogPipeline, CommandData, ErrorData, ErrorKind,
};
use ecu_rpc::{
    ErrorObject, Incoming, Notification, ProtocolError, Request, Response, RpcId, decode, encode,
};
use ecu_settings::DispatcherSettings;
use metrics::{counter, gauge, histogram};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::errors::DispatchError;
use crate::inbound::{DeviceInbound, InboundHandler};
use crate::registry::SessionRegistry;
use crate::transport::Transport;

/// Dispatcher tuning.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Deadline for `send` calls that do not pass one.
    pub default_timeout: Duration,
}

impl DispatcherConfig {
    /// Build from the `dispatcher` settings section.
    pub fn from_settings(settings: &DispatcherSettings) -> Self {
        Self {
            default_timeout: settings.default_timeout(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_settings(&DispatcherSettings::default())
    }
}

#[derive(Debug)]
enum Outcome {
    Response(Result<Value, ErrorObject>),
    Cancelled,
}

struct PendingRequest {
    ecu_id: EcuId,
    method: String,
    issued: Instant,
    tx: oneshot::Sender<Outcome>,
}

/// View of one outstanding request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingSummary {
    /// Request id.
    pub request_id: RpcId,
    /// Target device.
    pub ecu_id: EcuId,
    /// Method invoked.
    pub method: String,
    /// Time since dispatch.
    pub age: Duration,
}

/// Removes the pending entry when `send` returns or its future is dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<RpcId, PendingRequest>,
    request_id: RpcId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.pending.remove(&self.request_id).is_some() {
            gauge!("ecu_commands_pending").decrement(1.0);
        }
    }
}

/// Correlates outbound requests with device responses and routes
/// device-initiated messages.
pub struct CommandDispatcher {
    config: DispatcherConfig,
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    inbound: Arc<dyn InboundHandler>,
    pending: DashMap<RpcId, PendingRequest>,
    next_id: AtomicI64,
}

impl CommandDispatcher {
    /// Dispatcher with the built-in [`DeviceInbound`] handler.
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let inbound = Arc::new(DeviceInbound::new(Arc::clone(&registry)));
        Self {
            config,
            registry,
            transport,
            inbound,
            pending: DashMap::new(),
            next_id: AtomicI64::new(0),
        }
    }

    /// Replace the handler for device-initiated calls.
    #[must_use]
    pub fn with_inbound_handler(mut self, handler: Arc<dyn InboundHandler>) -> Self {
        self.inbound = handler;
        self
    }

    /// Dispatcher tuning.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn pipeline(&self) -> &ActionLogPipeline {
        self.registry.pipeline()
    }

    fn allocate_id(&self) -> RpcId {
        RpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    // ── outbound ────────────────────────────────────────────────────

    /// Send `method` to a connected device and wait for its response.
    ///
    /// Fails with `NotConnected` before sending when the device has no
    /// Connected session, with `Timeout` when no response arrives within
    /// `timeout` (or the configured default), with `Cancelled` when the
    /// request is cancelled first, and with `Remote` when the device
    /// answers with an error.
    #[instrument(skip(self, params, timeout), fields(ecu_id = %ecu_id, method = %method))]
    pub async fn send(
        &self,
        ecu_id: &EcuId,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, DispatchError> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        if !self.registry.is_connected(ecu_id) {
            let err = DispatchError::NotConnected {
                ecu_id: ecu_id.clone(),
            };
            self.log_failure(ecu_id, method, None, &err, None);
            return Err(err);
        }

        let request_id = self.allocate_id();
        let (tx, mut rx) = oneshot::channel();
        match self.pending.entry(request_id.clone()) {
            Entry::Occupied(_) => {
                let err = DispatchError::DuplicateId {
                    request_id: request_id.clone(),
                };
                self.log_failure(ecu_id, method, Some(&request_id), &err, None);
                return Err(err);
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(PendingRequest {
                    ecu_id: ecu_id.clone(),
                    method: method.to_owned(),
                    issued: Instant::now(),
                    tx,
                });
            }
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id: request_id.clone(),
        };
        gauge!("ecu_commands_pending").increment(1.0);
        counter!("ecu_commands_total", "method" => method.to_owned()).increment(1);

        self.emit(ActionLogEntry::new(
            ecu_id.clone(),
            ActionData::Command(CommandData {
                request_id: Some(request_id.to_string()),
                method: method.to_owned(),
                params: params.clone(),
                timestamp: Utc::now(),
            }),
        ));

        let text = encode(&Request::new(request_id.clone(), method, Some(params)))?;
        if let Err(e) = self.transport.send(ecu_id, text).await {
            let err = DispatchError::Transport(e);
            if self.pending.remove(&request_id).is_some() {
                gauge!("ecu_commands_pending").decrement(1.0);
                self.log_failure(ecu_id, method, Some(&request_id), &err, None);
            }
            return Err(err);
        }

        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(received) => received.unwrap_or(Outcome::Cancelled),
            Err(_) => {
                if self.pending.remove(&request_id).is_some() {
                    gauge!("ecu_commands_pending").decrement(1.0);
                    counter!("ecu_command_timeouts_total").increment(1);
                    let err = DispatchError::Timeout {
                        ecu_id: ecu_id.clone(),
                        method: method.to_owned(),
                        request_id: request_id.clone(),
                        timeout,
                    };
                    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                    warn!(request_id = %request_id, timeout_ms, "command timed out");
                    self.log_failure(
                        ecu_id,
                        method,
                        Some(&request_id),
                        &err,
                        Some(json!({"status": "timeout", "timeout_ms": timeout_ms})),
                    );
                    return Err(err);
                }
                // A response or cancel removed the entry first; its value is
                // already on the channel.
                rx.await.unwrap_or(Outcome::Cancelled)
            }
        };

        match outcome {
            Outcome::Response(Ok(value)) => Ok(value),
            Outcome::Response(Err(error)) => Err(DispatchError::Remote(error)),
            Outcome::Cancelled => Err(DispatchError::Cancelled { request_id }),
        }
    }

    /// Send a notification. No id is allocated and nothing is awaited.
    #[instrument(skip(self, params), fields(ecu_id = %ecu_id, method = %method))]
    pub async fn notify(
        &self,
        ecu_id: &EcuId,
        method: &str,
        params: Value,
    ) -> Result<(), DispatchError> {
        if !self.registry.is_connected(ecu_id) {
            let err = DispatchError::NotConnected {
                ecu_id: ecu_id.clone(),
            };
            self.log_failure(ecu_id, method, None, &err, None);
            return Err(err);
        }
        let text = encode(&Notification::new(method, Some(params.clone())))?;
        self.emit(ActionLogEntry::new(
            ecu_id.clone(),
            ActionData::Command(CommandData {
                request_id: None,
                method: method.to_owned(),
                params,
                timestamp: Utc::now(),
            }),
        ));
        counter!("ecu_notifications_total", "method" => method.to_owned()).increment(1);
        if let Err(e) = self.transport.send(ecu_id, text).await {
            let err = DispatchError::Transport(e);
            self.log_failure(ecu_id, method, None, &err, None);
            return Err(err);
        }
        Ok(())
    }

    // ── inbound ─────────────────────────────────────────────────────

    /// Process one text frame received from `ecu_id`.
    #[instrument(skip(self, raw), fields(ecu_id = %ecu_id, bytes = raw.len()))]
    pub async fn on_message(&self, ecu_id: &EcuId, raw: &str) {
        counter!("ecu_messages_received_total").increment(1);
        match decode(raw) {
            Err(e) => self.reject(ecu_id, &e).await,
            Ok(Incoming::Response(response)) => self.resolve(ecu_id, response),
            Ok(Incoming::Request(request)) => {
                let reply = match self
                    .inbound
                    .handle(ecu_id, &request.method, request.params)
                    .await
                {
                    Ok(result) => Response::success(request.id, result),
                    Err(error) => {
                        debug!(method = %request.method, code = error.code, "device request refused");
                        Response::error(Some(request.id), error)
                    }
                };
                self.reply(ecu_id, &reply).await;
            }
            Ok(Incoming::Notification(note)) => {
                if let Err(error) = self.inbound.handle(ecu_id, &note.method, note.params).await {
                    debug!(method = %note.method, code = error.code, "device notification ignored");
                }
            }
        }
    }

    fn resolve(&self, ecu_id: &EcuId, response: Response) {
        let Some(request_id) = response.id.clone() else {
            let error = response.into_result().err();
            warn!(?error, "device reported an error without a request id");
            self.emit(ActionLogEntry::new(
                ecu_id.clone(),
                ActionData::Error(ErrorData {
                    kind: ErrorKind::Protocol,
                    code: error.as_ref().map(|e| e.code),
                    message: error.map_or_else(
                        || "response without id".to_owned(),
                        |e| e.message,
                    ),
                    request_id: None,
                    method: None,
                }),
            ));
            return;
        };

        let Some((_, pending)) = self
            .pending
            .remove_if(&request_id, |_, p| p.ecu_id == *ecu_id)
        else {
            self.unmatched(ecu_id, &request_id);
            return;
        };
        gauge!("ecu_commands_pending").decrement(1.0);
        histogram!("ecu_command_latency_seconds").record(pending.issued.elapsed().as_secs_f64());

        let outcome = response.into_result();
        let result = match &outcome {
            Ok(data) => json!({"status": "success", "data": data}),
            Err(error) => json!({"status": "error", "error": error}),
        };
        self.emit(
            ActionLogEntry::new(
                ecu_id.clone(),
                ActionData::Command(CommandData {
                    request_id: Some(request_id.to_string()),
                    method: pending.method,
                    params: Value::Null,
                    timestamp: Utc::now(),
                }),
            )
            .with_result(result),
        );
        // The caller may have been dropped; nothing to deliver to then.
        let _ = pending.tx.send(Outcome::Response(outcome));
    }

    fn unmatched(&self, ecu_id: &EcuId, request_id: &RpcId) {
        let owner = self.pending.get(request_id).map(|p| p.ecu_id.clone());
        match owner {
            Some(owner) => {
                warn!(request_id = %request_id, owner = %owner, "response from wrong device dropped");
                counter!("ecu_protocol_errors_total", "kind" => "foreign_response").increment(1);
                self.emit(ActionLogEntry::new(
                    ecu_id.clone(),
                    ActionData::Error(ErrorData {
                        kind: ErrorKind::Protocol,
                        code: None,
                        message: format!("response for request {request_id} owned by {owner}"),
                        request_id: Some(request_id.to_string()),
                        method: None,
                    }),
                ));
            }
            None => {
                debug!(request_id = %request_id, "late or unknown response dropped");
                counter!("ecu_responses_unmatched_total").increment(1);
            }
        }
    }

    async fn reject(&self, ecu_id: &EcuId, error: &ProtocolError) {
        warn!(code = error.code(), %error, "malformed message");
        counter!("ecu_protocol_errors_total", "kind" => "malformed").increment(1);
        let method = match error {
            ProtocolError::InvalidParams { method, .. } => Some(method.clone()),
            ProtocolError::Parse { .. } | ProtocolError::InvalidRequest { .. } => None,
        };
        self.emit(ActionLogEntry::new(
            ecu_id.clone(),
            ActionData::Error(ErrorData {
                kind: ErrorKind::Protocol,
                code: Some(error.code()),
                message: error.to_string(),
                request_id: None,
                method,
            }),
        ));
        self.reply(ecu_id, &error.to_response()).await;
    }

    async fn reply(&self, ecu_id: &EcuId, response: &Response) {
        let text = match encode(response) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode reply");
                return;
            }
        };
        if let Err(e) = self.transport.send(ecu_id, text).await {
            debug!(error = %e, "reply not delivered");
        }
    }

    // ── cancellation ────────────────────────────────────────────────

    /// Cancel one outstanding request. Returns `false` when it was already
    /// resolved, timed out or never existed.
    pub fn cancel(&self, request_id: &RpcId) -> bool {
        let Some((request_id, pending)) = self.pending.remove(request_id) else {
            return false;
        };
        gauge!("ecu_commands_pending").decrement(1.0);
        counter!("ecu_commands_cancelled_total").increment(1);
        debug!(request_id = %request_id, ecu_id = %pending.ecu_id, "command cancelled");
        self.emit(
            ActionLogEntry::new(
                pending.ecu_id,
                ActionData::Command(CommandData {
                    request_id: Some(request_id.to_string()),
                    method: pending.method,
                    params: Value::Null,
                    timestamp: Utc::now(),
                }),
            )
            .with_result(json!({"status": "cancelled"})),
        );
        let _ = pending.tx.send(Outcome::Cancelled);
        true
    }

    /// Cancel every outstanding request to `ecu_id`.
    pub fn cancel_device(&self, ecu_id: &EcuId) -> usize {
        let ids: Vec<RpcId> = self
            .pending
            .iter()
            .filter(|entry| entry.ecu_id == *ecu_id)
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// Cancel every outstanding request.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<RpcId> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    // ── queries ─────────────────────────────────────────────────────

    /// Number of outstanding requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Outstanding requests, oldest first.
    pub fn pending(&self) -> Vec<PendingSummary> {
        let mut out: Vec<_> = self
            .pending
            .iter()
            .map(|entry| PendingSummary {
                request_id: entry.key().clone(),
                ecu_id: entry.ecu_id.clone(),
                method: entry.method.clone(),
                age: entry.issued.elapsed(),
            })
            .collect();
        out.sort_by(|a, b| b.age.cmp(&a.age));
        out
    }

    // ── logging ─────────────────────────────────────────────────────

    fn log_failure(
        &self,
        ecu_id: &EcuId,
        method: &str,
        request_id: Option<&RpcId>,
        err: &DispatchError,
        result: Option<Value>,
    ) {
        let kind = match err {
            DispatchError::Transport(_) => ErrorKind::Transport,
            _ => ErrorKind::Dispatch,
        };
        let entry = ActionLogEntry::new(
            ecu_id.clone(),
            ActionData::Error(ErrorData {
                kind,
                code: Some(err.code()),
                message: err.to_string(),
                request_id: request_id.map(ToString::to_string),
                method: Some(method.to_owned()),
            }),
        );
        self.emit(match result {
            Some(result) => entry.with_result(result),
            None => entry,
        });
    }

    fn emit(&self, entry: ActionLogEntry) {
        let _ = self.pipeline().record(entry);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use ecu_core::Protocol;
    use ecu_events::{ActionType, MemoryStore, PipelineConfig};
    use ecu_rpc::codes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::errors::TransportError;
    use crate::registry::RegistryConfig;
    use crate::transport::PeerInfo;

    struct ChannelTransport(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&self, ecu_id: &EcuId, text: String) -> Result<(), TransportError> {
            self.0
                .send(text)
                .map_err(|_| TransportError::Closed(ecu_id.clone()))
        }
    }

    impl CommandDispatcher {
        fn rewind_ids(&self, next: i64) {
            self.next_id.store(next, Ordering::Relaxed);
        }
    }

    fn make_dispatcher() -> (
        Arc<MemoryStore>,
        Arc<CommandDispatcher>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Arc::new(ActionLogPipeline::spawn(
            PipelineConfig::default(),
            store.clone(),
            store.clone(),
        ));
        let registry = Arc::new(SessionRegistry::new(RegistryConfig::default(), pipeline));
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = CommandDispatcher::new(
            DispatcherConfig::default(),
            registry,
            Arc::new(ChannelTransport(tx)),
        );
        (store, Arc::new(dispatcher), rx)
    }

    #[tokio::test]
    async fn colliding_request_id_is_refused_and_logged() {
        let (store, dispatcher, mut frames) = make_dispatcher();
        let gate = EcuId::parse("test_gate_001").unwrap();
        let _ = dispatcher
            .registry
            .register(gate.clone(), Protocol::Websocket, PeerInfo::default())
            .unwrap();

        let first = {
            let dispatcher = Arc::clone(&dispatcher);
            let gate = gate.clone();
            tokio::spawn(async move { dispatcher.send(&gate, "ping", json!({}), None).await })
        };
        let _ = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dispatcher.pending_count(), 1);

        dispatcher.rewind_ids(0);
        let err = dispatcher
            .send(&gate, "get_status", json!({}), None)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            DispatchError::DuplicateId { ref request_id } if *request_id == RpcId::Number(1)
        );
        assert_eq!(err.code(), codes::INTERNAL_ERROR);
        // nothing sent, the original request still outstanding
        assert!(frames.try_recv().is_err());
        assert_eq!(dispatcher.pending_count(), 1);

        let _ = dispatcher.pipeline().flush_and_wait().await;
        let entries = store.entries_for("test_gate_001");
        let last = entries.last().unwrap();
        assert_eq!(last.action_type(), ActionType::Error);
        assert_matches!(
            &last.action,
            ActionData::Error(e) if e.kind == ErrorKind::Dispatch
                && e.code == Some(codes::INTERNAL_ERROR)
                && e.method.as_deref() == Some("get_status")
        );

        assert!(dispatcher.cancel(&RpcId::Number(1)));
        assert_matches!(first.await.unwrap(), Err(DispatchError::Cancelled { .. }));
    }
}
