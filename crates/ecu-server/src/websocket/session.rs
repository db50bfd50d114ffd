//! One device socket from upgrade through close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use ecu_core::{ConnectionId, EcuId, Protocol};
use ecu_rpc::codes;
use ecu_runtime::{PeerInfo, TransportListener};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::handshake::{Handshake, ack, parse_handshake, reject, reject_handshake};
use super::transport::{
    CLOSE_CAPACITY, CLOSE_GOING_AWAY, CLOSE_HANDSHAKE_FAILED, CLOSE_SUPERSEDED, Outbound,
    WsTransport,
};
use crate::config::ServerConfig;
use crate::errors::HandshakeError;
use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
    WS_FRAMES_RECEIVED_TOTAL, WS_FRAMES_SENT_TOTAL, WS_HANDSHAKE_FAILURES_TOTAL,
    WS_REJECTED_TOTAL,
};

/// Interval between server-initiated Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long cleanup waits for the writer to flush a close frame.
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// Everything a socket task needs from the server.
#[derive(Clone)]
pub struct SessionContext {
    /// Server tuning.
    pub config: Arc<ServerConfig>,
    /// Session core receiving lifecycle and message events.
    pub listener: Arc<dyn TransportListener>,
    /// Outbound routing table.
    pub transport: Arc<WsTransport>,
    /// Cancelled at server shutdown.
    pub shutdown: CancellationToken,
    active: Arc<watch::Sender<usize>>,
}

impl SessionContext {
    /// Context with no open sockets.
    pub fn new(
        config: Arc<ServerConfig>,
        listener: Arc<dyn TransportListener>,
        transport: Arc<WsTransport>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            listener,
            transport,
            shutdown,
            active: Arc::new(watch::Sender::new(0)),
        }
    }

    /// Open sockets, including ones still handshaking.
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Wait until every socket task has finished. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.active.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    fn enter(&self) -> ActiveGuard {
        let mut current = 0;
        self.active.send_modify(|n| {
            *n += 1;
            current = *n;
        });
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        ActiveGuard {
            active: Arc::clone(&self.active),
            current,
        }
    }
}

/// Decrements the open-socket count when the task ends.
struct ActiveGuard {
    active: Arc<watch::Sender<usize>>,
    current: usize,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Run a device socket.
///
/// 1. Reads and validates the handshake frame
/// 2. Registers the session and routes outbound frames to this socket
/// 3. Feeds every inbound text or binary frame to the session core
/// 4. Reports the close with the session epoch it opened
#[instrument(skip_all, fields(peer = %peer))]
pub async fn run_ws_session(ws: WebSocket, peer: SocketAddr, ctx: SessionContext) {
    let guard = ctx.enter();
    let (mut ws_tx, mut ws_rx) = ws.split();

    let handshake = match tokio::time::timeout(
        ctx.config.handshake_timeout,
        read_handshake(&mut ws_rx),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::TimedOut),
    };
    let handshake = match handshake {
        Ok(handshake) => handshake,
        Err(e) => {
            counter!(WS_HANDSHAKE_FAILURES_TOTAL, "reason" => failure_reason(&e)).increment(1);
            warn!(error = %e, "handshake refused");
            if e != HandshakeError::Closed {
                let reply = reject_handshake(&e).ok();
                refuse(&mut ws_tx, reply, CLOSE_HANDSHAKE_FAILED, "handshake failed").await;
            }
            return;
        }
    };

    if guard.current > ctx.config.max_connections {
        counter!(WS_REJECTED_TOTAL).increment(1);
        warn!(
            ecu_id = %handshake.ecu_id,
            limit = ctx.config.max_connections,
            "connection limit reached"
        );
        let reply = reject(codes::SERVICE_UNAVAILABLE, "connection limit reached").ok();
        refuse(&mut ws_tx, reply, CLOSE_CAPACITY, "connection limit reached").await;
        return;
    }

    let Handshake { ecu_id, port } = handshake;
    let peer_info = PeerInfo {
        ip_address: Some(peer.ip().to_string()),
        port: port.or(Some(peer.port())),
    };
    let record = match ctx
        .listener
        .on_connect(ecu_id.clone(), Protocol::Websocket, peer_info)
    {
        Ok(record) => record,
        Err(e) => {
            warn!(ecu_id = %ecu_id, error = %e, "session refused");
            let reply = reject(codes::SERVICE_UNAVAILABLE, &e.to_string()).ok();
            refuse(&mut ws_tx, reply, CLOSE_GOING_AWAY, "session refused").await;
            return;
        }
    };
    let epoch = record.session_epoch;

    let connection_id = ConnectionId::new();
    let (tx, rx) = mpsc::channel(ctx.config.send_queue);
    if !ctx
        .transport
        .bind(ecu_id.clone(), connection_id.clone(), epoch, tx.clone())
    {
        // A later handshake for this device bound first and owns the session.
        counter!(WS_REJECTED_TOTAL).increment(1);
        info!(ecu_id = %ecu_id, epoch, "socket superseded before it was bound");
        refuse(&mut ws_tx, None, CLOSE_SUPERSEDED, "superseded by a newer connection").await;
        return;
    }

    let connection_start = std::time::Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    info!(ecu_id = %ecu_id, connection_id = %connection_id, epoch, "device connected");

    match ack(&ecu_id) {
        Ok(text) => {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                debug!(ecu_id = %ecu_id, "socket closed before acknowledgement");
            }
        }
        Err(e) => warn!(ecu_id = %ecu_id, error = %e, "failed to encode acknowledgement"),
    }

    let writer_done = CancellationToken::new();
    let writer = tokio::spawn(write_loop(ws_tx, rx, writer_done.clone()));

    read_loop(&ctx, &ecu_id, &mut ws_rx, &tx, &writer_done).await;

    // Cleanup: unroute first so no new frames target this socket.
    let _ = ctx.transport.unbind(&ecu_id, &connection_id);
    drop(tx);
    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_GRACE, writer).await.is_err() {
        abort.abort();
    }
    ctx.listener.on_close(&ecu_id, epoch).await;

    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    histogram!("ecu_ws_connection_duration_seconds")
        .record(connection_start.elapsed().as_secs_f64());
    info!(ecu_id = %ecu_id, connection_id = %connection_id, epoch, "device disconnected");
    drop(guard);
}

async fn read_handshake(ws_rx: &mut WsStream) -> Result<Handshake, HandshakeError> {
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => return parse_handshake(text.as_str()),
            Some(Ok(Message::Binary(_))) => return Err(HandshakeError::NotText),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_)) | Err(_)) | None => return Err(HandshakeError::Closed),
        }
    }
}

fn failure_reason(e: &HandshakeError) -> &'static str {
    match e {
        HandshakeError::NotAnObject | HandshakeError::NotText => "malformed",
        HandshakeError::InvalidEcuId(_) => "invalid_ecu_id",
        HandshakeError::InvalidPort => "invalid_port",
        HandshakeError::TimedOut => "timeout",
        HandshakeError::Closed => "closed",
    }
}

async fn refuse(ws_tx: &mut WsSink, reply: Option<String>, code: u16, reason: &str) {
    if let Some(text) = reply {
        let _ = ws_tx.send(Message::Text(text.into())).await;
    }
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn write_loop(mut ws_tx: WsSink, mut rx: mpsc::Receiver<Outbound>, done: CancellationToken) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // skip the immediate first tick
    let _ = ping_interval.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(Outbound::Text(text)) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                    counter!(WS_FRAMES_SENT_TOTAL).increment(1);
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            },
            _ = ping_interval.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    done.cancel();
}

async fn read_loop(
    ctx: &SessionContext,
    ecu_id: &EcuId,
    ws_rx: &mut WsStream,
    tx: &mpsc::Sender<Outbound>,
    writer_done: &CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            () = ctx.shutdown.cancelled() => {
                let _ = tx.try_send(Outbound::Close {
                    code: CLOSE_GOING_AWAY,
                    reason: "server shutting down".into(),
                });
                return;
            }
            () = writer_done.cancelled() => return,
            msg = ws_rx.next() => msg,
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                debug!(
                    ecu_id = %ecu_id,
                    code = frame.as_ref().map(|f| f.code),
                    "device sent close frame"
                );
                return;
            }
            Some(Err(e)) => {
                debug!(ecu_id = %ecu_id, error = %e, "socket error");
                return;
            }
            None => return,
        };
        counter!(WS_FRAMES_RECEIVED_TOTAL).increment(1);
        ctx.listener.on_message(ecu_id, &text).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reasons_are_labels() {
        assert_eq!(failure_reason(&HandshakeError::TimedOut), "timeout");
        assert_eq!(failure_reason(&HandshakeError::NotText), "malformed");
        assert_eq!(
            failure_reason(&HandshakeError::InvalidEcuId(String::new())),
            "invalid_ecu_id"
        );
    }
}
