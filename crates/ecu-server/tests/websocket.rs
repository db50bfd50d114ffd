//! End-to-end tests with a real WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use ecu_core::EcuId;
use ecu_events::{ActionType, ConnectionStatus, MemoryStore};
use ecu_runtime::{Gateway, HeartbeatConfig, RuntimeConfig};
use ecu_server::{EcuServer, ServerConfig, WsTransport};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct Harness {
    url: String,
    server: EcuServer,
    gateway: Arc<Gateway>,
    store: Arc<MemoryStore>,
    handle: JoinHandle<()>,
}

async fn boot(config: ServerConfig) -> Harness {
    boot_with(config, RuntimeConfig::default()).await
}

async fn boot_with(config: ServerConfig, runtime: RuntimeConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(WsTransport::new(config.max_message_bytes));
    let gateway = Gateway::start(
        runtime,
        store.clone(),
        store.clone(),
        transport.clone(),
    );
    let ws_path = config.ws_path.clone();
    let server = EcuServer::new(config, gateway.clone(), transport, None);
    let (addr, handle) = server.listen().await.unwrap();
    Harness {
        url: format!("ws://{addr}{ws_path}"),
        server,
        gateway,
        store,
        handle,
    }
}

fn ecu(id: &str) -> EcuId {
    EcuId::parse(id).unwrap()
}

/// Next JSON text frame, skipping pings.
async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("socket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

/// Next close frame code, skipping everything else.
async fn next_close_code(ws: &mut WsStream) -> Option<u16> {
    loop {
        match timeout(TIMEOUT, ws.next()).await.expect("timed out waiting for close") {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return None,
        }
    }
}

async fn open(url: &str) -> WsStream {
    let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    ws
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Open a socket and complete the handshake.
async fn connect_device(url: &str, ecu_id: &str) -> WsStream {
    let mut ws = open(url).await;
    send_json(&mut ws, json!({"ecu_id": ecu_id, "port": 5020})).await;
    let ack = next_json(&mut ws).await;
    assert_eq!(ack["result"]["status"], "connected", "{ack}");
    ws
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

// ── Handshake ──

#[tokio::test]
async fn handshake_registers_session() {
    let h = boot(ServerConfig::default()).await;
    let mut ws = open(&h.url).await;
    send_json(&mut ws, json!({"ecu_id": "test_gate_001", "port": 5020})).await;

    let ack = next_json(&mut ws).await;
    assert_eq!(ack["jsonrpc"], "2.0");
    assert!(ack["id"].is_null());
    assert_eq!(ack["result"]["ecu_id"], "test_gate_001");
    assert!(ack["result"]["server_time"].is_string());

    let record = h.gateway.registry().get(&ecu("test_gate_001")).unwrap();
    assert_eq!(record.status, ConnectionStatus::Connected);
    assert_eq!(record.port, Some(5020));
    assert_eq!(record.ip_address.as_deref(), Some("127.0.0.1"));
    assert_eq!(h.server.transport().connection_count(), 1);
}

#[tokio::test]
async fn malformed_handshake_is_refused() {
    let h = boot(ServerConfig::default()).await;
    let mut ws = open(&h.url).await;
    ws.send(Message::Text("hello".into())).await.unwrap();

    let reply = next_json(&mut ws).await;
    assert!(reply["id"].is_null());
    assert_eq!(reply["error"]["code"], -32600);
    assert_eq!(next_close_code(&mut ws).await, Some(4001));
    assert_eq!(h.gateway.registry().counts().total(), 0);
}

#[tokio::test]
async fn handshake_without_ecu_id_is_refused() {
    let h = boot(ServerConfig::default()).await;
    let mut ws = open(&h.url).await;
    send_json(&mut ws, json!({"port": 5020})).await;

    let reply = next_json(&mut ws).await;
    assert_eq!(reply["error"]["code"], -32600);
    assert_eq!(next_close_code(&mut ws).await, Some(4001));
}

#[tokio::test]
async fn silent_socket_times_out_handshake() {
    let h = boot(ServerConfig {
        handshake_timeout: Duration::from_millis(100),
        ..ServerConfig::default()
    })
    .await;
    let mut ws = open(&h.url).await;

    let reply = next_json(&mut ws).await;
    assert_eq!(reply["error"]["code"], -32600);
    assert_eq!(next_close_code(&mut ws).await, Some(4001));
}

#[tokio::test]
async fn connection_limit_refuses_extra_devices() {
    let h = boot(ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    })
    .await;
    let _first = connect_device(&h.url, "test_gate_001").await;

    let mut second = open(&h.url).await;
    send_json(&mut second, json!({"ecu_id": "test_gate_002"})).await;
    let reply = next_json(&mut second).await;
    assert_eq!(reply["error"]["code"], -32103);
    assert_eq!(next_close_code(&mut second).await, Some(4002));
    assert!(h.gateway.registry().get(&ecu("test_gate_002")).is_none());
}

// ── Commands ──

#[tokio::test]
async fn command_round_trip() {
    let h = boot(ServerConfig::default()).await;
    let mut ws = connect_device(&h.url, "test_gate_001").await;

    let dispatcher = h.gateway.dispatcher().clone();
    let call = tokio::spawn(async move {
        dispatcher
            .send(&ecu("test_gate_001"), "ping", json!({}), None)
            .await
    });

    let request = next_json(&mut ws).await;
    assert_eq!(request["method"], "ping");
    send_json(
        &mut ws,
        json!({"jsonrpc": "2.0", "id": request["id"], "result": {"pong": true}}),
    )
    .await;

    let result = timeout(TIMEOUT, call).await.unwrap().unwrap().unwrap();
    assert_eq!(result, json!({"pong": true}));
    assert_eq!(h.gateway.dispatcher().pending_count(), 0);
}

#[tokio::test]
async fn binary_frames_are_accepted() {
    let h = boot(ServerConfig::default()).await;
    let mut ws = connect_device(&h.url, "test_bike_001").await;
    let before = h
        .gateway
        .registry()
        .get(&ecu("test_bike_001"))
        .unwrap()
        .last_heartbeat;

    tokio::time::sleep(Duration::from_millis(5)).await;
    let note = json!({"jsonrpc": "2.0", "method": "heartbeat", "params": {}});
    ws.send(Message::Binary(note.to_string().into_bytes().into()))
        .await
        .unwrap();

    eventually(|| {
        h.gateway
            .registry()
            .get(&ecu("test_bike_001"))
            .is_some_and(|r| r.last_heartbeat > before)
    })
    .await;
}

#[tokio::test]
async fn device_request_is_answered() {
    let h = boot(ServerConfig::default()).await;
    let mut ws = connect_device(&h.url, "test_gate_001").await;

    send_json(
        &mut ws,
        json!({"jsonrpc": "2.0", "id": 9, "method": "heartbeat", "params": {}}),
    )
    .await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["id"], 9);
    assert_eq!(reply["result"]["status"], "ok");
}

// ── Lifecycle ──

#[tokio::test]
async fn takeover_closes_previous_socket() {
    let h = boot(ServerConfig::default()).await;
    let mut old = connect_device(&h.url, "test_bike_001").await;
    let mut new = connect_device(&h.url, "test_bike_001").await;

    assert_eq!(next_close_code(&mut old).await, Some(4000));
    let record = h.gateway.registry().get(&ecu("test_bike_001")).unwrap();
    assert_eq!(record.status, ConnectionStatus::Connected);
    assert_eq!(record.session_epoch, 2);

    // commands reach the new socket only
    let dispatcher = h.gateway.dispatcher().clone();
    let call = tokio::spawn(async move {
        dispatcher
            .send(&ecu("test_bike_001"), "get_status", json!({}), None)
            .await
    });
    let request = next_json(&mut new).await;
    send_json(
        &mut new,
        json!({"jsonrpc": "2.0", "id": request["id"], "result": {"ok": true}}),
    )
    .await;
    assert!(timeout(TIMEOUT, call).await.unwrap().unwrap().is_ok());

    // the old socket's close must not end the new session
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        h.gateway.registry().status(&ecu("test_bike_001")),
        Some(ConnectionStatus::Connected)
    );
}

#[tokio::test]
async fn silent_device_socket_is_closed_after_timeout() {
    let h = boot_with(
        ServerConfig::default(),
        RuntimeConfig {
            heartbeat: HeartbeatConfig {
                timeout: Duration::from_millis(200),
                sweep_interval: Duration::from_millis(50),
            },
            ..RuntimeConfig::default()
        },
    )
    .await;
    let mut ws = connect_device(&h.url, "test_gate_001").await;

    assert_eq!(next_close_code(&mut ws).await, Some(4003));
    eventually(|| {
        h.gateway.registry().status(&ecu("test_gate_001")) == Some(ConnectionStatus::Disconnected)
    })
    .await;

    // the device comes back on a fresh socket
    let _ws = connect_device(&h.url, "test_gate_001").await;
    let record = h.gateway.registry().get(&ecu("test_gate_001")).unwrap();
    assert_eq!(record.status, ConnectionStatus::Connected);
    assert_eq!(record.session_epoch, 2);
}

#[tokio::test]
async fn device_close_disconnects_session() {
    let h = boot(ServerConfig::default()).await;
    let mut ws = connect_device(&h.url, "test_gate_001").await;
    ws.close(None).await.unwrap();

    eventually(|| {
        h.gateway.registry().status(&ecu("test_gate_001")) == Some(ConnectionStatus::Disconnected)
    })
    .await;
    eventually(|| h.server.connection_count() == 0).await;

    let _ = h.gateway.shutdown().await;
    let types = h.store.action_types_for("test_gate_001");
    assert_eq!(types, vec![ActionType::Connect, ActionType::Disconnect]);
}

#[tokio::test]
async fn shutdown_closes_device_sockets() {
    let h = boot(ServerConfig {
        shutdown_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    })
    .await;
    let mut ws = connect_device(&h.url, "test_gate_001").await;

    h.server.shutdown().shutdown();
    assert_eq!(next_close_code(&mut ws).await, Some(1001));
    timeout(TIMEOUT, h.handle).await.unwrap().unwrap();
    assert_eq!(h.server.connection_count(), 0);
}
