//! Live-socket tests for the WebSocket machine against a scripted server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use chansock_client::{Chsk, ChskKind, ClientConfig, ClientState};

struct FakeServer {
    port: u16,
    /// Completed WebSocket accepts.
    connections: Arc<AtomicUsize>,
    /// Raw text frames received, across all connections.
    frames: Arc<Mutex<Vec<String>>>,
}

/// A minimal scripted peer: accepts connections, sends the handshake,
/// then optionally answers keep-alive pings.
async fn spawn_fake_server(respond_to_pings: bool) -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));
    let frames: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let conns2 = Arc::clone(&connections);
    let frames2 = Arc::clone(&frames);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let conns = Arc::clone(&conns2);
            let frames = Arc::clone(&frames2);
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                conns.fetch_add(1, Ordering::SeqCst);
                let (mut tx, mut rx) = ws.split();

                let handshake = json!([["chsk/handshake", ["u1", null, null]]]);
                let _ = tx.send(Message::Text(handshake.to_string())).await;

                while let Some(Ok(msg)) = rx.next().await {
                    if let Message::Text(text) = msg {
                        frames.lock().unwrap().push(text.clone());
                        if !respond_to_pings {
                            continue;
                        }
                        // Envelope [["chsk/ws-ping"], cb] -> ["pong", cb].
                        let Ok(value) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        let is_ping = value
                            .get(0)
                            .and_then(|v| v.get(0))
                            .and_then(Value::as_str)
                            == Some("chsk/ws-ping");
                        if is_ping {
                            if let Some(cb) = value.get(1) {
                                let pong = json!(["pong", cb]);
                                let _ = tx.send(Message::Text(pong.to_string())).await;
                            }
                        }
                    }
                }
            });
        }
    });

    FakeServer {
        port,
        connections,
        frames,
    }
}

fn ws_config(port: u16) -> ClientConfig {
    ClientConfig {
        kind: ChskKind::Ws,
        host: "127.0.0.1".into(),
        port,
        path: "/".into(),
        ws_kalive: Duration::from_millis(120),
        ws_kalive_ping_timeout: Duration::from_millis(120),
        ..ClientConfig::default()
    }
}

async fn wait_for(
    state_rx: &mut tokio::sync::watch::Receiver<ClientState>,
    deadline: Duration,
    pred: impl Fn(&ClientState) -> bool,
) -> bool {
    tokio::time::timeout(deadline, async {
        loop {
            if pred(&state_rx.borrow()) {
                return;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn keepalive_pong_keeps_connection_alive() {
    let server = spawn_fake_server(true).await;
    let (chsk, _recv, mut state_rx) = Chsk::new(ws_config(server.port));
    chsk.connect();

    assert!(wait_for(&mut state_rx, Duration::from_secs(5), |s| s.open).await);

    // Across several keep-alive periods the single connection survives.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
    assert!(state_rx.borrow().open);

    let frames = server.frames.lock().unwrap();
    assert!(
        frames.iter().any(|f| f.contains("chsk/ws-ping")),
        "client should have pinged during idle: {frames:?}"
    );
}

#[tokio::test]
async fn missed_pong_cycles_socket_with_ping_timeout() {
    let server = spawn_fake_server(false).await;
    let (chsk, mut recv, mut state_rx) = Chsk::new(ws_config(server.port));
    chsk.connect();

    assert!(wait_for(&mut state_rx, Duration::from_secs(5), |s| s.open).await);

    // No pong ever arrives: expect a ws-ping-timeout close. The state
    // transition may be transient, so observe it on the (queued) receive
    // channel rather than the latest-value watch.
    let saw_ping_timeout = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = recv.recv().await.expect("receive channel open");
            if msg.event.id != "chsk/state" {
                continue;
            }
            let new_state = &msg.event.data.as_ref().unwrap()[1];
            if new_state["last_close"]["reason"] == json!("ws-ping-timeout") {
                return;
            }
        }
    })
    .await
    .is_ok();
    assert!(saw_ping_timeout, "close reason should be ws-ping-timeout");

    assert!(
        wait_for(&mut state_rx, Duration::from_secs(5), |s| s.open).await,
        "client should reconnect after the cycle"
    );
    assert!(server.connections.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn disconnect_makes_no_further_attempts() {
    let server = spawn_fake_server(true).await;
    let (chsk, _recv, mut state_rx) = Chsk::new(ws_config(server.port));
    chsk.connect();
    assert!(wait_for(&mut state_rx, Duration::from_secs(5), |s| s.open).await);

    chsk.disconnect();
    assert!(
        wait_for(&mut state_rx, Duration::from_secs(5), |s| !s.open).await,
        "disconnect should close"
    );

    let count = server.connections.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(
        server.connections.load(Ordering::SeqCst),
        count,
        "no reconnect after disconnect"
    );
}

#[tokio::test]
async fn auto_downgrades_to_ajax_when_ws_never_opens() {
    // A port with nothing listening: dials fail instantly.
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let cfg = ClientConfig {
        kind: ChskKind::Auto,
        host: "127.0.0.1".into(),
        port: dead_port,
        path: "/".into(),
        ..ClientConfig::default()
    };
    let (chsk, _recv, mut state_rx) = Chsk::new(cfg);
    chsk.connect();

    assert!(
        wait_for(&mut state_rx, Duration::from_secs(5), |s| s.kind == ChskKind::Ajax).await,
        "auto should permanently switch to ajax"
    );
    let s = state_rx.borrow().clone();
    assert!(!s.ever_opened);
    assert!(s.last_ws_error.is_some());
}
