use std::net::SocketAddr;
use std::time::Duration;

use astrobeam_common::{RelayErrorCode, RelayFrame};
use astrobeam_relay::RelayState;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay() -> (SocketAddr, RelayState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = RelayState::default();
    let served = state.clone();
    tokio::spawn(async move {
        astrobeam_relay::serve(listener, served, std::future::pending())
            .await
            .unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, path: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, value: Value) {
    socket.send(Message::Text(value.to_string())).await.unwrap();
}

async fn recv(socket: &mut Socket) -> RelayFrame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for relay frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn join(socket: &mut Socket, session_id: &str) -> RelayFrame {
    send(socket, json!({"type": "join", "sessionId": session_id})).await;
    recv(socket).await
}

fn error_code(frame: &RelayFrame) -> Option<RelayErrorCode> {
    match frame {
        RelayFrame::Error { code, .. } => *code,
        _ => None,
    }
}

#[tokio::test]
async fn pairs_two_peers_and_forwards_both_ways() {
    let (addr, _) = spawn_relay().await;
    let mut sender = connect(addr, "/").await;
    let mut receiver = connect(addr, "/ws").await;

    assert_eq!(
        join(&mut sender, "LEO-A4B8").await,
        RelayFrame::Joined {
            session_id: "leo-a4b8".into()
        }
    );
    assert_eq!(
        join(&mut receiver, " leo-a4b8 ").await,
        RelayFrame::Joined {
            session_id: "leo-a4b8".into()
        }
    );

    let offer = json!({"type": "offer", "sdp": "v=0\r\n"});
    send(
        &mut sender,
        json!({"type": "signal", "sessionId": "leo-a4b8", "message": offer}),
    )
    .await;
    assert_eq!(
        recv(&mut receiver).await,
        RelayFrame::Signal {
            message: offer,
            session_id: "leo-a4b8".into()
        }
    );

    let answer = json!({"type": "answer", "sdp": "v=0\r\n"});
    send(&mut receiver, json!({"type": "signal", "message": answer})).await;
    assert_eq!(
        recv(&mut sender).await,
        RelayFrame::Signal {
            message: answer,
            session_id: "leo-a4b8".into()
        }
    );
}

#[tokio::test]
async fn lone_peer_gets_no_peer_error() {
    let (addr, _) = spawn_relay().await;
    let mut sender = connect(addr, "/").await;
    join(&mut sender, "aries-0001").await;

    send(
        &mut sender,
        json!({"type": "signal", "message": {"type": "offer", "sdp": ""}}),
    )
    .await;
    let frame = recv(&mut sender).await;
    assert_eq!(error_code(&frame), Some(RelayErrorCode::NoPeer));
    match frame {
        RelayFrame::Error { error, .. } => {
            assert_eq!(error, "No other peer connected to this session.")
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn rejects_bad_frames_without_closing() {
    let (addr, _) = spawn_relay().await;
    let mut socket = connect(addr, "/").await;

    send(&mut socket, json!({"sessionId": "leo-a4b8"})).await;
    assert_eq!(error_code(&recv(&mut socket).await), Some(RelayErrorCode::Malformed));

    send(&mut socket, json!({"type": "join", "sessionId": 7})).await;
    assert_eq!(
        error_code(&recv(&mut socket).await),
        Some(RelayErrorCode::InvalidSession)
    );

    send(&mut socket, json!({"type": "signal", "message": {}})).await;
    assert_eq!(error_code(&recv(&mut socket).await), Some(RelayErrorCode::NotJoined));

    socket.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    assert_eq!(error_code(&recv(&mut socket).await), Some(RelayErrorCode::Malformed));

    socket.send(Message::Text("{oops".into())).await.unwrap();
    assert_eq!(error_code(&recv(&mut socket).await), Some(RelayErrorCode::Malformed));

    // still usable after all of the above
    assert_eq!(
        join(&mut socket, "leo-a4b8").await,
        RelayFrame::Joined {
            session_id: "leo-a4b8".into()
        }
    );
}

#[tokio::test]
async fn session_is_removed_when_last_peer_leaves() {
    let (addr, state) = spawn_relay().await;
    let mut a = connect(addr, "/").await;
    let mut b = connect(addr, "/").await;
    join(&mut a, "pisces-zz99").await;
    join(&mut b, "pisces-zz99").await;
    assert_eq!(state.sessions.read().await.endpoint_count("pisces-zz99"), 2);

    a.close(None).await.unwrap();
    drop(a);
    wait_until(|| async { state.sessions.read().await.endpoint_count("pisces-zz99") == 1 }).await;

    send(&mut b, json!({"type": "signal", "message": {"type": "answer", "sdp": ""}})).await;
    assert_eq!(error_code(&recv(&mut b).await), Some(RelayErrorCode::NoPeer));

    b.close(None).await.unwrap();
    drop(b);
    wait_until(|| async { state.sessions.read().await.is_empty() }).await;
}

#[tokio::test]
async fn sessions_are_isolated() {
    let (addr, _) = spawn_relay().await;
    let mut a = connect(addr, "/").await;
    let mut b = connect(addr, "/").await;
    let mut other = connect(addr, "/").await;
    join(&mut a, "leo-a4b8").await;
    join(&mut b, "leo-a4b8").await;
    join(&mut other, "virgo-1234").await;

    send(&mut a, json!({"type": "signal", "message": {"type": "offer", "sdp": "x"}})).await;
    assert!(matches!(recv(&mut b).await, RelayFrame::Signal { .. }));

    let stray = tokio::time::timeout(Duration::from_millis(200), other.next()).await;
    assert!(stray.is_err(), "other session must not see the signal");
}

#[tokio::test]
async fn health_reports_counts() {
    let (addr, _) = spawn_relay().await;
    let mut a = connect(addr, "/").await;
    join(&mut a, "leo-a4b8").await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let report: Value = serde_json::from_str(body).unwrap();
    assert_eq!(report, json!({"active_sessions": 1, "active_endpoints": 1}));
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}
