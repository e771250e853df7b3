#![allow(dead_code)]

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use astrobeam_client::SignalingClient;
use astrobeam_relay::RelayState;
use serde_json::Value;
use tokio::net::TcpListener;

/// Start a relay on an ephemeral port and return its ws:// URL.
pub async fn spawn_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        astrobeam_relay::serve(listener, RelayState::default(), std::future::pending())
            .await
            .unwrap();
    });
    format!("ws://{addr}")
}

pub async fn wait_for_messages(
    client: &SignalingClient,
    session_id: &str,
    from: usize,
    count: usize,
) -> Vec<Value> {
    for _ in 0..250 {
        let messages = client.poll(session_id, from);
        if messages.len() >= count {
            return messages;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {count} messages for {session_id}");
}

pub fn temp_file(name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("astrobeam-flow-{unique}"));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let payload = (0..len).map(|v| (v * 31 % 256) as u8).collect::<Vec<_>>();
    std::fs::write(&path, &payload).unwrap();
    (path, payload)
}
