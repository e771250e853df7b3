//! Full sender/receiver runs through a real relay, with the peer
//! connection replaced by an in-memory loopback.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use astrobeam_client::{
    spawn_transfer, start_receive, ChannelEvent, ChannelMessage, ChannelSink, ConnectionStatus,
    PeerEvent, RtcPeer, SignalingClient, TransferConfig, TransferHandle, TransferOutcome,
    TransferSession, TransportState,
};
use astrobeam_common::file_transfer::OutgoingFile;
use astrobeam_common::{Error, IceCandidate, Result, CHUNK_SIZE};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

const POLL: Duration = Duration::from_millis(20);

struct LoopbackPeer {
    name: &'static str,
    own: mpsc::UnboundedSender<PeerEvent>,
    remote: mpsc::UnboundedSender<PeerEvent>,
    link_open: Arc<AtomicBool>,
    awaiting_answer: AtomicBool,
    applied: Mutex<Vec<String>>,
}

type Events = mpsc::UnboundedReceiver<PeerEvent>;

fn loopback_pair() -> ((Arc<LoopbackPeer>, Events), (Arc<LoopbackPeer>, Events)) {
    let (sender_tx, sender_rx) = mpsc::unbounded_channel();
    let (receiver_tx, receiver_rx) = mpsc::unbounded_channel();
    let link_open = Arc::new(AtomicBool::new(false));
    let peer = |name, own: &mpsc::UnboundedSender<PeerEvent>, remote: &mpsc::UnboundedSender<PeerEvent>| {
        Arc::new(LoopbackPeer {
            name,
            own: own.clone(),
            remote: remote.clone(),
            link_open: link_open.clone(),
            awaiting_answer: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
        })
    };
    let sender = peer("sender", &sender_tx, &receiver_tx);
    let receiver = peer("receiver", &receiver_tx, &sender_tx);
    ((sender, sender_rx), (receiver, receiver_rx))
}

impl LoopbackPeer {
    fn local_candidate(&self) {
        let _ = self.own.send(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp 1 127.0.0.1 9 typ host", self.name),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }

    fn deliver(&self, message: ChannelMessage) -> Result<()> {
        if !self.link_open.load(Ordering::SeqCst) {
            return Err(Error::channel("loopback closed"));
        }
        self.remote
            .send(PeerEvent::Channel(ChannelEvent::Message(message)))
            .map_err(|_| Error::channel("remote gone"))
    }
}

#[async_trait]
impl RtcPeer for LoopbackPeer {
    async fn create_offer(&self) -> Result<String> {
        self.awaiting_answer.store(true, Ordering::SeqCst);
        self.local_candidate();
        Ok("loopback-offer".into())
    }

    async fn apply_offer(&self, sdp: String) -> Result<()> {
        if sdp != "loopback-offer" {
            return Err(Error::negotiation(format!("unexpected offer {sdp}")));
        }
        Ok(())
    }

    async fn create_answer(&self) -> Result<String> {
        self.local_candidate();
        Ok("loopback-answer".into())
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        if sdp != "loopback-answer" {
            return Err(Error::negotiation(format!("unexpected answer {sdp}")));
        }
        self.awaiting_answer.store(false, Ordering::SeqCst);
        self.link_open.store(true, Ordering::SeqCst);
        let _ = self.own.send(PeerEvent::Transport(TransportState::Connected));
        let _ = self.remote.send(PeerEvent::Transport(TransportState::Connected));
        let _ = self.own.send(PeerEvent::Channel(ChannelEvent::Open));
        let _ = self.remote.send(PeerEvent::Channel(ChannelEvent::Open));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.applied.lock().unwrap().push(candidate.candidate);
        Ok(())
    }

    async fn awaiting_answer(&self) -> bool {
        self.awaiting_answer.load(Ordering::SeqCst)
    }

    async fn close_channel(&self) -> Result<()> {
        if self.link_open.swap(false, Ordering::SeqCst) {
            let _ = self.own.send(PeerEvent::Channel(ChannelEvent::Close));
            let _ = self.remote.send(PeerEvent::Channel(ChannelEvent::Close));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ChannelSink for LoopbackPeer {
    async fn send_text(&self, text: &str) -> Result<()> {
        self.deliver(ChannelMessage::Text(text.to_string()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.deliver(ChannelMessage::Binary(data))
    }
}

/// A peer whose channel opens at once but whose binary sends never
/// complete, like a remote that stopped draining.
struct StallingPeer {
    own: mpsc::UnboundedSender<PeerEvent>,
}

#[async_trait]
impl RtcPeer for StallingPeer {
    async fn create_offer(&self) -> Result<String> {
        let _ = self.own.send(PeerEvent::Transport(TransportState::Connected));
        let _ = self.own.send(PeerEvent::Channel(ChannelEvent::Open));
        Ok("stalling-offer".into())
    }

    async fn apply_offer(&self, _sdp: String) -> Result<()> {
        Ok(())
    }

    async fn create_answer(&self) -> Result<String> {
        Ok("stalling-answer".into())
    }

    async fn apply_answer(&self, _sdp: String) -> Result<()> {
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        Ok(())
    }

    async fn awaiting_answer(&self) -> bool {
        true
    }

    async fn close_channel(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ChannelSink for StallingPeer {
    async fn send_text(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    async fn send_binary(&self, _data: Bytes) -> Result<()> {
        std::future::pending().await
    }
}

async fn stalled_sender(
    url: &str,
    session_id: &str,
) -> (TransferHandle, mpsc::UnboundedSender<PeerEvent>) {
    let (path, _) = common::temp_file("stall.bin", 4 * CHUNK_SIZE);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let peer = Arc::new(StallingPeer {
        own: events_tx.clone(),
    });
    let signaling = joined_client(url, session_id).await;
    let handle = spawn_transfer(
        signaling,
        TransferSession::sender(session_id, OutgoingFile::from_path(&path).unwrap()),
        peer,
        events_rx,
        POLL,
    );

    for _ in 0..100 {
        if handle.snapshot().status == ConnectionStatus::Transferring {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(handle.snapshot().status, ConnectionStatus::Transferring);
    (handle, events_tx)
}

async fn finish(mut handle: TransferHandle) -> TransferOutcome {
    tokio::time::timeout(Duration::from_secs(10), handle.join())
        .await
        .expect("transfer did not finish")
        .unwrap()
}

async fn joined_client(url: &str, session_id: &str) -> Arc<SignalingClient> {
    let client = SignalingClient::connect(url).await.unwrap();
    let mut notices = client.subscribe();
    client.join(session_id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), notices.recv())
        .await
        .unwrap()
        .unwrap();
    Arc::new(client)
}

#[tokio::test]
async fn receiver_first_transfer_completes_on_both_sides() {
    let url = common::spawn_relay().await;
    let (path, payload) = common::temp_file("notes.txt", 2 * CHUNK_SIZE + 17);
    let ((sender_peer, sender_events), (receiver_peer, receiver_events)) = loopback_pair();

    let receiver_signaling = joined_client(&url, "leo-a4b8").await;
    let receiver = spawn_transfer(
        receiver_signaling,
        TransferSession::receiver("leo-a4b8"),
        receiver_peer.clone(),
        receiver_events,
        POLL,
    );

    let sender_signaling = joined_client(&url, "leo-a4b8").await;
    let file = OutgoingFile::from_path(&path).unwrap();
    let sender = spawn_transfer(
        sender_signaling,
        TransferSession::sender("leo-a4b8", file),
        sender_peer.clone(),
        sender_events,
        POLL,
    );

    let sent = finish(sender).await;
    let received = finish(receiver).await;

    assert_eq!(sent.snapshot.status, ConnectionStatus::Completed);
    assert_eq!(sent.snapshot.progress, 100.0);
    assert_eq!(received.snapshot.status, ConnectionStatus::Completed);
    assert_eq!(received.snapshot.zodiac, Some("Leo"));

    let file = received.received.unwrap();
    assert_eq!(file.metadata.name, "notes.txt");
    assert_eq!(file.metadata.mime_type, "text/plain");
    assert_eq!(file.data.as_ref(), payload.as_slice());

    let record = received.record.unwrap();
    assert_eq!(record.file_size, payload.len() as u64);
    assert_eq!(record.zodiac.as_deref(), Some("Leo"));
    assert!(sent.record.is_some());

    assert!(receiver_peer
        .applied
        .lock()
        .unwrap()
        .iter()
        .any(|c| c.contains("sender")));
    assert!(sender_peer
        .applied
        .lock()
        .unwrap()
        .iter()
        .any(|c| c.contains("receiver")));
}

#[tokio::test]
async fn sender_first_offer_is_resent_once_receiver_joins() {
    let url = common::spawn_relay().await;
    let (path, payload) = common::temp_file("photo.png", 1000);
    let ((sender_peer, sender_events), (receiver_peer, receiver_events)) = loopback_pair();

    let sender_signaling = joined_client(&url, "pisces-9z9z").await;
    let file = OutgoingFile::from_path(&path).unwrap();
    let sender = spawn_transfer(
        sender_signaling,
        TransferSession::sender("pisces-9z9z", file),
        sender_peer,
        sender_events,
        POLL,
    );

    // the offer goes out to an empty session first
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(sender.snapshot().status, ConnectionStatus::Connecting);

    let receiver_signaling = joined_client(&url, "pisces-9z9z").await;
    let receiver = spawn_transfer(
        receiver_signaling,
        TransferSession::receiver("pisces-9z9z"),
        receiver_peer,
        receiver_events,
        POLL,
    );

    let sent = finish(sender).await;
    let received = finish(receiver).await;
    assert_eq!(sent.snapshot.status, ConnectionStatus::Completed);
    assert_eq!(received.snapshot.status, ConnectionStatus::Completed);
    assert_eq!(received.received.unwrap().data.as_ref(), payload.as_slice());
}

#[tokio::test]
async fn waiting_receiver_survives_rejoin_and_can_be_closed() {
    let url = common::spawn_relay().await;
    let ((_, _), (receiver_peer, receiver_events)) = loopback_pair();
    let signaling = joined_client(&url, "libra-0001").await;
    let receiver = spawn_transfer(
        signaling.clone(),
        TransferSession::receiver("libra-0001"),
        receiver_peer,
        receiver_events,
        POLL,
    );

    // the relay rejects the repeat, the transfer shrugs it off
    signaling.join("libra-0001").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(receiver.snapshot().status, ConnectionStatus::Connecting);
    receiver.close();

    let outcome = finish(receiver).await;
    assert_eq!(outcome.snapshot.status, ConnectionStatus::Closed);
    assert!(outcome.snapshot.error.is_none());
    assert!(outcome.record.is_none());
    assert!(outcome.received.is_none());
}

#[tokio::test]
async fn start_receive_normalizes_the_code() {
    let url = common::spawn_relay().await;
    let signaling = Arc::new(SignalingClient::connect(&url).await.unwrap());
    let config = TransferConfig {
        ice_servers: Vec::new(),
        poll_interval: POLL,
        ..TransferConfig::default()
    };

    let err = start_receive(signaling.clone(), &config, "not a code")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::InvalidSession(_)));

    let mut notices = signaling.subscribe();
    let handle = start_receive(signaling.clone(), &config, "  LEO-A4B8 ")
        .await
        .unwrap();
    let joined = tokio::time::timeout(Duration::from_secs(5), notices.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(joined, astrobeam_client::RelayNotice::Joined("leo-a4b8".into()));

    handle.close();
    let outcome = finish(handle).await;
    assert_eq!(outcome.snapshot.status, ConnectionStatus::Closed);
}

#[tokio::test]
async fn close_interrupts_a_stalled_stream() {
    let url = common::spawn_relay().await;
    let (mut handle, _events) = stalled_sender(&url, "gemini-c10s").await;

    handle.close();
    let outcome = tokio::time::timeout(Duration::from_secs(3), handle.join())
        .await
        .expect("close did not interrupt streaming")
        .unwrap();
    assert_eq!(outcome.snapshot.status, ConnectionStatus::Closed);
    assert!(outcome.snapshot.progress < 100.0);
    assert!(outcome.record.is_none());
}

#[tokio::test]
async fn transport_failure_during_stream_fails_the_transfer() {
    let url = common::spawn_relay().await;
    let (mut handle, events) = stalled_sender(&url, "taurus-f41l").await;

    events
        .send(PeerEvent::Transport(TransportState::Failed))
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(3), handle.join())
        .await
        .expect("transport failure did not end streaming")
        .unwrap();
    assert_eq!(outcome.snapshot.status, ConnectionStatus::Failed);
    assert!(outcome
        .snapshot
        .error
        .unwrap()
        .contains("peer connection failed"));
    assert_eq!(outcome.record.unwrap().status, ConnectionStatus::Failed);
}
