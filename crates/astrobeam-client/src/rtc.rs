//! `RtcPeer` and `ChannelSink` over a real WebRTC peer connection.

use std::sync::Arc;
use std::time::Duration;

use astrobeam_common::{Error, IceCandidate, Result, DATA_CHANNEL_LABEL};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::peer::{negotiation, PeerEvent, RtcPeer};
use crate::transfer::{ChannelEvent, ChannelMessage, ChannelSink, Role, TransportState};

/// Above this many queued bytes the sender waits before handing over
/// another chunk.
const MAX_BUFFERED_AMOUNT: usize = 1024 * 1024;
const BUFFER_DRAIN_POLL: Duration = Duration::from_millis(10);
/// A remote that drains nothing for this long is treated as gone.
const MAX_DRAIN_WAIT: Duration = Duration::from_secs(10);

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
}

impl WebRtcPeer {
    /// Build a connection using `ice_servers` for discovery. Everything
    /// the connection reports is pushed into `events`.
    ///
    /// The sender creates its ordered data channel here, before any remote
    /// description exists; the receiver picks it up once the remote peer
    /// opens it.
    pub async fn new(
        role: Role,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(negotiation("register codecs"))?;
        let api = APIBuilder::new().with_media_engine(media).build();

        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(negotiation("create peer connection"))?,
        );
        let channel: ChannelSlot = Arc::new(Mutex::new(None));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => warn!("failed to serialize local candidate: {}", err),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                debug!("peer connection state: {}", state);
                if let Some(state) = transport_state(state) {
                    let _ = events.send(PeerEvent::Transport(state));
                }
            })
        }));

        match role {
            Role::Sender => {
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
                    .await
                    .map_err(negotiation("create data channel"))?;
                wire_channel(&dc, events.clone());
                *channel.lock().await = Some(dc);
            }
            Role::Receiver => {
                let slot = channel.clone();
                let channel_events = events.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = slot.clone();
                    let events = channel_events.clone();
                    Box::pin(async move {
                        info!("remote opened data channel '{}'", dc.label());
                        wire_channel(&dc, events);
                        *slot.lock().await = Some(dc);
                    })
                }));
            }
        }

        Ok(Self { pc, channel })
    }

    async fn current_channel(&self) -> Result<Arc<RTCDataChannel>> {
        self.channel
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::channel("data channel not established"))
    }
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<PeerEvent>) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        Box::pin(async move {
            let _ = events.send(PeerEvent::Channel(ChannelEvent::Open));
        })
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            let _ = events.send(PeerEvent::Channel(ChannelEvent::Close));
        })
    }));

    let error_events = events.clone();
    dc.on_error(Box::new(move |err| {
        let events = error_events.clone();
        Box::pin(async move {
            let _ = events.send(PeerEvent::Channel(ChannelEvent::Error(err.to_string())));
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            let message = if msg.is_string {
                ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelMessage::Binary(msg.data)
            };
            let _ = events.send(PeerEvent::Channel(ChannelEvent::Message(message)));
        })
    }));
}

fn ensure_open(dc: &RTCDataChannel) -> Result<()> {
    match dc.ready_state() {
        RTCDataChannelState::Open => Ok(()),
        state => Err(Error::channel(format!(
            "data channel '{}' is {}",
            dc.label(),
            state
        ))),
    }
}

/// Wait until the channel has drained below `MAX_BUFFERED_AMOUNT`.
async fn wait_for_buffer_space(dc: &RTCDataChannel) -> Result<()> {
    ensure_open(dc)?;
    if dc.buffered_amount().await <= MAX_BUFFERED_AMOUNT {
        return Ok(());
    }

    debug!(
        "backpressure on '{}': {} bytes buffered",
        dc.label(),
        dc.buffered_amount().await
    );
    let deadline = Instant::now() + MAX_DRAIN_WAIT;
    loop {
        tokio::time::sleep(BUFFER_DRAIN_POLL).await;
        ensure_open(dc)?;
        if dc.buffered_amount().await <= MAX_BUFFERED_AMOUNT {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::channel(format!(
                "data channel '{}' did not drain within {:?}",
                dc.label(),
                MAX_DRAIN_WAIT
            )));
        }
    }
}

fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(negotiation("create offer"))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation("set local offer"))?;
        Ok(offer.sdp)
    }

    async fn apply_offer(&self, sdp: String) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp).map_err(negotiation("parse offer"))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(negotiation("set remote offer"))
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(negotiation("create answer"))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation("set local answer"))?;
        Ok(answer.sdp)
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp).map_err(negotiation("parse answer"))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(negotiation("set remote answer"))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(negotiation("add ice candidate"))
    }

    async fn awaiting_answer(&self) -> bool {
        self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer
    }

    async fn close_channel(&self) -> Result<()> {
        let dc = self.channel.lock().await.take();
        if let Some(dc) = dc {
            dc.close().await.map_err(Error::channel)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(Error::channel)
    }
}

#[async_trait]
impl ChannelSink for WebRtcPeer {
    async fn send_text(&self, text: &str) -> Result<()> {
        let dc = self.current_channel().await?;
        ensure_open(&dc)?;
        dc.send_text(text.to_string())
            .await
            .map_err(Error::channel)?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        let dc = self.current_channel().await?;
        wait_for_buffer_space(&dc).await?;
        dc.send(&data).await.map_err(Error::channel)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_fail_until_the_channel_opens() {
        let (events, _rx) = mpsc::unbounded_channel();
        let peer = WebRtcPeer::new(Role::Sender, &[], events).await.unwrap();

        let err = peer
            .send_binary(Bytes::from_static(b"chunk"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Channel(_)), "{err}");
        assert!(matches!(
            peer.send_text("metadata").await,
            Err(Error::Channel(_))
        ));
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn receiver_without_channel_cannot_send() {
        let (events, _rx) = mpsc::unbounded_channel();
        let peer = WebRtcPeer::new(Role::Receiver, &[], events).await.unwrap();
        let err = peer.send_text("transfer_complete").await.unwrap_err();
        assert!(err.to_string().contains("not established"));
        peer.close().await.unwrap();
    }
}
