//! Peer connection manager.
//!
//! Drives offer/answer negotiation over an [`RtcPeer`] and holds remote
//! candidates until a remote description exists to apply them against.

use std::collections::VecDeque;
use std::sync::Arc;

use astrobeam_common::{Error, IceCandidate, Result, SignalingMessage};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::transfer::{ChannelEvent, Role, TransportState};

/// Events a peer connection reports back to its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Freshly gathered local candidate, to be signaled immediately.
    LocalCandidate(IceCandidate),
    Transport(TransportState),
    Channel(ChannelEvent),
}

/// The negotiation surface of a peer connection.
///
/// Implementations map their own failures to [`Error::Negotiation`].
#[async_trait]
pub trait RtcPeer: Send + Sync {
    /// Create an offer and set it as the local description. Returns its SDP.
    async fn create_offer(&self) -> Result<String>;

    async fn apply_offer(&self, sdp: String) -> Result<()>;

    /// Create an answer and set it as the local description. Returns its SDP.
    async fn create_answer(&self) -> Result<String>;

    async fn apply_answer(&self, sdp: String) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// True while a local offer is outstanding (`have-local-offer`).
    async fn awaiting_answer(&self) -> bool;

    async fn close_channel(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl<T: RtcPeer + ?Sized> RtcPeer for Arc<T> {
    async fn create_offer(&self) -> Result<String> {
        (**self).create_offer().await
    }

    async fn apply_offer(&self, sdp: String) -> Result<()> {
        (**self).apply_offer(sdp).await
    }

    async fn create_answer(&self) -> Result<String> {
        (**self).create_answer().await
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        (**self).apply_answer(sdp).await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        (**self).add_ice_candidate(candidate).await
    }

    async fn awaiting_answer(&self) -> bool {
        (**self).awaiting_answer().await
    }

    async fn close_channel(&self) -> Result<()> {
        (**self).close_channel().await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// FIFO of remote candidates received before the remote description.
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    pending: VecDeque<IceCandidate>,
}

impl IceCandidateQueue {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Everything queued, oldest first.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

pub struct PeerConnectionManager<P> {
    role: Role,
    peer: P,
    state: PeerState,
    candidates: IceCandidateQueue,
    remote_description_set: bool,
}

impl<P: RtcPeer> PeerConnectionManager<P> {
    pub fn new(role: Role, peer: P) -> Self {
        Self {
            role,
            peer,
            state: PeerState::Idle,
            candidates: IceCandidateQueue::default(),
            remote_description_set: false,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn queued_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Start negotiating. The sender gets back the offer to signal.
    pub async fn open(&mut self) -> Result<Option<SignalingMessage>> {
        if self.state != PeerState::Idle {
            return Ok(None);
        }
        self.state = PeerState::Connecting;
        match self.role {
            Role::Sender => {
                let sdp = self.peer.create_offer().await?;
                info!("created offer");
                Ok(Some(SignalingMessage::Offer { sdp }))
            }
            Role::Receiver => Ok(None),
        }
    }

    /// Apply one relayed message. Returns the reply to signal, if any.
    pub async fn handle_signal(
        &mut self,
        message: SignalingMessage,
    ) -> Result<Option<SignalingMessage>> {
        if matches!(self.state, PeerState::Closed | PeerState::Failed) {
            debug!("dropping {} after teardown", message.kind());
            return Ok(None);
        }

        match message {
            SignalingMessage::Offer { sdp } => {
                if self.role != Role::Receiver {
                    warn!("sender received an offer; ignoring");
                    return Ok(None);
                }
                if self.remote_description_set {
                    debug!("duplicate offer ignored");
                    return Ok(None);
                }
                self.peer.apply_offer(sdp).await?;
                self.remote_description_set = true;
                self.drain_candidates().await?;

                let sdp = self.peer.create_answer().await?;
                info!("created answer");
                Ok(Some(SignalingMessage::Answer { sdp }))
            }
            SignalingMessage::Answer { sdp } => {
                if self.role != Role::Sender {
                    warn!("receiver received an answer; ignoring");
                    return Ok(None);
                }
                if !self.peer.awaiting_answer().await {
                    debug!("stale answer ignored");
                    return Ok(None);
                }
                self.peer.apply_answer(sdp).await?;
                self.remote_description_set = true;
                self.drain_candidates().await?;
                info!("applied answer");
                Ok(None)
            }
            SignalingMessage::IceCandidate { candidate: None } => Ok(None),
            SignalingMessage::IceCandidate {
                candidate: Some(candidate),
            } => {
                if self.remote_description_set {
                    self.peer.add_ice_candidate(candidate).await?;
                } else {
                    debug!("queueing remote candidate (no remote description yet)");
                    self.candidates.push(candidate);
                }
                Ok(None)
            }
        }
    }

    async fn drain_candidates(&mut self) -> Result<()> {
        let pending = self.candidates.drain();
        if !pending.is_empty() {
            debug!("applying {} queued candidates", pending.len());
        }
        for candidate in pending {
            self.peer.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    pub fn mark_connected(&mut self) {
        if self.state == PeerState::Connecting {
            self.state = PeerState::Connected;
        }
    }

    pub fn mark_failed(&mut self) {
        if self.state != PeerState::Closed {
            self.state = PeerState::Failed;
        }
    }

    /// Close the data channel, then the connection, and forget queued
    /// candidates. Idempotent.
    pub async fn teardown(&mut self) {
        if self.state == PeerState::Closed {
            return;
        }
        if let Err(err) = self.peer.close_channel().await {
            debug!("closing data channel: {}", err);
        }
        if let Err(err) = self.peer.close().await {
            debug!("closing peer connection: {}", err);
        }
        self.candidates.clear();
        self.state = PeerState::Closed;
        info!("peer connection closed");
    }
}

/// Wrap any failure from `op` as a negotiation error.
pub(crate) fn negotiation<E: std::fmt::Display>(op: &str) -> impl FnOnce(E) -> Error + '_ {
    move |err| Error::negotiation(format!("{op}: {err}"))
}
