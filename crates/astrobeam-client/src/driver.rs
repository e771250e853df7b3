//! Runs one transfer: polls relayed signaling, feeds the peer manager and
//! the transfer session, and carries out their directives.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use astrobeam_common::file_transfer::OutgoingFile;
use astrobeam_common::identity::{generate, normalize_session_id, sign_for_session, SessionIdentity};
use astrobeam_common::{Error, RelayErrorCode, Result, SignalingMessage, CHUNK_SIZE};
use futures_util::future::BoxFuture;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::peer::{PeerConnectionManager, PeerEvent, RtcPeer};
use crate::rtc::WebRtcPeer;
use crate::signaling::{RelayNotice, SignalingClient};
use crate::transfer::{
    ChannelEvent, ChannelSink, ConnectionStatus, Directive, ReceivedFile, Role, TransferRecord,
    TransferSession, TransferSnapshot,
};

/// Public discovery servers. There is no relay (TURN) fallback.
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub ice_servers: Vec<String>,
    pub poll_interval: Duration,
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// Final state of a transfer task.
#[derive(Debug)]
pub struct TransferOutcome {
    pub snapshot: TransferSnapshot,
    pub received: Option<ReceivedFile>,
    pub record: Option<TransferRecord>,
}

pub struct TransferHandle {
    snapshot: watch::Receiver<TransferSnapshot>,
    close_tx: mpsc::Sender<()>,
    task: JoinHandle<TransferOutcome>,
}

impl TransferHandle {
    pub fn subscribe(&self) -> watch::Receiver<TransferSnapshot> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Ask the transfer to tear down. It settles in `Closed` unless it
    /// already completed or failed.
    pub fn close(&self) {
        let _ = self.close_tx.try_send(());
    }

    /// Wait for the transfer task to finish.
    pub async fn join(&mut self) -> Result<TransferOutcome> {
        (&mut self.task)
            .await
            .map_err(|err| Error::channel(format!("transfer task ended abnormally: {err}")))
    }
}

/// Generate a session code, join it, and start offering `path`.
pub async fn start_send(
    signaling: Arc<SignalingClient>,
    config: &TransferConfig,
    path: &Path,
) -> Result<(SessionIdentity, TransferHandle)> {
    let file = OutgoingFile::with_chunk_size(path, config.chunk_size)?;
    let identity = generate();
    signaling.join(&identity.session_id).await?;

    let mut session = TransferSession::sender(identity.session_id.clone(), file);
    session.set_zodiac(identity.sign.name);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let peer = Arc::new(WebRtcPeer::new(Role::Sender, &config.ice_servers, events_tx).await?);
    let handle = spawn_transfer(signaling, session, peer, events_rx, config.poll_interval);
    Ok((identity, handle))
}

/// Join the session named by a user-entered `code` and wait for an offer.
pub async fn start_receive(
    signaling: Arc<SignalingClient>,
    config: &TransferConfig,
    code: &str,
) -> Result<TransferHandle> {
    let session_id = normalize_session_id(code)?;
    signaling.join(&session_id).await?;

    let session = TransferSession::receiver(session_id);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let peer = Arc::new(WebRtcPeer::new(Role::Receiver, &config.ice_servers, events_tx).await?);
    Ok(spawn_transfer(
        signaling,
        session,
        peer,
        events_rx,
        config.poll_interval,
    ))
}

/// Run `session` over any peer implementation on a background task.
pub fn spawn_transfer<P>(
    signaling: Arc<SignalingClient>,
    session: TransferSession,
    peer: Arc<P>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    poll_interval: Duration,
) -> TransferHandle
where
    P: RtcPeer + ChannelSink + 'static,
{
    let snapshot = session.subscribe();
    let (close_tx, close_rx) = mpsc::channel(1);
    let driver = Driver {
        manager: PeerConnectionManager::new(session.role(), peer.clone()),
        sink: peer,
        session,
        signaling,
        watermark: 0,
        outbox: Vec::new(),
        resend: false,
        sending: None,
    };
    let task = tokio::spawn(driver.run(events, close_rx, poll_interval));
    TransferHandle {
        snapshot,
        close_tx,
        task,
    }
}

struct Driver<P> {
    manager: PeerConnectionManager<Arc<P>>,
    sink: Arc<P>,
    session: TransferSession,
    signaling: Arc<SignalingClient>,
    /// Index of the next unread relayed message.
    watermark: usize,
    /// Offer and local candidates, kept for resending until answered.
    outbox: Vec<SignalingMessage>,
    resend: bool,
    /// The one data-channel send in progress while streaming.
    sending: Option<BoxFuture<'static, Result<()>>>,
}

/// Resolves with the in-flight send, or never when there is none.
async fn in_flight(sending: &mut Option<BoxFuture<'static, Result<()>>>) -> Result<()> {
    match sending {
        Some(send) => send.await,
        None => std::future::pending().await,
    }
}

impl<P> Driver<P>
where
    P: RtcPeer + ChannelSink + 'static,
{
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        mut close_rx: mpsc::Receiver<()>,
        poll_interval: Duration,
    ) -> TransferOutcome {
        let mut notices = self.signaling.subscribe();
        let mut notices_open = true;
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.session.mark_connecting();
        let mut pending: VecDeque<Directive> = match self.manager.open().await {
            Ok(Some(offer)) => self.signal(offer).await.into(),
            Ok(None) => VecDeque::new(),
            Err(err) => self.session.fail(err).into(),
        };

        loop {
            if self.apply(&mut pending).await {
                break;
            }

            let polling = self.session.status().polls_signaling();
            let streaming = self.sending.is_some();
            tokio::select! {
                result = in_flight(&mut self.sending), if streaming => {
                    self.sending = None;
                    pending.extend(self.on_sent(result));
                }
                _ = ticker.tick(), if polling => {
                    pending.extend(self.poll_signaling().await);
                }
                Some(event) = events.recv() => {
                    pending.extend(self.on_peer_event(event).await);
                }
                notice = notices.recv(), if notices_open => match notice {
                    Ok(notice) => pending.extend(self.on_notice(notice)),
                    Err(RecvError::Lagged(n)) => warn!("missed {} relay notices", n),
                    Err(RecvError::Closed) => notices_open = false,
                },
                Some(()) = close_rx.recv() => {
                    info!("close requested for session {}", self.session.session_id());
                    pending.push_back(Directive::Teardown);
                }
                else => pending.push_back(Directive::Teardown),
            }
        }

        let snapshot = self.session.snapshot();
        let record = self.session.record();
        if let Some(record) = &record {
            info!(
                "transfer {} {:?}: {} ({} bytes)",
                record.id, record.status, record.file_name, record.file_size
            );
        }
        TransferOutcome {
            snapshot,
            received: self.session.take_received_file(),
            record,
        }
    }

    /// Carry out queued directives. Returns `true` once torn down.
    async fn apply(&mut self, pending: &mut VecDeque<Directive>) -> bool {
        while let Some(directive) = pending.pop_front() {
            match directive {
                Directive::SendText(text) => {
                    if let Err(err) = self.sink.send_text(&text).await {
                        pending.extend(self.session.fail(err));
                    }
                }
                Directive::StartStreaming => match self.session.start_streaming() {
                    Ok(Some(metadata)) => {
                        let sink = self.sink.clone();
                        self.sending =
                            Some(Box::pin(async move { sink.send_text(&metadata).await }));
                    }
                    Ok(None) => {}
                    Err(err) => pending.extend(self.session.fail(err)),
                },
                Directive::Teardown => {
                    if self.sending.take().is_some() {
                        debug!("dropping in-flight send for teardown");
                    }
                    self.manager.teardown().await;
                    self.session.finish_teardown();
                    pending.clear();
                    return true;
                }
            }
        }
        false
    }

    /// One streaming send finished; queue the next chunk, if any.
    fn on_sent(&mut self, result: Result<()>) -> Vec<Directive> {
        if let Err(err) = result {
            return self.session.fail(err);
        }
        match self.session.next_chunk() {
            Ok(Some(chunk)) => {
                let sink = self.sink.clone();
                self.sending = Some(Box::pin(async move { sink.send_binary(chunk).await }));
                Vec::new()
            }
            Ok(None) => Vec::new(),
            Err(err) => self.session.fail(err),
        }
    }

    /// Forward one outgoing signaling message, remembering it for resend
    /// while the sender has no answer yet.
    async fn signal(&mut self, message: SignalingMessage) -> Vec<Directive> {
        if self.session.role() == Role::Sender && !self.manager.remote_description_set() {
            self.outbox.push(message.clone());
        }
        match self
            .signaling
            .send(self.session.session_id(), &message)
            .await
        {
            Ok(()) => Vec::new(),
            Err(err) if self.session.status() == ConnectionStatus::Connecting => {
                self.session.fail(err)
            }
            Err(err) => {
                debug!("dropping {} after connect: {}", message.kind(), err);
                Vec::new()
            }
        }
    }

    async fn poll_signaling(&mut self) -> Vec<Directive> {
        let mut directives = Vec::new();

        if self.resend && !self.manager.remote_description_set() {
            self.resend = false;
            debug!("resending {} signaling messages", self.outbox.len());
            for message in self.outbox.clone() {
                if let Err(err) = self.signaling.send(self.session.session_id(), &message).await {
                    return self.session.fail(err);
                }
            }
        }

        let messages = self
            .signaling
            .poll(self.session.session_id(), self.watermark);
        self.watermark += messages.len();

        for value in messages {
            let message = match SignalingMessage::from_value(value) {
                Ok(message) => message,
                Err(err) => return self.session.fail(err),
            };
            if self.session.role() == Role::Receiver
                && matches!(message, SignalingMessage::Offer { .. })
            {
                if let Some(sign) = sign_for_session(self.session.session_id()) {
                    self.session.set_zodiac(sign.name);
                }
            }
            match self.manager.handle_signal(message).await {
                Ok(Some(reply)) => directives.extend(self.signal(reply).await),
                Ok(None) => {}
                Err(err) => {
                    self.manager.mark_failed();
                    directives.extend(self.session.fail(err));
                }
            }
            if !directives.is_empty() {
                break;
            }
        }
        if self.manager.remote_description_set() {
            self.outbox.clear();
        }
        directives
    }

    async fn on_peer_event(&mut self, event: PeerEvent) -> Vec<Directive> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.signal(SignalingMessage::IceCandidate {
                    candidate: Some(candidate),
                })
                .await
            }
            PeerEvent::Transport(state) => {
                let directives = self.session.handle_transport_state(state);
                if self.session.status() == ConnectionStatus::Failed {
                    self.manager.mark_failed();
                }
                directives
            }
            PeerEvent::Channel(event) => {
                if event == ChannelEvent::Open {
                    self.manager.mark_connected();
                }
                self.session.handle_channel_event(event)
            }
        }
    }

    fn on_notice(&mut self, notice: RelayNotice) -> Vec<Directive> {
        match notice {
            RelayNotice::Joined(_) => Vec::new(),
            RelayNotice::Error {
                code: Some(RelayErrorCode::NoPeer),
                ..
            } => {
                if self.session.role() == Role::Sender && !self.manager.remote_description_set() {
                    info!("waiting for a receiver to join {}", self.session.session_id());
                    self.resend = true;
                }
                Vec::new()
            }
            RelayNotice::Error {
                code: Some(RelayErrorCode::AlreadyJoined),
                message,
            } => {
                debug!("repeated join: {}", message);
                Vec::new()
            }
            notice => match notice.to_error() {
                Some(err) => self.session.fail(err),
                None => Vec::new(),
            },
        }
    }
}
