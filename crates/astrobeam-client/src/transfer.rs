//! Transfer state machine.
//!
//! `TransferSession` owns the status of one file transfer. It is fed typed
//! channel and transport events and answers with [`Directive`]s for the
//! caller to carry out, so the whole protocol runs without a live
//! connection.
//!
//! ```text
//! Idle -> Connecting -> Connected -> Transferring -> Completed
//!            \______________\_____________\-------> Failed | Closed
//! ```

use astrobeam_common::file_transfer::OutgoingFile;
use astrobeam_common::helpers::progress_percent;
use astrobeam_common::{Error, FileMetadata, Result, TRANSFER_COMPLETE};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Transferring,
    Completed,
    Failed,
    Closed,
}

impl ConnectionStatus {
    /// No further transitions except `Closed` from a non-final state.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Closed)
    }

    /// Whether relayed signaling still needs to be polled.
    pub fn polls_signaling(self) -> bool {
        !matches!(self, Self::Completed | Self::Closed)
    }
}

/// Underlying peer transport state, as reported by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Close,
    Error(String),
    Message(ChannelMessage),
}

/// Work the session asks its driver to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    SendText(String),
    StartStreaming,
    Teardown,
}

/// What presentation code observes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferSnapshot {
    pub status: ConnectionStatus,
    /// Percent, `0.0..=100.0`.
    pub progress: f64,
    pub error: Option<String>,
    pub metadata: Option<FileMetadata>,
    /// Zodiac name shown next to the session code.
    pub zodiac: Option<&'static str>,
}

/// Outgoing side of the data channel.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<()>;
    async fn send_binary(&self, data: Bytes) -> Result<()>;
}

/// A fully received file, assembled in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
}

/// History entry handed to whoever persists transfer history.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub role: Role,
    pub file_name: String,
    pub file_size: u64,
    pub status: ConnectionStatus,
    pub timestamp: DateTime<Utc>,
    pub zodiac: Option<String>,
}

pub struct TransferSession {
    role: Role,
    session_id: String,
    snapshot: watch::Sender<TransferSnapshot>,
    outgoing: Option<OutgoingFile>,
    chunks: Vec<Bytes>,
    received_bytes: u64,
    received: Option<ReceivedFile>,
}

impl TransferSession {
    pub fn sender(session_id: impl Into<String>, file: OutgoingFile) -> Self {
        let metadata = file.metadata().clone();
        let session = Self::new(Role::Sender, session_id.into(), Some(file));
        session.snapshot.send_modify(|s| s.metadata = Some(metadata));
        session
    }

    pub fn receiver(session_id: impl Into<String>) -> Self {
        Self::new(Role::Receiver, session_id.into(), None)
    }

    fn new(role: Role, session_id: String, outgoing: Option<OutgoingFile>) -> Self {
        let (snapshot, _) = watch::channel(TransferSnapshot::default());
        Self {
            role,
            session_id,
            snapshot,
            outgoing,
            chunks: Vec::new(),
            received_bytes: 0,
            received: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.snapshot.borrow().status
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn set_zodiac(&mut self, name: &'static str) {
        self.snapshot.send_modify(|s| s.zodiac = Some(name));
    }

    /// A peer connection now exists.
    pub fn mark_connecting(&mut self) {
        if self.status() == ConnectionStatus::Idle {
            self.set_status(ConnectionStatus::Connecting);
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        debug!(
            "session {} status {:?} -> {:?}",
            self.session_id,
            self.status(),
            status
        );
        self.snapshot.send_modify(|s| s.status = status);
    }

    pub fn handle_channel_event(&mut self, event: ChannelEvent) -> Vec<Directive> {
        match event {
            ChannelEvent::Open => {
                if self.status().is_final() {
                    return Vec::new();
                }
                info!("data channel open for session {}", self.session_id);
                self.set_status(ConnectionStatus::Connected);
                if self.role == Role::Sender && self.outgoing.is_some() {
                    vec![Directive::StartStreaming]
                } else {
                    Vec::new()
                }
            }
            ChannelEvent::Close => {
                debug!("data channel closed for session {}", self.session_id);
                if self.status() == ConnectionStatus::Closed {
                    Vec::new()
                } else {
                    vec![Directive::Teardown]
                }
            }
            ChannelEvent::Error(message) => self.fail(Error::channel(message)),
            ChannelEvent::Message(message) => {
                let status = self.status();
                if status.is_final() {
                    debug!("dropping channel message after {:?}", status);
                    return Vec::new();
                }
                match self.role {
                    Role::Sender => self.on_sender_message(message),
                    Role::Receiver => self.on_receiver_message(message),
                }
            }
        }
    }

    pub fn handle_transport_state(&mut self, state: TransportState) -> Vec<Directive> {
        match state {
            TransportState::Failed => self.fail(Error::channel("peer connection failed")),
            TransportState::Disconnected | TransportState::Closed => {
                if self.status() == ConnectionStatus::Closed {
                    Vec::new()
                } else {
                    info!("peer transport {:?}; tearing down", state);
                    vec![Directive::Teardown]
                }
            }
            other => {
                debug!("peer transport {:?}", other);
                Vec::new()
            }
        }
    }

    /// Record a terminal error. Advisory errors and errors arriving after
    /// the session already ended are logged and dropped.
    pub fn fail(&mut self, err: Error) -> Vec<Directive> {
        if !err.is_terminal() {
            warn!("session {}: {}", self.session_id, err);
            return Vec::new();
        }
        let status = self.status();
        if status.is_final() {
            debug!("ignoring error after {:?}: {}", status, err);
            return Vec::new();
        }

        error!("transfer in session {} failed: {}", self.session_id, err);
        let message = err.to_string();
        self.snapshot.send_modify(|s| {
            s.status = ConnectionStatus::Failed;
            s.error = Some(message);
        });
        vec![Directive::Teardown]
    }

    fn on_sender_message(&mut self, message: ChannelMessage) -> Vec<Directive> {
        match message {
            ChannelMessage::Text(text) if text == TRANSFER_COMPLETE => {
                if self.status() != ConnectionStatus::Transferring {
                    warn!("acknowledgment before transfer started; ignoring");
                    return Vec::new();
                }
                info!("receiver acknowledged session {}", self.session_id);
                self.snapshot.send_modify(|s| {
                    s.status = ConnectionStatus::Completed;
                    s.progress = 100.0;
                });
                vec![Directive::Teardown]
            }
            ChannelMessage::Text(text) => {
                warn!("unexpected text from receiver: {:?}", text);
                Vec::new()
            }
            ChannelMessage::Binary(data) => self.fail(Error::protocol(format!(
                "sender received {} unexpected binary bytes",
                data.len()
            ))),
        }
    }

    fn on_receiver_message(&mut self, message: ChannelMessage) -> Vec<Directive> {
        match message {
            ChannelMessage::Text(text) => {
                let metadata = match FileMetadata::decode(&text) {
                    Ok(metadata) => metadata,
                    Err(err) => return self.fail(err),
                };
                info!(
                    "incoming {} ({} bytes, {})",
                    metadata.name, metadata.size, metadata.mime_type
                );
                self.chunks.clear();
                self.received_bytes = 0;
                self.received = None;
                let empty = metadata.size == 0;
                self.snapshot.send_modify(|s| {
                    s.status = ConnectionStatus::Transferring;
                    s.progress = 0.0;
                    s.metadata = Some(metadata);
                });
                if empty {
                    self.complete_receive()
                } else {
                    Vec::new()
                }
            }
            ChannelMessage::Binary(data) => {
                let declared = self.snapshot.borrow().metadata.as_ref().map(|m| m.size);
                let Some(declared) = declared else {
                    return self.fail(Error::protocol("binary chunk before file metadata"));
                };

                self.received_bytes += data.len() as u64;
                self.chunks.push(data);
                if self.received_bytes > declared {
                    return self.fail(Error::protocol(format!(
                        "received {} bytes, expected {}",
                        self.received_bytes, declared
                    )));
                }

                let progress = progress_percent(self.received_bytes, declared);
                self.snapshot.send_modify(|s| s.progress = progress);
                if self.received_bytes == declared {
                    self.complete_receive()
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn complete_receive(&mut self) -> Vec<Directive> {
        let metadata = self.snapshot.borrow().metadata.clone();
        let Some(metadata) = metadata else {
            return Vec::new();
        };
        let mut data = BytesMut::with_capacity(self.received_bytes as usize);
        for chunk in self.chunks.drain(..) {
            data.extend_from_slice(&chunk);
        }
        info!(
            "received {} ({} bytes) in session {}",
            metadata.name, self.received_bytes, self.session_id
        );
        self.received = Some(ReceivedFile {
            metadata,
            data: data.freeze(),
        });
        self.snapshot.send_modify(|s| {
            s.status = ConnectionStatus::Completed;
            s.progress = 100.0;
        });
        // teardown waits for the sender to close the channel
        vec![Directive::SendText(TRANSFER_COMPLETE.to_string())]
    }

    /// Move a connected sender into `Transferring`. Returns the metadata
    /// text to send first, or `None` when there is nothing to stream.
    pub fn start_streaming(&mut self) -> Result<Option<String>> {
        let status = self.status();
        if self.role != Role::Sender || status != ConnectionStatus::Connected {
            warn!("not streaming in {:?} as {:?}", status, self.role);
            return Ok(None);
        }
        let Some(file) = self.outgoing.as_ref() else {
            return Err(Error::config("no file selected"));
        };

        let metadata = file.metadata().clone();
        self.set_status(ConnectionStatus::Transferring);
        info!(
            "sending {} ({} bytes, {} chunks)",
            metadata.name,
            metadata.size,
            metadata.chunk_count()
        );
        metadata.encode().map(Some)
    }

    /// Record everything handed over so far and read the next chunk.
    /// `None` once the file is exhausted or the session left `Transferring`.
    pub fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.status() != ConnectionStatus::Transferring {
            return Ok(None);
        }
        let Some(file) = self.outgoing.as_mut() else {
            return Ok(None);
        };

        let progress = progress_percent(file.bytes_read(), file.metadata().size);
        self.snapshot.send_modify(|s| s.progress = progress);
        let chunk = file.next_chunk()?;
        if chunk.is_none() {
            debug!("all chunks handed to the channel; awaiting acknowledgment");
        }
        Ok(chunk)
    }

    /// Drop buffered data and settle into `Closed`, unless the session
    /// already completed or failed. Safe to call repeatedly.
    pub fn finish_teardown(&mut self) {
        self.chunks.clear();
        self.outgoing = None;
        if !self.status().is_final() {
            self.set_status(ConnectionStatus::Closed);
        }
    }

    pub fn received_file(&self) -> Option<&ReceivedFile> {
        self.received.as_ref()
    }

    pub fn take_received_file(&mut self) -> Option<ReceivedFile> {
        self.received.take()
    }

    /// History entry for a completed or failed transfer.
    pub fn record(&self) -> Option<TransferRecord> {
        let snapshot = self.snapshot.borrow();
        if !matches!(
            snapshot.status,
            ConnectionStatus::Completed | ConnectionStatus::Failed
        ) {
            return None;
        }
        let metadata = snapshot.metadata.as_ref();
        Some(TransferRecord {
            id: Uuid::new_v4(),
            role: self.role,
            file_name: metadata.map(|m| m.name.clone()).unwrap_or_default(),
            file_size: metadata.map_or(0, |m| m.size),
            status: snapshot.status,
            timestamp: Utc::now(),
            zodiac: snapshot.zodiac.map(str::to_string),
        })
    }
}
