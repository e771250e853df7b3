//! Signaling transport adapter.
//!
//! One WebSocket to the relay, shared by every session on this participant.
//! Relayed payloads are appended to a per-session buffer that is only ever
//! read by offset; consumers keep their own watermark.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use astrobeam_common::{ClientFrame, Error, RelayErrorCode, RelayFrame, Result, SignalingMessage};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};

const OUTBOX_CAPACITY: usize = 64;
const NOTICE_CAPACITY: usize = 32;

/// Relay frames that are not signaling payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayNotice {
    Joined(String),
    Error {
        code: Option<RelayErrorCode>,
        message: String,
    },
}

impl RelayNotice {
    /// The client-side error for an `Error` notice.
    pub fn to_error(&self) -> Option<Error> {
        match self {
            Self::Joined(_) => None,
            Self::Error {
                code: Some(code),
                message,
            } => Some(code.into_error(message)),
            Self::Error {
                code: None,
                message,
            } => Some(Error::protocol(message)),
        }
    }
}

#[derive(Default)]
struct Inbox {
    open: AtomicBool,
    buffers: Mutex<HashMap<String, Vec<Value>>>,
}

impl Inbox {
    fn append(&self, session_id: &str, message: Value) {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(buffer_key(session_id))
            .or_default()
            .push(message);
    }
}

fn buffer_key(session_id: &str) -> String {
    session_id.trim().to_lowercase()
}

pub struct SignalingClient {
    inbox: Arc<Inbox>,
    outbox: mpsc::Sender<String>,
    notices: broadcast::Sender<RelayNotice>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|err| Error::signaling_unavailable(format!("{url}: {err}")))?;
        info!("connected to signaling relay: {}", url);

        let (mut write, mut read) = ws.split();
        let (outbox, mut outbox_rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let inbox = Arc::new(Inbox::default());
        inbox.open.store(true, Ordering::SeqCst);

        let writer_inbox = inbox.clone();
        let writer = tokio::spawn(async move {
            while let Some(text) = outbox_rx.recv().await {
                if let Err(err) = write.send(WsMessage::Text(text)).await {
                    error!("failed to send signaling frame: {}", err);
                    break;
                }
            }
            writer_inbox.open.store(false, Ordering::SeqCst);
            let _ = write.close().await;
        });

        let reader_inbox = inbox.clone();
        let reader_notices = notices.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        let frame: RelayFrame = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!("failed to parse relay frame: {}", err);
                                continue;
                            }
                        };
                        match frame {
                            RelayFrame::Signal {
                                message,
                                session_id,
                            } => {
                                debug!("signal for session {}", session_id);
                                reader_inbox.append(&session_id, message);
                            }
                            RelayFrame::Joined { session_id } => {
                                info!("joined session {}", session_id);
                                let _ = reader_notices.send(RelayNotice::Joined(session_id));
                            }
                            RelayFrame::Error { error, code } => {
                                if code == Some(RelayErrorCode::NoPeer) {
                                    debug!("relay: {}", error);
                                } else {
                                    warn!("relay error: {}", error);
                                }
                                let _ = reader_notices.send(RelayNotice::Error {
                                    code,
                                    message: error,
                                });
                            }
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("signaling socket error: {}", err);
                        break;
                    }
                }
            }
            reader_inbox.open.store(false, Ordering::SeqCst);
            info!("signaling relay connection closed");
        });

        Ok(Self {
            inbox,
            outbox,
            notices,
            reader,
            writer,
        })
    }

    pub fn is_open(&self) -> bool {
        self.inbox.open.load(Ordering::SeqCst)
    }

    /// Relay notices (joins and errors) from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayNotice> {
        self.notices.subscribe()
    }

    async fn transmit(&self, frame: &ClientFrame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::signaling_unavailable("relay connection is not open"));
        }
        let text = serde_json::to_string(frame)?;
        self.outbox
            .send(text)
            .await
            .map_err(|_| Error::signaling_unavailable("relay connection is not open"))
    }

    pub async fn join(&self, session_id: &str) -> Result<()> {
        self.transmit(&ClientFrame::Join {
            session_id: session_id.to_string(),
        })
        .await
    }

    pub async fn send(&self, session_id: &str, message: &SignalingMessage) -> Result<()> {
        debug!("sending {} for session {}", message.kind(), session_id);
        self.transmit(&ClientFrame::Signal {
            session_id: Some(session_id.to_string()),
            message: message.to_value()?,
        })
        .await
    }

    /// Buffered messages for `session_id` from index `from` on, oldest first.
    pub fn poll(&self, session_id: &str, from: usize) -> Vec<Value> {
        let buffers = self
            .inbox
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        buffers
            .get(&buffer_key(session_id))
            .map(|buffer| buffer.get(from..).unwrap_or_default().to_vec())
            .unwrap_or_default()
    }

    /// Stop both socket tasks. Later `send`/`join` calls fail.
    pub fn close(&self) {
        self.inbox.open.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
