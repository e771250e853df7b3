//! Session table.
//!
//! Maps a session id to the endpoints currently joined under it:
//! - a session is created by the first `join`
//! - it is removed when its last endpoint leaves
//! - two endpoints is the client convention, not enforced here

use std::collections::HashMap;
use std::sync::Arc;

use astrobeam_common::RelayFrame;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Identifies one relay connection for its whole lifetime.
pub type ConnectionId = Uuid;

/// One joined socket: its id and the queue feeding its writer task.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<RelayFrame>,
}

impl Endpoint {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<RelayFrame>) -> Self {
        Self { id, tx }
    }
}

pub type SharedSessions = Arc<RwLock<SessionTable>>;

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<String, Vec<Endpoint>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedSessions {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Register `endpoint` under `session_id`. Returns the endpoint count
    /// after joining.
    pub fn join(&mut self, session_id: &str, endpoint: Endpoint) -> usize {
        let peers = self.sessions.entry(session_id.to_string()).or_default();
        if !peers.iter().any(|peer| peer.id == endpoint.id) {
            peers.push(endpoint);
        }
        peers.len()
    }

    /// Remove a connection. Returns `true` if that emptied and deleted the
    /// session.
    pub fn leave(&mut self, session_id: &str, id: ConnectionId) -> bool {
        let Some(peers) = self.sessions.get_mut(session_id) else {
            return false;
        };
        peers.retain(|peer| peer.id != id);
        if peers.is_empty() {
            self.sessions.remove(session_id);
            true
        } else {
            false
        }
    }

    /// Queue `frame` for every endpoint in the session except `from`.
    /// Returns how many endpoints accepted it.
    pub fn relay(&self, session_id: &str, from: ConnectionId, frame: &RelayFrame) -> usize {
        let Some(peers) = self.sessions.get(session_id) else {
            return 0;
        };
        peers
            .iter()
            .filter(|peer| peer.id != from)
            .filter(|peer| peer.tx.try_send(frame.clone()).is_ok())
            .count()
    }

    pub fn endpoint_count(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map_or(0, Vec::len)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Endpoints across all sessions.
    pub fn total_endpoints(&self) -> usize {
        self.sessions.values().map(Vec::len).sum()
    }
}
