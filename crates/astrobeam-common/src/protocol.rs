use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Size of one binary chunk on the data channel.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Text payload the receiver sends once the whole file has arrived.
pub const TRANSFER_COMPLETE: &str = "transfer_complete";

/// Label of the data channel the sender opens.
pub const DATA_CHANNEL_LABEL: &str = "file-transfer";

/// Connection-setup message exchanged through the relay.
///
/// The relay never looks inside these; only peers decode them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    /// `None` marks the end of the remote candidate stream.
    IceCandidate { candidate: Option<IceCandidate> },
}

impl SignalingMessage {
    /// Decode a relayed payload. Unknown tags or missing fields are a
    /// protocol violation, never silently skipped.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|err| Error::protocol(format!("unrecognised signaling message: {err}")))
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// Network candidate in the browser's `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Frames a client sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Join {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Signal {
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: Value,
    },
}

/// Frames the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayFrame {
    Joined {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Signal {
        message: Value,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<RelayErrorCode>,
    },
}

impl RelayFrame {
    pub fn error(code: RelayErrorCode, error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            code: Some(code),
        }
    }
}

/// Machine-readable reason attached to relay `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayErrorCode {
    InvalidSession,
    NotJoined,
    MissingPayload,
    NoPeer,
    AlreadyJoined,
    Malformed,
}

impl RelayErrorCode {
    /// Client-side error matching a relay report.
    pub fn into_error(self, message: &str) -> Error {
        match self {
            Self::InvalidSession => Error::invalid_session(message),
            Self::NotJoined => Error::NotJoined,
            Self::MissingPayload => Error::MissingPayload,
            Self::NoPeer => Error::NoPeer,
            Self::AlreadyJoined | Self::Malformed => Error::protocol(message),
        }
    }
}

/// First text payload on an opened data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    /// Mime type; serialized as `type` for browser peers.
    #[serde(rename = "type")]
    pub mime_type: String,
}

impl FileMetadata {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| Error::protocol(format!("invalid file metadata: {err}")))
    }

    /// Number of binary messages a file of this size is split into.
    pub fn chunk_count(&self) -> u64 {
        self.size.div_ceil(CHUNK_SIZE as u64)
    }
}
