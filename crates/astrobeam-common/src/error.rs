//! Common error types for AstroBeam.

use thiserror::Error;

/// Result type alias using AstroBeam's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for AstroBeam operations.
///
/// Every variant except [`Error::NoPeer`] ends the transfer session it
/// occurs in.
#[derive(Debug, Error)]
pub enum Error {
    /// The signaling socket is not open
    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),

    /// Session id absent, of the wrong type, or malformed
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// Signal sent on a connection that never joined a session
    #[error("session not joined")]
    NotJoined,

    /// Signal sent without a payload
    #[error("missing signaling payload")]
    MissingPayload,

    /// Nobody else is in the session yet (advisory)
    #[error("no other peer connected to this session")]
    NoPeer,

    /// Session description or candidate could not be applied
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// Transport reported a fault
    #[error("channel error: {0}")]
    Channel(String),

    /// Local file read failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload kind or size broke the data-channel protocol
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a signaling-unavailable error from any displayable type.
    pub fn signaling_unavailable(msg: impl std::fmt::Display) -> Self {
        Self::SignalingUnavailable(msg.to_string())
    }

    /// Create an invalid-session error from any displayable type.
    pub fn invalid_session(msg: impl std::fmt::Display) -> Self {
        Self::InvalidSession(msg.to_string())
    }

    /// Create a negotiation error from any displayable type.
    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    /// Create a channel error from any displayable type.
    pub fn channel(msg: impl std::fmt::Display) -> Self {
        Self::Channel(msg.to_string())
    }

    /// Create a protocol violation from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::ProtocolViolation(msg.to_string())
    }

    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// `NoPeer` is the only condition a session survives.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NoPeer)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
