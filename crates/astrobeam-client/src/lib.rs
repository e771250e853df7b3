#![forbid(unsafe_code)]

//! Peer side of AstroBeam.
//!
//! A participant connects to the relay with [`SignalingClient`], then
//! starts a transfer with [`start_send`] or [`start_receive`]. Bytes flow
//! directly between peers over a WebRTC data channel.

pub mod driver;
pub mod peer;
pub mod rtc;
pub mod signaling;
pub mod transfer;

pub use driver::{
    spawn_transfer, start_receive, start_send, TransferConfig, TransferHandle, TransferOutcome,
    DEFAULT_ICE_SERVERS,
};
pub use peer::{IceCandidateQueue, PeerConnectionManager, PeerEvent, PeerState, RtcPeer};
pub use rtc::WebRtcPeer;
pub use signaling::{RelayNotice, SignalingClient};
pub use transfer::{
    ChannelEvent, ChannelMessage, ChannelSink, ConnectionStatus, Directive, ReceivedFile, Role,
    TransferRecord, TransferSession, TransferSnapshot, TransportState,
};
