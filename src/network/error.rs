// Error taxonomy for signaling, peer link and session layers

use thiserror::Error;

use super::transport::ChannelKind;

/// Failures talking to the room service
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling service unavailable: {0}")]
    Unavailable(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("signaling request rejected with status {status}")]
    Rejected { status: u16 },

    #[error("malformed signaling payload: {0}")]
    Malformed(String),
}

/// Failures of the underlying peer link
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0} channel is not open")]
    ChannelNotOpen(ChannelKind),
}

impl From<str0m::RtcError> for LinkError {
    fn from(e: str0m::RtcError) -> Self {
        LinkError::Transport(e.to_string())
    }
}

/// Errors surfaced to the session owner by host/join/connect/send
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error("peer link negotiation failed: {0}")]
    LinkNegotiationFailed(LinkError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("a session is already in progress; call cleanup() first")]
    Busy,

    #[error("session is not connected")]
    NotConnected,
}
