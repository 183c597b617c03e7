// P2P networking module for racelink
// Handles room signaling, the WebRTC peer link and the session state machine

pub mod client;
pub mod error;
pub mod link;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod webrtc_link;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ClientOptions, NetworkClient, WebRtcClient};
pub use error::{LinkError, SessionError, SignalingError};
pub use protocol::{ControlMessage, RemoteMirror, StatePacket, STATE_PACKET_LEN};
pub use session::{CloseReason, ConnectionState, Role, SessionEvent};
pub use signaling::{Envelope, HttpSignaling, RoomCode, Signaling};
pub use transport::{ChannelKind, ChannelState};
