// Peer link abstraction
// The session drives negotiation through this seam; WebRtcLink is the real one

use std::future::Future;
use std::time::Duration;

use super::error::LinkError;
use super::transport::ChannelKind;

/// Notifications raised by a peer link while it is driven
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A local ICE candidate worth announcing to the remote side
    LocalCandidate(String),

    /// A logical channel finished opening (matched by label)
    ChannelOpen(ChannelKind),

    /// Payload received on a logical channel
    ChannelData(ChannelKind, Vec<u8>),

    /// A logical channel closed
    ChannelClose(ChannelKind),

    /// Connectivity to the remote peer was lost
    Disconnected,
}

/// One underlying peer connection carrying both logical channels
pub trait PeerLink {
    /// Host side: create both channels and produce an SDP offer
    fn create_offer(&mut self) -> Result<String, LinkError>;

    /// Joiner side: apply the remote offer and produce an SDP answer
    fn accept_offer(&mut self, sdp: &str) -> Result<String, LinkError>;

    /// Host side: apply the remote answer
    fn accept_answer(&mut self, sdp: &str) -> Result<(), LinkError>;

    /// Apply a remote candidate. Only valid once a remote description is set.
    fn add_remote_candidate(&mut self, candidate: &str) -> Result<(), LinkError>;

    fn send(&mut self, kind: ChannelKind, data: &[u8]) -> Result<(), LinkError>;

    /// Next pending link notification, if any
    fn poll_event(&mut self) -> Option<LinkEvent>;

    /// Perform network I/O for at most `budget`
    fn drive(&mut self, budget: Duration) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn close(&mut self);
}

/// Creates a fresh link for every session
pub trait LinkFactory {
    type Link: PeerLink + Send;

    fn create(&mut self) -> impl Future<Output = Result<Self::Link, LinkError>> + Send;
}
