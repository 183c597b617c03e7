// Dual-channel transport bookkeeping
// One unreliable channel for state packets, one reliable channel for control

use std::fmt;

/// Label of the unordered, zero-retransmit channel carrying state packets
pub const GAME_LABEL: &str = "game";

/// Label of the ordered, reliable channel carrying control messages
pub const RELIABLE_LABEL: &str = "reliable";

/// The two logical channels multiplexed over one peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Unreliable,
    Reliable,
}

impl ChannelKind {
    pub fn label(self) -> &'static str {
        match self {
            ChannelKind::Unreliable => GAME_LABEL,
            ChannelKind::Reliable => RELIABLE_LABEL,
        }
    }

    /// Demultiplex an inbound channel by its exact label
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            GAME_LABEL => Some(ChannelKind::Unreliable),
            RELIABLE_LABEL => Some(ChannelKind::Reliable),
            _ => None,
        }
    }

    /// State packets are binary, control messages are text
    pub fn is_binary(self) -> bool {
        matches!(self, ChannelKind::Unreliable)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelState {
    #[default]
    Connecting,
    Open,
    Closed,
}

/// Independent lifecycle of both channels
#[derive(Debug, Default, Clone)]
pub struct Channels {
    unreliable: ChannelState,
    reliable: ChannelState,
}

impl Channels {
    pub fn state(&self, kind: ChannelKind) -> ChannelState {
        match kind {
            ChannelKind::Unreliable => self.unreliable,
            ChannelKind::Reliable => self.reliable,
        }
    }

    /// Set a channel's state, returning the previous one
    pub fn set(&mut self, kind: ChannelKind, state: ChannelState) -> ChannelState {
        let slot = match kind {
            ChannelKind::Unreliable => &mut self.unreliable,
            ChannelKind::Reliable => &mut self.reliable,
        };
        std::mem::replace(slot, state)
    }

    pub fn is_open(&self, kind: ChannelKind) -> bool {
        self.state(kind) == ChannelState::Open
    }

    pub fn close_all(&mut self) {
        self.unreliable = ChannelState::Closed;
        self.reliable = ChannelState::Closed;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
