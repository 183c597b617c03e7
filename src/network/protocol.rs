// Racelink wire protocol
// State packets travel on the "game" channel, control messages on "reliable"

use bincode::Options;
use serde::{Deserialize, Serialize};

/// Encoded size of a state packet: seven 32-bit signed integers
pub const STATE_PACKET_LEN: usize = 28;

/// One frame-state snapshot of the local peer's vehicle.
///
/// There is no sequence number: the newest packet to arrive always
/// overwrites the remote mirror, so loss and reordering are harmless.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePacket {
    /// Index of the road section the vehicle is on
    pub section: i32,
    /// Distance travelled into that section
    pub distance: i32,
    /// Lateral position across the road
    pub lateral: i32,
    /// Forward speed
    pub speed: i32,
    pub wheel_front_left: i32,
    pub wheel_front_right: i32,
    pub wheel_rear: i32,
}

// Native endianness, fixed-width integers: peers in a session are symmetric
fn packet_codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_native_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

impl StatePacket {
    pub fn from_fields(fields: [i32; 7]) -> Self {
        let [section, distance, lateral, speed, wheel_front_left, wheel_front_right, wheel_rear] =
            fields;
        Self {
            section,
            distance,
            lateral,
            speed,
            wheel_front_left,
            wheel_front_right,
            wheel_rear,
        }
    }

    pub fn fields(&self) -> [i32; 7] {
        [
            self.section,
            self.distance,
            self.lateral,
            self.speed,
            self.wheel_front_left,
            self.wheel_front_right,
            self.wheel_rear,
        ]
    }

    /// Serialize packet to its fixed 28-byte wire form
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        packet_codec().serialize(self)
    }

    /// Deserialize a packet, or `None` if the buffer is too short to hold one
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < STATE_PACKET_LEN {
            return None;
        }
        packet_codec().deserialize(&bytes[..STATE_PACKET_LEN]).ok()
    }
}

/// Last known state of the remote peer's vehicle
#[derive(Debug, Default, Clone)]
pub struct RemoteMirror {
    latest: Option<StatePacket>,
}

impl RemoteMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and apply raw packet bytes. Short buffers leave the mirror untouched.
    pub fn apply(&mut self, bytes: &[u8]) -> bool {
        match StatePacket::from_bytes(bytes) {
            Some(packet) => {
                self.overwrite(packet);
                true
            }
            None => false,
        }
    }

    pub fn overwrite(&mut self, packet: StatePacket) {
        self.latest = Some(packet);
    }

    pub fn latest(&self) -> Option<&StatePacket> {
        self.latest.as_ref()
    }
}

/// Low-frequency messages carried on the reliable channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Course selected by the host; also the "race is starting" signal
    Track {
        #[serde(rename = "trackIndex")]
        track_index: u32,
    },

    /// Local race ended
    Finished,

    /// Voluntary session termination
    Quit,

    /// Any `type` this build does not know about
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Serialize message to its JSON text form
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize message from channel bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
