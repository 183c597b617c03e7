// Signaling client for the HTTP room service
// Rooms are mailbox pairs used only while the peers negotiate

use std::fmt;
use std::future::Future;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::SignalingError;

/// Length of a room code
pub const ROOM_CODE_LEN: usize = 4;

/// Identifier of one side's mailbox within a room
pub type PeerId = String;

/// Short room identifier, always stored uppercase
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomCode(String);

impl RoomCode {
    /// Normalize user input: trims, uppercases, requires 4 ASCII alphanumerics
    pub fn parse(raw: &str) -> Option<Self> {
        let code = raw.trim().to_ascii_uppercase();
        let valid = code.len() == ROOM_CODE_LEN && code.chars().all(|c| c.is_ascii_alphanumeric());
        valid.then_some(RoomCode(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One signaling message unit exchanged through the room mailboxes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// The joiner entered the room (posted by the service to the host)
    Joined,

    Offer { sdp: String },

    Answer { sdp: String },

    Ice { candidate: String },

    /// Unrecognized `type`, always safe to ignore
    #[serde(other)]
    Unknown,
}

impl Envelope {
    /// Short name for logging without dumping SDP bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Joined => "joined",
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::Ice { .. } => "ice",
            Envelope::Unknown => "unknown",
        }
    }
}

/// Decode a poll batch one envelope at a time, dropping malformed entries
pub fn decode_batch(messages: Vec<serde_json::Value>) -> Vec<Envelope> {
    messages
        .into_iter()
        .filter_map(|raw| match serde_json::from_value::<Envelope>(raw) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!("Dropping malformed envelope: {}", e);
                None
            }
        })
        .collect()
}

/// Response to `POST /rooms`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub code: String,
    pub host_id: PeerId,
}

/// Response to `POST /rooms/{code}/join`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    pub joiner_id: PeerId,
}

/// Response to `GET /rooms/{code}/peer/{peerId}`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

/// Acknowledgement of a posted envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

/// Room assignment returned to the host
#[derive(Debug, Clone)]
pub struct RoomGrant {
    pub code: RoomCode,
    pub peer_id: PeerId,
}

/// Request/response access to a room service
pub trait Signaling {
    fn create_room(&self) -> impl Future<Output = Result<RoomGrant, SignalingError>> + Send;

    fn join_room(
        &self,
        code: &RoomCode,
    ) -> impl Future<Output = Result<PeerId, SignalingError>> + Send;

    /// Post an envelope from `peer_id` to the other side of the room
    fn send(
        &self,
        code: &RoomCode,
        peer_id: &PeerId,
        envelope: &Envelope,
    ) -> impl Future<Output = Result<(), SignalingError>> + Send;

    /// Drain every envelope waiting in `peer_id`'s mailbox
    fn poll(
        &self,
        code: &RoomCode,
        peer_id: &PeerId,
    ) -> impl Future<Output = Result<Vec<Envelope>, SignalingError>> + Send;
}

/// Room service client over HTTP
#[derive(Debug, Clone)]
pub struct HttpSignaling {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSignaling {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn peer_url(&self, code: &RoomCode, peer_id: &PeerId) -> String {
        self.url(&format!("/rooms/{}/peer/{}", code, peer_id))
    }
}

fn unavailable(e: reqwest::Error) -> SignalingError {
    SignalingError::Unavailable(e.to_string())
}

fn malformed(e: reqwest::Error) -> SignalingError {
    SignalingError::Malformed(e.to_string())
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SignalingError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(SignalingError::Rejected {
            status: status.as_u16(),
        })
    }
}

impl Signaling for HttpSignaling {
    async fn create_room(&self) -> Result<RoomGrant, SignalingError> {
        let response = self
            .http
            .post(self.url("/rooms"))
            .send()
            .await
            .map_err(unavailable)?;
        let body: CreateRoomResponse = check_status(response)?.json().await.map_err(malformed)?;

        let code = RoomCode::parse(&body.code)
            .ok_or_else(|| SignalingError::Malformed(format!("bad room code {:?}", body.code)))?;
        debug!("Created room {} as {}", code, body.host_id);
        Ok(RoomGrant {
            code,
            peer_id: body.host_id,
        })
    }

    async fn join_room(&self, code: &RoomCode) -> Result<PeerId, SignalingError> {
        let response = self
            .http
            .post(self.url(&format!("/rooms/{}/join", code)))
            .send()
            .await
            .map_err(unavailable)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SignalingError::RoomNotFound(code.to_string()));
        }
        let body: JoinRoomResponse = check_status(response)?.json().await.map_err(malformed)?;

        debug!("Joined room {} as {}", code, body.joiner_id);
        Ok(body.joiner_id)
    }

    async fn send(
        &self,
        code: &RoomCode,
        peer_id: &PeerId,
        envelope: &Envelope,
    ) -> Result<(), SignalingError> {
        let response = self
            .http
            .post(self.peer_url(code, peer_id))
            .json(envelope)
            .send()
            .await
            .map_err(unavailable)?;
        check_status(response)?;
        Ok(())
    }

    async fn poll(&self, code: &RoomCode, peer_id: &PeerId) -> Result<Vec<Envelope>, SignalingError> {
        let response = self
            .http
            .get(self.peer_url(code, peer_id))
            .send()
            .await
            .map_err(unavailable)?;
        let body: PollResponse = check_status(response)?.json().await.map_err(malformed)?;
        Ok(decode_batch(body.messages))
    }
}
