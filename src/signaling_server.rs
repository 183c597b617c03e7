// Room service for the signaling contract
// Each room holds one mailbox per peer and lives only for the negotiation window

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::network::signaling::{Ack, CreateRoomResponse, JoinRoomResponse, PollResponse, ROOM_CODE_LEN};

const ROOM_CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("room not found")]
    NotFound,

    #[error("room already has a joiner")]
    Full,

    #[error("peer is not part of this room")]
    UnknownPeer,

    #[error("message must be a JSON object with a string type")]
    BadMessage,
}

impl RoomError {
    pub fn status(&self) -> StatusCode {
        match self {
            RoomError::NotFound => StatusCode::NOT_FOUND,
            RoomError::Full => StatusCode::CONFLICT,
            RoomError::UnknownPeer => StatusCode::FORBIDDEN,
            RoomError::BadMessage => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for RoomError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

struct Room {
    host_id: String,
    joiner_id: Option<String>,
    host_inbox: Vec<Value>,
    joiner_inbox: Vec<Value>,
    created_at: Instant,
}

impl Room {
    fn inbox_of(&mut self, peer_id: &str) -> Option<&mut Vec<Value>> {
        if peer_id == self.host_id {
            Some(&mut self.host_inbox)
        } else if self.joiner_id.as_deref() == Some(peer_id) {
            Some(&mut self.joiner_inbox)
        } else {
            None
        }
    }

    // Joiner inbox exists from creation so the host may post before the join
    fn inbox_opposite(&mut self, peer_id: &str) -> Option<&mut Vec<Value>> {
        if peer_id == self.host_id {
            Some(&mut self.joiner_inbox)
        } else if self.joiner_id.as_deref() == Some(peer_id) {
            Some(&mut self.host_inbox)
        } else {
            None
        }
    }
}

/// All live rooms, expired lazily on access
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    ttl: Duration,
}

impl RoomRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            rooms: HashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Open a room and return `(code, host_id)`
    pub fn create(&mut self) -> (String, String) {
        self.purge_expired();
        let mut rng = rand::thread_rng();

        let code = loop {
            let candidate: String = (0..ROOM_CODE_LEN)
                .map(|_| ROOM_CODE_CHARS[rng.gen_range(0..ROOM_CODE_CHARS.len())] as char)
                .collect();
            if !self.rooms.contains_key(&candidate) {
                break candidate;
            }
        };
        let host_id = peer_id(&mut rng);

        self.rooms.insert(
            code.clone(),
            Room {
                host_id: host_id.clone(),
                joiner_id: None,
                host_inbox: Vec::new(),
                joiner_inbox: Vec::new(),
                created_at: Instant::now(),
            },
        );
        (code, host_id)
    }

    /// Admit the single joiner and tell the host about it
    pub fn join(&mut self, code: &str) -> Result<String, RoomError> {
        let room = self.live_room(code)?;
        if room.joiner_id.is_some() {
            return Err(RoomError::Full);
        }

        let mut rng = rand::thread_rng();
        let joiner_id = loop {
            let id = peer_id(&mut rng);
            if id != room.host_id {
                break id;
            }
        };
        room.joiner_id = Some(joiner_id.clone());
        room.host_inbox.push(serde_json::json!({ "type": "joined" }));
        Ok(joiner_id)
    }

    /// Deliver a message from `from` into the other side's mailbox
    pub fn post(&mut self, code: &str, from: &str, message: Value) -> Result<(), RoomError> {
        let has_type = message.get("type").is_some_and(Value::is_string);
        if !has_type {
            return Err(RoomError::BadMessage);
        }
        let inbox = self
            .live_room(code)?
            .inbox_opposite(from)
            .ok_or(RoomError::UnknownPeer)?;
        inbox.push(message);
        Ok(())
    }

    /// Take every message waiting for `peer_id`
    pub fn drain(&mut self, code: &str, peer_id: &str) -> Result<Vec<Value>, RoomError> {
        let inbox = self
            .live_room(code)?
            .inbox_of(peer_id)
            .ok_or(RoomError::UnknownPeer)?;
        Ok(std::mem::take(inbox))
    }

    fn live_room(&mut self, code: &str) -> Result<&mut Room, RoomError> {
        self.purge_expired();
        self.rooms
            .get_mut(&code.to_ascii_uppercase())
            .ok_or(RoomError::NotFound)
    }

    fn purge_expired(&mut self) {
        let ttl = self.ttl;
        self.rooms.retain(|code, room| {
            let alive = room.created_at.elapsed() < ttl;
            if !alive {
                debug!("Room {} expired", code);
            }
            alive
        });
    }
}

fn peer_id(rng: &mut impl Rng) -> String {
    format!("{:08x}", rng.gen::<u32>())
}

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct ServerState {
    rooms: Arc<Mutex<RoomRegistry>>,
}

impl ServerState {
    pub fn new(room_ttl: Duration) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(RoomRegistry::new(room_ttl))),
        }
    }
}

async fn create_room(State(state): State<ServerState>) -> Json<CreateRoomResponse> {
    let (code, host_id) = state.rooms.lock().await.create();
    info!("🏁 Room {} created (host {})", code, host_id);
    Json(CreateRoomResponse { code, host_id })
}

async fn join_room(
    State(state): State<ServerState>,
    Path(code): Path<String>,
) -> Result<Json<JoinRoomResponse>, RoomError> {
    let result = state.rooms.lock().await.join(&code);
    match result {
        Ok(joiner_id) => {
            info!("🎮 Peer {} joined room {}", joiner_id, code);
            Ok(Json(JoinRoomResponse { joiner_id }))
        }
        Err(e) => {
            warn!("Join to room {} refused: {}", code, e);
            Err(e)
        }
    }
}

async fn post_message(
    State(state): State<ServerState>,
    Path((code, peer_id)): Path<(String, String)>,
    Json(message): Json<Value>,
) -> Result<Json<Ack>, RoomError> {
    state.rooms.lock().await.post(&code, &peer_id, message)?;
    Ok(Json(Ack { ok: true }))
}

async fn poll_mailbox(
    State(state): State<ServerState>,
    Path((code, peer_id)): Path<(String, String)>,
) -> Result<Json<PollResponse>, RoomError> {
    let messages = state.rooms.lock().await.drain(&code, &peer_id)?;
    if !messages.is_empty() {
        debug!("Delivering {} message(s) to {} in room {}", messages.len(), peer_id, code);
    }
    Ok(Json(PollResponse { messages }))
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/rooms", post(create_room))
        .route("/rooms/:code/join", post(join_room))
        .route("/rooms/:code/peer/:peer_id", post(post_message).get(poll_mailbox))
        .with_state(state)
}

/// Serve the room API until the listener fails
pub async fn serve(listener: TcpListener, state: ServerState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Signaling server listening on http://{}", addr);
    }
    axum::serve(listener, router(state)).await
}
