// In-memory doubles for the peer link and the room service

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::error::{LinkError, SignalingError};
use super::link::{LinkEvent, LinkFactory, PeerLink};
use super::signaling::{decode_batch, Envelope, PeerId, RoomCode, RoomGrant, Signaling};
use super::transport::ChannelKind;
use crate::signaling_server::{RoomError, RoomRegistry};

pub const HOST_SIDE: usize = 0;
pub const JOINER_SIDE: usize = 1;

pub const OFFER_SDP: &str = "v=0 memory-offer";
pub const ANSWER_SDP: &str = "v=0 memory-answer";

#[derive(Default)]
struct Wire {
    inboxes: [VecDeque<LinkEvent>; 2],
    applied: [Vec<String>; 2],
    open: bool,
}

/// Shared medium between two memory links
#[derive(Clone, Default)]
pub struct MemoryWire(Arc<Mutex<Wire>>);

impl MemoryWire {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self, side: usize) -> MemoryLink {
        let mut wire = self.0.lock().unwrap();
        wire.inboxes[side].clear();
        wire.open = false;

        let local = (0..2)
            .map(|i| {
                LinkEvent::LocalCandidate(format!(
                    "candidate:{}{} 1 udp 2130706431 127.0.0.1 {} typ host",
                    side,
                    i,
                    5000 + side * 10 + i
                ))
            })
            .collect();

        MemoryLink {
            side,
            wire: self.clone(),
            local,
            offered: false,
            remote_set: false,
            closed: false,
        }
    }

    pub fn factory(&self, side: usize) -> MemoryLinkFactory {
        MemoryLinkFactory {
            wire: self.clone(),
            side,
        }
    }

    /// Remote candidates the given side accepted, in application order
    pub fn applied_candidates(&self, side: usize) -> Vec<String> {
        self.0.lock().unwrap().applied[side].clone()
    }
}

/// Peer link that "connects" as soon as the host applies the answer
pub struct MemoryLink {
    side: usize,
    wire: MemoryWire,
    local: VecDeque<LinkEvent>,
    offered: bool,
    remote_set: bool,
    closed: bool,
}

impl MemoryLink {
    fn peer(&self) -> usize {
        1 - self.side
    }
}

impl PeerLink for MemoryLink {
    fn create_offer(&mut self) -> Result<String, LinkError> {
        self.offered = true;
        Ok(OFFER_SDP.to_string())
    }

    fn accept_offer(&mut self, sdp: &str) -> Result<String, LinkError> {
        if sdp != OFFER_SDP {
            return Err(LinkError::Negotiation("unparseable offer".into()));
        }
        self.remote_set = true;
        Ok(ANSWER_SDP.to_string())
    }

    fn accept_answer(&mut self, sdp: &str) -> Result<(), LinkError> {
        if !self.offered || sdp != ANSWER_SDP {
            return Err(LinkError::Negotiation("unexpected answer".into()));
        }
        self.remote_set = true;

        let mut wire = self.wire.0.lock().unwrap();
        wire.open = true;
        let (me, peer) = (self.side, self.peer());
        wire.inboxes[me].push_back(LinkEvent::ChannelOpen(ChannelKind::Reliable));
        wire.inboxes[me].push_back(LinkEvent::ChannelOpen(ChannelKind::Unreliable));
        wire.inboxes[peer].push_back(LinkEvent::ChannelOpen(ChannelKind::Unreliable));
        wire.inboxes[peer].push_back(LinkEvent::ChannelOpen(ChannelKind::Reliable));
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &str) -> Result<(), LinkError> {
        if !self.remote_set {
            return Err(LinkError::Negotiation("remote description not set".into()));
        }
        if !candidate.starts_with("candidate:") {
            return Err(LinkError::Negotiation(format!("bad candidate {:?}", candidate)));
        }
        self.wire.0.lock().unwrap().applied[self.side].push(candidate.to_string());
        Ok(())
    }

    fn send(&mut self, kind: ChannelKind, data: &[u8]) -> Result<(), LinkError> {
        let mut wire = self.wire.0.lock().unwrap();
        if self.closed || !wire.open {
            return Err(LinkError::ChannelNotOpen(kind));
        }
        let peer = self.peer();
        wire.inboxes[peer].push_back(LinkEvent::ChannelData(kind, data.to_vec()));
        Ok(())
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        if let Some(event) = self.local.pop_front() {
            return Some(event);
        }
        self.wire.0.lock().unwrap().inboxes[self.side].pop_front()
    }

    fn drive(&mut self, budget: Duration) -> impl Future<Output = Result<(), LinkError>> + Send {
        async move {
            tokio::time::sleep(budget).await;
            Ok(())
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut wire = self.wire.0.lock().unwrap();
        if wire.open {
            wire.open = false;
            let peer = self.peer();
            wire.inboxes[peer].push_back(LinkEvent::Disconnected);
        }
    }
}

pub struct MemoryLinkFactory {
    wire: MemoryWire,
    side: usize,
}

impl LinkFactory for MemoryLinkFactory {
    type Link = MemoryLink;

    fn create(&mut self) -> impl Future<Output = Result<MemoryLink, LinkError>> + Send {
        std::future::ready(Ok(self.wire.link(self.side)))
    }
}

/// Room service backed directly by the server's registry
#[derive(Clone)]
pub struct MemorySignaling {
    rooms: Arc<Mutex<RoomRegistry>>,
    failing_sends: Arc<AtomicU32>,
    offline: Arc<AtomicBool>,
    poll_outage: Arc<AtomicBool>,
    polls: Arc<AtomicU32>,
}

impl MemorySignaling {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(Mutex::new(RoomRegistry::new(Duration::from_secs(600)))),
            failing_sends: Arc::new(AtomicU32::new(0)),
            offline: Arc::new(AtomicBool::new(false)),
            poll_outage: Arc::new(AtomicBool::new(false)),
            polls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make the next `n` sends fail as if the service were unreachable
    pub fn fail_next_sends(&self, n: u32) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail only polls, leaving room management and sends working
    pub fn set_poll_outage(&self, outage: bool) {
        self.poll_outage.store(outage, Ordering::SeqCst);
    }

    pub fn poll_count(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    /// Post a raw JSON message into a room as if `from` had sent it
    pub fn inject(&self, code: &RoomCode, from: &PeerId, message: serde_json::Value) {
        self.rooms
            .lock()
            .unwrap()
            .post(code.as_str(), from, message)
            .unwrap();
    }

    fn check_online(&self) -> Result<(), SignalingError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SignalingError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

fn map_room_error(code: &str, e: RoomError) -> SignalingError {
    match e {
        RoomError::NotFound => SignalingError::RoomNotFound(code.to_string()),
        other => SignalingError::Rejected {
            status: other.status().as_u16(),
        },
    }
}

impl Signaling for MemorySignaling {
    async fn create_room(&self) -> Result<RoomGrant, SignalingError> {
        self.check_online()?;
        let (code, host_id) = self.rooms.lock().unwrap().create();
        let code = RoomCode::parse(&code).ok_or_else(|| SignalingError::Malformed(code.clone()))?;
        Ok(RoomGrant {
            code,
            peer_id: host_id,
        })
    }

    async fn join_room(&self, code: &RoomCode) -> Result<PeerId, SignalingError> {
        self.check_online()?;
        let result = self.rooms.lock().unwrap().join(code.as_str());
        result.map_err(|e| map_room_error(code.as_str(), e))
    }

    async fn send(&self, code: &RoomCode, peer_id: &PeerId, envelope: &Envelope) -> Result<(), SignalingError> {
        self.check_online()?;
        let failing = self.failing_sends.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_sends.store(failing - 1, Ordering::SeqCst);
            return Err(SignalingError::Unavailable("send dropped".into()));
        }
        let message = serde_json::to_value(envelope).map_err(|e| SignalingError::Malformed(e.to_string()))?;
        let result = self.rooms.lock().unwrap().post(code.as_str(), peer_id, message);
        result.map_err(|e| map_room_error(code.as_str(), e))
    }

    async fn poll(&self, code: &RoomCode, peer_id: &PeerId) -> Result<Vec<Envelope>, SignalingError> {
        self.check_online()?;
        if self.poll_outage.load(Ordering::SeqCst) {
            return Err(SignalingError::Unavailable("poll timed out".into()));
        }
        self.polls.fetch_add(1, Ordering::SeqCst);
        let result = self.rooms.lock().unwrap().drain(code.as_str(), peer_id);
        result
            .map(decode_batch)
            .map_err(|e| map_room_error(code.as_str(), e))
    }
}
