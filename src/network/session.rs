// Connection state machine for one peer session
// Sans-I/O: fed envelopes and link events, yields envelopes to publish and owner events

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use super::error::{LinkError, SessionError};
use super::link::{LinkEvent, PeerLink};
use super::protocol::{ControlMessage, StatePacket};
use super::signaling::{Envelope, PeerId, RoomCode};
use super::transport::{ChannelKind, ChannelState, Channels};

/// Which side of the room this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Joiner,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    AwaitingPeer,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

/// Why an established session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote side sent `Quit`
    PeerQuit,
    /// A channel dropped after having been open
    ChannelClosed(ChannelKind),
    /// The peer link reported disconnection or failure
    LinkLost,
}

/// Notifications for the session owner, one variant per callback slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The game channel opened; the session is usable
    Open,
    /// Newest remote vehicle state
    Message(StatePacket),
    /// Control message from the peer, in send order
    ReliableMessage(ControlMessage),
    /// The session ended after having been open
    Close(CloseReason),
}

/// State of one two-peer session
#[derive(Debug, Default)]
pub struct Session {
    role: Option<Role>,
    room_code: Option<RoomCode>,
    peer_id: Option<PeerId>,
    state: ConnectionState,
    channels: Channels,
    remote_description_set: bool,
    /// Remote candidates that arrived before the remote description
    pending_candidates: VecDeque<String>,
    /// Control messages that beat the game channel open
    early_messages: VecDeque<ControlMessage>,
    outbound: VecDeque<Envelope>,
    events: VecDeque<SessionEvent>,
    failure: Option<SessionError>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == Some(Role::Host)
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Signaling runs only while waiting for the peer or negotiating
    pub fn is_polling(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::AwaitingPeer | ConnectionState::Negotiating
        )
    }

    pub fn room_code(&self) -> Option<&RoomCode> {
        self.room_code.as_ref()
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    pub fn channel_state(&self, kind: ChannelKind) -> ChannelState {
        self.channels.state(kind)
    }

    /// A new session may only start from a fresh or fully closed one
    pub fn ensure_startable(&self) -> Result<(), SessionError> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Closed => Ok(()),
            _ => Err(SessionError::Busy),
        }
    }

    /// Enter `AwaitingPeer` after the room service accepted us
    pub fn begin(&mut self, role: Role, room_code: RoomCode, peer_id: PeerId) -> Result<(), SessionError> {
        self.ensure_startable()?;
        self.reset();
        info!("Session started as {:?} in room {} (peer {})", role, room_code, peer_id);
        self.role = Some(role);
        self.room_code = Some(room_code);
        self.peer_id = Some(peer_id);
        self.state = ConnectionState::AwaitingPeer;
        Ok(())
    }

    /// Room creation or join failed before the session could start
    pub fn mark_failed(&mut self, role: Role) {
        self.reset();
        self.role = Some(role);
        self.state = ConnectionState::Failed;
    }

    /// Abort negotiation; the error is kept for whoever awaits the connection
    pub fn fail(&mut self, error: SessionError) {
        warn!("Session failed in {:?}: {}", self.state, error);
        self.state = ConnectionState::Failed;
        self.channels.close_all();
        self.pending_candidates.clear();
        self.early_messages.clear();
        self.outbound.clear();
        self.failure = Some(error);
    }

    pub fn take_failure(&mut self) -> Option<SessionError> {
        self.failure.take()
    }

    /// Tear everything down. Safe to call from any state, any number of times.
    pub fn cleanup(&mut self) {
        if self.state != ConnectionState::Closed {
            debug!("Cleaning up session in {:?}", self.state);
        }
        self.reset();
        self.channels.close_all();
        self.state = ConnectionState::Closed;
    }

    fn reset(&mut self) {
        self.room_code = None;
        self.peer_id = None;
        self.channels.reset();
        self.remote_description_set = false;
        self.pending_candidates.clear();
        self.early_messages.clear();
        self.outbound.clear();
        self.events.clear();
        self.failure = None;
    }

    /// Next envelope to publish through the room service
    pub fn next_outbound(&mut self) -> Option<Envelope> {
        self.outbound.pop_front()
    }

    /// Put back an envelope whose publication failed, keeping its place in line
    pub fn requeue_outbound(&mut self, envelope: Envelope) {
        if self.is_polling() {
            self.outbound.push_front(envelope);
        }
    }

    pub fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Consume one signaling envelope
    pub fn handle_envelope<L: PeerLink>(&mut self, link: &mut L, envelope: Envelope) {
        if !self.is_polling() {
            debug!("Ignoring {} envelope in {:?}", envelope.kind(), self.state);
            return;
        }

        let result = match (self.role, envelope) {
            (Some(Role::Host), Envelope::Joined) => self.on_peer_joined(link),
            (Some(Role::Joiner), Envelope::Offer { sdp }) => self.on_offer(link, &sdp),
            (Some(Role::Host), Envelope::Answer { sdp }) => self.on_answer(link, &sdp),
            (_, Envelope::Ice { candidate }) => {
                self.on_remote_candidate(link, candidate);
                Ok(())
            }
            (_, Envelope::Unknown) => {
                debug!("Ignoring envelope with unknown type");
                Ok(())
            }
            (role, envelope) => {
                warn!("Ignoring unexpected {} envelope as {:?}", envelope.kind(), role);
                Ok(())
            }
        };

        if let Err(e) = result {
            self.fail(SessionError::LinkNegotiationFailed(e));
        }
    }

    fn on_peer_joined<L: PeerLink>(&mut self, link: &mut L) -> Result<(), LinkError> {
        if self.state != ConnectionState::AwaitingPeer {
            debug!("Duplicate joined envelope ignored");
            return Ok(());
        }
        info!("🎮 Peer joined, creating offer");
        let sdp = link.create_offer()?;
        self.outbound.push_back(Envelope::Offer { sdp });
        self.state = ConnectionState::Negotiating;
        Ok(())
    }

    fn on_offer<L: PeerLink>(&mut self, link: &mut L, sdp: &str) -> Result<(), LinkError> {
        if self.state != ConnectionState::AwaitingPeer || self.remote_description_set {
            debug!("Duplicate offer ignored");
            return Ok(());
        }
        info!("📥 Received offer, creating answer");
        let answer = link.accept_offer(sdp)?;
        self.remote_description_set = true;
        self.flush_candidates(link);
        self.outbound.push_back(Envelope::Answer { sdp: answer });
        self.state = ConnectionState::Negotiating;
        Ok(())
    }

    fn on_answer<L: PeerLink>(&mut self, link: &mut L, sdp: &str) -> Result<(), LinkError> {
        if self.state != ConnectionState::Negotiating || self.remote_description_set {
            debug!("Answer outside negotiation ignored");
            return Ok(());
        }
        info!("📥 Received answer");
        link.accept_answer(sdp)?;
        self.remote_description_set = true;
        self.flush_candidates(link);
        Ok(())
    }

    fn on_remote_candidate<L: PeerLink>(&mut self, link: &mut L, candidate: String) {
        if self.remote_description_set {
            apply_candidate(link, &candidate);
        } else {
            debug!("Buffering early candidate ({} pending)", self.pending_candidates.len() + 1);
            self.pending_candidates.push_back(candidate);
        }
    }

    fn flush_candidates<L: PeerLink>(&mut self, link: &mut L) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            apply_candidate(link, &candidate);
        }
    }

    /// Consume one notification from the peer link
    pub fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                if self.is_polling() {
                    self.outbound.push_back(Envelope::Ice { candidate });
                }
            }
            LinkEvent::ChannelOpen(kind) => self.on_channel_open(kind),
            LinkEvent::ChannelData(kind, data) => self.on_channel_data(kind, &data),
            LinkEvent::ChannelClose(kind) => self.on_channel_close(kind),
            LinkEvent::Disconnected => self.on_disconnected(),
        }
    }

    fn on_channel_open(&mut self, kind: ChannelKind) {
        if !self.is_polling() && self.state != ConnectionState::Connected {
            return;
        }
        self.channels.set(kind, ChannelState::Open);

        // Only the game channel promotes the session
        if kind == ChannelKind::Unreliable && self.state == ConnectionState::Negotiating {
            info!("✅ Game channel open, session connected");
            self.state = ConnectionState::Connected;
            self.outbound.clear();
            self.events.push_back(SessionEvent::Open);
            while let Some(message) = self.early_messages.pop_front() {
                self.deliver_control(message);
            }
        }
    }

    fn on_channel_data(&mut self, kind: ChannelKind, data: &[u8]) {
        match kind {
            ChannelKind::Unreliable => {
                if self.state != ConnectionState::Connected {
                    return;
                }
                match StatePacket::from_bytes(data) {
                    Some(packet) => self.events.push_back(SessionEvent::Message(packet)),
                    None => debug!("Dropping short state packet ({} bytes)", data.len()),
                }
            }
            ChannelKind::Reliable => match ControlMessage::from_bytes(data) {
                Ok(ControlMessage::Unknown) => debug!("Ignoring control message with unknown type"),
                Ok(message) => match self.state {
                    ConnectionState::Connected => self.deliver_control(message),
                    ConnectionState::Negotiating => self.early_messages.push_back(message),
                    _ => {}
                },
                Err(e) => warn!("Dropping malformed control message: {}", e),
            },
        }
    }

    fn deliver_control(&mut self, message: ControlMessage) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let quit = message == ControlMessage::Quit;
        self.events.push_back(SessionEvent::ReliableMessage(message));
        if quit {
            info!("Peer quit the session");
            self.close(CloseReason::PeerQuit);
        }
    }

    fn on_channel_close(&mut self, kind: ChannelKind) {
        self.channels.set(kind, ChannelState::Closed);
        match self.state {
            // Either channel, open or still pending, takes the session down
            ConnectionState::Connected => self.close(CloseReason::ChannelClosed(kind)),
            ConnectionState::Negotiating => {
                self.fail(SessionError::LinkNegotiationFailed(LinkError::Transport(format!(
                    "{} channel closed during negotiation",
                    kind
                ))));
            }
            _ => {}
        }
    }

    fn on_disconnected(&mut self) {
        match self.state {
            ConnectionState::Connected => self.close(CloseReason::LinkLost),
            ConnectionState::AwaitingPeer | ConnectionState::Negotiating => {
                self.fail(SessionError::LinkNegotiationFailed(LinkError::Transport(
                    "peer link disconnected".to_string(),
                )));
            }
            _ => {}
        }
    }

    fn close(&mut self, reason: CloseReason) {
        info!("Session closed: {:?}", reason);
        self.state = ConnectionState::Closed;
        self.channels.close_all();
        self.outbound.clear();
        self.pending_candidates.clear();
        self.events.push_back(SessionEvent::Close(reason));
    }

    /// Send local vehicle state on the game channel
    pub fn send_packet<L: PeerLink>(&self, link: &mut L, packet: &StatePacket) -> Result<(), SessionError> {
        self.ensure_open(ChannelKind::Unreliable)?;
        let bytes = packet
            .to_bytes()
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        link.send(ChannelKind::Unreliable, &bytes)?;
        Ok(())
    }

    /// Send a control message on the reliable channel
    pub fn send_control<L: PeerLink>(&self, link: &mut L, message: &ControlMessage) -> Result<(), SessionError> {
        self.ensure_open(ChannelKind::Reliable)?;
        let text = message
            .to_text()
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        link.send(ChannelKind::Reliable, text.as_bytes())?;
        Ok(())
    }

    fn ensure_open(&self, kind: ChannelKind) -> Result<(), SessionError> {
        if self.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        if !self.channels.is_open(kind) {
            return Err(LinkError::ChannelNotOpen(kind).into());
        }
        Ok(())
    }
}

// A bad candidate is a malformed message, not a negotiation failure
fn apply_candidate<L: PeerLink>(link: &mut L, candidate: &str) {
    if let Err(e) = link.add_remote_candidate(candidate) {
        warn!("Dropping remote candidate: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::{MemoryLink, MemoryWire, ANSWER_SDP, HOST_SIDE, JOINER_SIDE, OFFER_SDP};

    fn started(role: Role) -> Session {
        let mut session = Session::new();
        session
            .begin(role, RoomCode::parse("ab12").unwrap(), format!("{:?}", role))
            .unwrap();
        session
    }

    fn drain_link(session: &mut Session, link: &mut MemoryLink) {
        while let Some(event) = link.poll_event() {
            session.handle_link_event(event);
        }
    }

    fn outbound(session: &mut Session) -> Vec<Envelope> {
        std::iter::from_fn(|| session.next_outbound()).collect()
    }

    fn events(session: &mut Session) -> Vec<SessionEvent> {
        std::iter::from_fn(|| session.next_event()).collect()
    }

    fn permutations(items: Vec<Envelope>) -> Vec<Vec<Envelope>> {
        if items.len() <= 1 {
            return vec![items];
        }
        let mut result = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.clone();
            let head = rest.remove(i);
            for mut tail in permutations(rest) {
                tail.insert(0, head.clone());
                result.push(tail);
            }
        }
        result
    }

    fn ice(n: u32) -> Envelope {
        Envelope::Ice {
            candidate: format!("candidate:{} 1 udp 2130706431 192.0.2.1 {} typ host", n, 6000 + n),
        }
    }

    /// Run host and joiner machines to completion, feeding each side's inbound
    /// envelopes in the given order
    fn negotiate(joiner_inbound: Vec<Envelope>, host_inbound: Vec<Envelope>) -> (Session, Session, MemoryWire) {
        let wire = MemoryWire::new();
        let mut host_link = wire.link(HOST_SIDE);
        let mut joiner_link = wire.link(JOINER_SIDE);
        let mut host = started(Role::Host);
        let mut joiner = started(Role::Joiner);

        host.handle_envelope(&mut host_link, Envelope::Joined);
        assert_eq!(host.state(), ConnectionState::Negotiating);

        for envelope in joiner_inbound {
            joiner.handle_envelope(&mut joiner_link, envelope);
        }
        for envelope in host_inbound {
            host.handle_envelope(&mut host_link, envelope);
        }

        drain_link(&mut host, &mut host_link);
        drain_link(&mut joiner, &mut joiner_link);
        (host, joiner, wire)
    }

    #[test]
    fn test_host_handshake_flow() {
        let wire = MemoryWire::new();
        let mut link = wire.link(HOST_SIDE);
        let mut host = started(Role::Host);
        assert_eq!(host.state(), ConnectionState::AwaitingPeer);
        assert!(host.is_host());

        host.handle_envelope(&mut link, Envelope::Joined);
        assert_eq!(host.state(), ConnectionState::Negotiating);
        assert_eq!(
            outbound(&mut host),
            vec![Envelope::Offer {
                sdp: OFFER_SDP.to_string()
            }]
        );

        // A second joined must not produce a second offer
        host.handle_envelope(&mut link, Envelope::Joined);
        assert!(outbound(&mut host).is_empty());
    }

    #[test]
    fn test_joiner_answers_offer() {
        let wire = MemoryWire::new();
        let mut link = wire.link(JOINER_SIDE);
        let mut joiner = started(Role::Joiner);

        joiner.handle_envelope(&mut link, Envelope::Joined);
        assert_eq!(joiner.state(), ConnectionState::AwaitingPeer);

        joiner.handle_envelope(&mut link, Envelope::Offer { sdp: OFFER_SDP.into() });
        assert_eq!(joiner.state(), ConnectionState::Negotiating);
        assert_eq!(
            outbound(&mut joiner),
            vec![Envelope::Answer {
                sdp: ANSWER_SDP.to_string()
            }]
        );
    }

    #[test]
    fn test_local_candidates_published_while_negotiating() {
        let wire = MemoryWire::new();
        let mut link = wire.link(HOST_SIDE);
        let mut host = started(Role::Host);

        drain_link(&mut host, &mut link);
        let published = outbound(&mut host);
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|e| matches!(e, Envelope::Ice { .. })));
    }

    #[test]
    fn test_connection_success_invariant_under_reordering() {
        let joiner_batch = vec![ice(1), ice(2), ice(3), Envelope::Offer { sdp: OFFER_SDP.into() }];
        let host_batch = vec![ice(11), Envelope::Answer { sdp: ANSWER_SDP.into() }, ice(12)];

        for joiner_order in permutations(joiner_batch.clone()) {
            for host_order in permutations(host_batch.clone()) {
                let (host, joiner, wire) = negotiate(joiner_order.clone(), host_order.clone());

                assert_eq!(host.state(), ConnectionState::Connected, "host order {:?}", host_order);
                assert_eq!(joiner.state(), ConnectionState::Connected, "joiner order {:?}", joiner_order);
                assert_eq!(wire.applied_candidates(JOINER_SIDE).len(), 3);
                assert_eq!(wire.applied_candidates(HOST_SIDE).len(), 2);
            }
        }
    }

    #[test]
    fn test_early_candidates_applied_in_arrival_order() {
        let (_, _, wire) = negotiate(
            vec![ice(3), ice(1), ice(2), Envelope::Offer { sdp: OFFER_SDP.into() }],
            vec![Envelope::Answer { sdp: ANSWER_SDP.into() }],
        );
        let applied = wire.applied_candidates(JOINER_SIDE);
        assert!(applied[0].starts_with("candidate:3 "));
        assert!(applied[1].starts_with("candidate:1 "));
        assert!(applied[2].starts_with("candidate:2 "));
    }

    #[test]
    fn test_no_connection_without_answer() {
        let (host, joiner, _) = negotiate(vec![Envelope::Offer { sdp: OFFER_SDP.into() }], vec![ice(5)]);
        assert_eq!(host.state(), ConnectionState::Negotiating);
        assert_eq!(joiner.state(), ConnectionState::Negotiating);
    }

    #[test]
    fn test_bad_candidate_is_not_fatal() {
        let (host, joiner, wire) = negotiate(
            vec![
                Envelope::Ice { candidate: "garbage".into() },
                Envelope::Offer { sdp: OFFER_SDP.into() },
                ice(1),
            ],
            vec![Envelope::Answer { sdp: ANSWER_SDP.into() }],
        );
        assert!(host.is_connected());
        assert!(joiner.is_connected());
        assert_eq!(wire.applied_candidates(JOINER_SIDE).len(), 1);
    }

    #[test]
    fn test_negotiation_error_fails_session() {
        let wire = MemoryWire::new();
        let mut link = wire.link(JOINER_SIDE);
        let mut joiner = started(Role::Joiner);

        joiner.handle_envelope(&mut link, Envelope::Offer { sdp: "v=0 garbage".into() });
        assert_eq!(joiner.state(), ConnectionState::Failed);
        assert!(matches!(
            joiner.take_failure(),
            Some(SessionError::LinkNegotiationFailed(_))
        ));
        assert!(events(&mut joiner).is_empty());
    }

    #[test]
    fn test_open_fires_once_on_game_channel() {
        let mut session = started(Role::Joiner);
        session.state = ConnectionState::Negotiating;

        session.handle_link_event(LinkEvent::ChannelOpen(ChannelKind::Reliable));
        assert_eq!(session.state(), ConnectionState::Negotiating);
        assert_eq!(session.channel_state(ChannelKind::Reliable), ChannelState::Open);

        session.handle_link_event(LinkEvent::ChannelOpen(ChannelKind::Unreliable));
        session.handle_link_event(LinkEvent::ChannelOpen(ChannelKind::Unreliable));
        assert!(session.is_connected());
        assert_eq!(events(&mut session), vec![SessionEvent::Open]);
    }

    #[test]
    fn test_control_before_open_is_delivered_after_open() {
        let mut session = started(Role::Joiner);
        session.state = ConnectionState::Negotiating;
        let track = ControlMessage::Track { track_index: 2 };

        session.handle_link_event(LinkEvent::ChannelOpen(ChannelKind::Reliable));
        session.handle_link_event(LinkEvent::ChannelData(
            ChannelKind::Reliable,
            track.to_text().unwrap().into_bytes(),
        ));
        session.handle_link_event(LinkEvent::ChannelOpen(ChannelKind::Unreliable));

        assert_eq!(
            events(&mut session),
            vec![SessionEvent::Open, SessionEvent::ReliableMessage(track)]
        );
    }

    #[test]
    fn test_state_packets_surface_and_short_ones_drop() {
        let (mut host, _, _) = negotiate(
            vec![Envelope::Offer { sdp: OFFER_SDP.into() }],
            vec![Envelope::Answer { sdp: ANSWER_SDP.into() }],
        );
        events(&mut host);

        let packet = StatePacket::from_fields([3, 1500, -200, 4200, 10, 10, 5]);
        host.handle_link_event(LinkEvent::ChannelData(ChannelKind::Unreliable, vec![1, 2, 3]));
        host.handle_link_event(LinkEvent::ChannelData(
            ChannelKind::Unreliable,
            packet.to_bytes().unwrap(),
        ));
        assert_eq!(events(&mut host), vec![SessionEvent::Message(packet)]);
    }

    #[test]
    fn test_quit_closes_after_delivery() {
        let (_, mut joiner, _) = negotiate(
            vec![Envelope::Offer { sdp: OFFER_SDP.into() }],
            vec![Envelope::Answer { sdp: ANSWER_SDP.into() }],
        );
        assert_eq!(events(&mut joiner), vec![SessionEvent::Open]);

        joiner.handle_link_event(LinkEvent::ChannelData(ChannelKind::Reliable, br#"{"type":"quit"}"#.to_vec()));
        joiner.handle_link_event(LinkEvent::Disconnected);

        assert_eq!(joiner.state(), ConnectionState::Closed);
        assert_eq!(
            events(&mut joiner),
            vec![
                SessionEvent::ReliableMessage(ControlMessage::Quit),
                SessionEvent::Close(CloseReason::PeerQuit),
            ]
        );
    }

    #[test]
    fn test_malformed_control_message_dropped() {
        let (mut host, _, _) = negotiate(
            vec![Envelope::Offer { sdp: OFFER_SDP.into() }],
            vec![Envelope::Answer { sdp: ANSWER_SDP.into() }],
        );
        events(&mut host);

        host.handle_link_event(LinkEvent::ChannelData(ChannelKind::Reliable, b"{oops".to_vec()));
        host.handle_link_event(LinkEvent::ChannelData(ChannelKind::Reliable, br#"{"type":"emote"}"#.to_vec()));
        assert!(host.is_connected());
        assert!(events(&mut host).is_empty());
    }

    #[test]
    fn test_channel_loss_after_open_closes_session() {
        let (mut host, _, _) = negotiate(
            vec![Envelope::Offer { sdp: OFFER_SDP.into() }],
            vec![Envelope::Answer { sdp: ANSWER_SDP.into() }],
        );
        events(&mut host);

        host.handle_link_event(LinkEvent::ChannelClose(ChannelKind::Reliable));
        assert_eq!(host.state(), ConnectionState::Closed);
        assert_eq!(
            events(&mut host),
            vec![SessionEvent::Close(CloseReason::ChannelClosed(ChannelKind::Reliable))]
        );
    }

    #[test]
    fn test_pending_reliable_close_after_open_closes_session() {
        let mut session = started(Role::Host);
        session.state = ConnectionState::Negotiating;

        session.handle_link_event(LinkEvent::ChannelOpen(ChannelKind::Unreliable));
        assert!(session.is_connected());
        assert_eq!(session.channel_state(ChannelKind::Reliable), ChannelState::Connecting);

        session.handle_link_event(LinkEvent::ChannelClose(ChannelKind::Reliable));
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(
            events(&mut session),
            vec![
                SessionEvent::Open,
                SessionEvent::Close(CloseReason::ChannelClosed(ChannelKind::Reliable)),
            ]
        );
    }

    #[test]
    fn test_disconnect_while_connected_reports_link_lost() {
        let (_, mut joiner, _) = negotiate(
            vec![Envelope::Offer { sdp: OFFER_SDP.into() }],
            vec![Envelope::Answer { sdp: ANSWER_SDP.into() }],
        );
        events(&mut joiner);

        joiner.handle_link_event(LinkEvent::Disconnected);
        assert_eq!(events(&mut joiner), vec![SessionEvent::Close(CloseReason::LinkLost)]);
    }

    #[test]
    fn test_cleanup_is_idempotent_from_every_state() {
        let states = [
            ConnectionState::Idle,
            ConnectionState::AwaitingPeer,
            ConnectionState::Negotiating,
            ConnectionState::Connected,
            ConnectionState::Closed,
            ConnectionState::Failed,
        ];
        for state in states {
            let mut session = started(Role::Host);
            session.state = state;

            session.cleanup();
            session.cleanup();

            assert_eq!(session.state(), ConnectionState::Closed);
            assert!(session.room_code().is_none());
            assert!(session.peer_id().is_none());
            assert!(session.next_outbound().is_none());
            assert!(session.ensure_startable().is_ok(), "not reusable after {:?}", state);
        }

        let mut idle = Session::new();
        idle.cleanup();
        assert_eq!(idle.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_second_session_requires_cleanup() {
        let mut session = started(Role::Host);
        let err = session
            .begin(Role::Joiner, RoomCode::parse("WXYZ").unwrap(), "p2".into())
            .unwrap_err();
        assert!(matches!(err, SessionError::Busy));

        session.cleanup();
        session
            .begin(Role::Joiner, RoomCode::parse("WXYZ").unwrap(), "p2".into())
            .unwrap();
        assert_eq!(session.role(), Some(Role::Joiner));
    }

    #[test]
    fn test_envelopes_ignored_once_connected() {
        let wire = MemoryWire::new();
        let mut joiner_link = wire.link(JOINER_SIDE);
        let (_, mut joiner, _) = negotiate(
            vec![Envelope::Offer { sdp: OFFER_SDP.into() }],
            vec![Envelope::Answer { sdp: ANSWER_SDP.into() }],
        );

        joiner.handle_envelope(&mut joiner_link, Envelope::Offer { sdp: OFFER_SDP.into() });
        joiner.handle_link_event(LinkEvent::LocalCandidate("candidate:9".into()));
        assert!(joiner.is_connected());
        assert!(outbound(&mut joiner).is_empty());
    }

    #[test]
    fn test_send_requires_connection() {
        let wire = MemoryWire::new();
        let mut link = wire.link(HOST_SIDE);
        let host = started(Role::Host);

        let err = host
            .send_packet(&mut link, &StatePacket::default())
            .unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
    }
}
