// Session owner handle
// Drives signaling, the peer link and the state machine from the owner's task

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::error::{SessionError, SignalingError};
use super::link::{LinkEvent, LinkFactory, PeerLink};
use super::protocol::{ControlMessage, StatePacket};
use super::session::{ConnectionState, Role, Session, SessionEvent};
use super::signaling::{HttpSignaling, PeerId, RoomCode, Signaling};
use super::webrtc_link::WebRtcLinkFactory;
use crate::config::NetworkConfig;

/// I/O slice used by `connect()` between state checks
const CONNECT_SLICE: Duration = Duration::from_millis(20);

/// Time given to the link to push out a final `Quit`
const QUIT_FLUSH: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub poll_interval: Duration,
    /// Consecutive failed signaling sends tolerated before the session fails
    pub send_retries: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(300),
            send_retries: 3,
        }
    }
}

impl From<&NetworkConfig> for ClientOptions {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            send_retries: config.send_retries,
        }
    }
}

/// Fixed-interval signaling poll with a cancellation flag
#[derive(Debug)]
struct PollSchedule {
    interval: Duration,
    next_due: Option<Instant>,
    active: bool,
}

impl PollSchedule {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: None,
            active: false,
        }
    }

    /// First tick is due immediately
    fn start(&mut self) {
        self.active = true;
        self.next_due = Some(Instant::now());
    }

    fn cancel(&mut self) {
        if std::mem::replace(&mut self.active, false) {
            debug!("Signaling poll cancelled");
        }
        self.next_due = None;
    }

    /// Claim the current tick if it is due. The flag is checked first so a
    /// cancelled schedule never dispatches.
    fn take_due(&mut self) -> bool {
        if !self.active {
            return false;
        }
        let now = Instant::now();
        match self.next_due {
            Some(due) if now >= due => {
                self.next_due = Some(now + self.interval);
                true
            }
            _ => false,
        }
    }
}

/// Owner-facing handle for one peer session at a time
pub struct NetworkClient<S: Signaling, F: LinkFactory> {
    signaling: S,
    links: F,
    link: Option<F::Link>,
    session: Session,
    schedule: PollSchedule,
    options: ClientOptions,
    failed_sends: u32,
}

/// Client wired to the HTTP room service and the WebRTC link
pub type WebRtcClient = NetworkClient<HttpSignaling, WebRtcLinkFactory>;

impl WebRtcClient {
    pub fn from_config(config: &NetworkConfig) -> Self {
        NetworkClient::new(
            HttpSignaling::new(config.signaling_url.clone()),
            WebRtcLinkFactory::new(config.stun_server()),
            ClientOptions::from(config),
        )
    }
}

impl<S: Signaling, F: LinkFactory> NetworkClient<S, F> {
    pub fn new(signaling: S, links: F, options: ClientOptions) -> Self {
        Self {
            signaling,
            links,
            link: None,
            session: Session::new(),
            schedule: PollSchedule::new(options.poll_interval),
            options,
            failed_sends: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn is_host(&self) -> bool {
        self.session.is_host()
    }

    pub fn room_code(&self) -> Option<&RoomCode> {
        self.session.room_code()
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.session.peer_id()
    }

    /// Next owner notification, in arrival order
    pub fn next_event(&mut self) -> Option<SessionEvent> {
        self.session.next_event()
    }

    /// Why the session failed, if it did. Taken once; `connect()` also consumes it.
    pub fn take_failure(&mut self) -> Option<SessionError> {
        self.session.take_failure()
    }

    /// Create a room and wait for a joiner in the background of `pump`
    pub async fn host(&mut self) -> Result<RoomCode, SessionError> {
        self.session.ensure_startable()?;

        let link = match self.links.create().await {
            Ok(link) => link,
            Err(e) => {
                self.session.mark_failed(Role::Host);
                return Err(SessionError::LinkNegotiationFailed(e));
            }
        };

        let grant = match self.signaling.create_room().await {
            Ok(grant) => grant,
            Err(e) => {
                error!("Failed to create room: {}", e);
                self.discard_link(link);
                self.session.mark_failed(Role::Host);
                return Err(e.into());
            }
        };

        info!("🏁 Hosting room {}", grant.code);
        self.session.begin(Role::Host, grant.code.clone(), grant.peer_id)?;
        self.link = Some(link);
        self.failed_sends = 0;
        self.schedule.start();
        Ok(grant.code)
    }

    /// Join an existing room by its code (case-insensitive)
    pub async fn join(&mut self, code: &str) -> Result<(), SessionError> {
        self.session.ensure_startable()?;

        let Some(code) = RoomCode::parse(code) else {
            self.session.mark_failed(Role::Joiner);
            return Err(SignalingError::RoomNotFound(code.trim().to_string()).into());
        };

        let link = match self.links.create().await {
            Ok(link) => link,
            Err(e) => {
                self.session.mark_failed(Role::Joiner);
                return Err(SessionError::LinkNegotiationFailed(e));
            }
        };

        let peer_id = match self.signaling.join_room(&code).await {
            Ok(peer_id) => peer_id,
            Err(e) => {
                error!("Failed to join room {}: {}", code, e);
                self.discard_link(link);
                self.session.mark_failed(Role::Joiner);
                return Err(e.into());
            }
        };

        info!("🎮 Joined room {}", code);
        self.session.begin(Role::Joiner, code, peer_id)?;
        self.link = Some(link);
        self.failed_sends = 0;
        self.schedule.start();
        Ok(())
    }

    /// Pump until the game channel opens or negotiation fails
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        loop {
            match self.session.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => {
                    return Err(self.session.take_failure().unwrap_or(SessionError::NotConnected))
                }
                ConnectionState::Idle | ConnectionState::Closed => {
                    return Err(SessionError::NotConnected)
                }
                ConnectionState::AwaitingPeer | ConnectionState::Negotiating => {
                    self.pump(CONNECT_SLICE).await
                }
            }
        }
    }

    /// Run one cooperative step: publish, poll when due, then drive the link for `budget`
    pub async fn pump(&mut self, budget: Duration) {
        if self.link.is_none() {
            return;
        }

        self.flush_outbound().await;
        if !self.session.is_polling() {
            self.schedule.cancel();
        }
        if self.schedule.take_due() {
            self.poll_signaling().await;
            self.flush_outbound().await;
        }

        if let Some(link) = self.link.as_mut() {
            if let Err(e) = link.drive(budget).await {
                warn!("Peer link I/O failed: {}", e);
                self.session.handle_link_event(LinkEvent::Disconnected);
            }
        }
        self.process_link_events();
        self.settle();
    }

    /// Send local vehicle state; fails unless connected
    pub fn send(&mut self, packet: &StatePacket) -> Result<(), SessionError> {
        let link = self.link.as_mut().ok_or(SessionError::NotConnected)?;
        self.session.send_packet(link, packet)
    }

    /// Send a control message on the reliable channel
    pub fn send_reliable(&mut self, message: &ControlMessage) -> Result<(), SessionError> {
        let link = self.link.as_mut().ok_or(SessionError::NotConnected)?;
        self.session.send_control(link, message)
    }

    /// Tell the peer we are leaving, give the link a moment to deliver, then clean up
    pub async fn quit(&mut self) {
        if self.session.is_connected() {
            match self.send_reliable(&ControlMessage::Quit) {
                Ok(()) => {
                    if let Some(link) = self.link.as_mut() {
                        if let Err(e) = link.drive(QUIT_FLUSH).await {
                            debug!("Link error while flushing quit: {}", e);
                        }
                    }
                }
                Err(e) => warn!("Could not send quit: {}", e),
            }
        }
        self.cleanup();
    }

    /// Release everything. Safe from any state, any number of times.
    pub fn cleanup(&mut self) {
        self.schedule.cancel();
        if let Some(link) = self.link.take() {
            self.discard_link(link);
        }
        self.failed_sends = 0;
        self.session.cleanup();
    }

    async fn flush_outbound(&mut self) {
        let (Some(code), Some(peer_id)) = (
            self.session.room_code().cloned(),
            self.session.peer_id().cloned(),
        ) else {
            return;
        };

        while let Some(envelope) = self.session.next_outbound() {
            match self.signaling.send(&code, &peer_id, &envelope).await {
                Ok(()) => {
                    self.failed_sends = 0;
                    debug!("📤 Sent {} envelope", envelope.kind());
                }
                Err(e) => {
                    self.failed_sends += 1;
                    if self.failed_sends >= self.options.send_retries.max(1) {
                        error!("Giving up on signaling after {} failed sends", self.failed_sends);
                        self.session.fail(e.into());
                    } else {
                        warn!("Failed to send {} envelope ({}), will retry", envelope.kind(), e);
                        self.session.requeue_outbound(envelope);
                    }
                    break;
                }
            }
        }
    }

    async fn poll_signaling(&mut self) {
        let (Some(code), Some(peer_id)) = (
            self.session.room_code().cloned(),
            self.session.peer_id().cloned(),
        ) else {
            return;
        };

        match self.signaling.poll(&code, &peer_id).await {
            Ok(envelopes) => {
                if !envelopes.is_empty() {
                    debug!("📥 Polled {} envelope(s)", envelopes.len());
                }
                if let Some(link) = self.link.as_mut() {
                    for envelope in envelopes {
                        self.session.handle_envelope(link, envelope);
                    }
                }
            }
            Err(e) => warn!("Signaling poll failed, retrying next tick: {}", e),
        }
    }

    fn process_link_events(&mut self) {
        if let Some(link) = self.link.as_mut() {
            while let Some(event) = link.poll_event() {
                self.session.handle_link_event(event);
            }
        }
    }

    // Stop polling once negotiation is over; drop the link once the session is
    fn settle(&mut self) {
        if !self.session.is_polling() {
            self.schedule.cancel();
        }
        if matches!(
            self.session.state(),
            ConnectionState::Closed | ConnectionState::Failed
        ) {
            if let Some(link) = self.link.take() {
                self.discard_link(link);
            }
        }
    }

    fn discard_link(&self, mut link: F::Link) {
        link.close();
    }
}
