// WebRTC peer link using str0m Sans-I/O implementation
// Owns the UDP socket and feeds str0m whenever the session pumps it

use std::collections::VecDeque;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::time::{Duration, Instant};

use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::channel::{ChannelConfig, ChannelId, Reliability};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::error::LinkError;
use super::link::{LinkEvent, LinkFactory, PeerLink};
use super::transport::ChannelKind;

const RECV_BUFFER_LEN: usize = 2000;

/// Timeout for the blocking STUN binding request
const STUN_TIMEOUT: Duration = Duration::from_secs(5);

/// str0m channel settings for each logical channel
pub fn channel_config(kind: ChannelKind) -> ChannelConfig {
    let (ordered, reliability) = match kind {
        // Only the newest state matters, so never retransmit
        ChannelKind::Unreliable => (false, Reliability::MaxRetransmits { retransmits: 0 }),
        ChannelKind::Reliable => (true, Reliability::Reliable),
    };
    ChannelConfig {
        label: kind.label().to_string(),
        ordered,
        reliability,
        negotiated: None,
        protocol: String::new(),
    }
}

/// Rank an interface address; lower is preferred.
///
/// With both a VPN (10.x) and a home network (192.168.x) present the VPN wins,
/// since STUN through it is what makes NAT traversal work.
fn interface_score(ip: Ipv4Addr, has_home_network: bool, has_vpn: bool) -> u8 {
    let octets = ip.octets();
    match (octets[0], octets[1]) {
        (10, _) => {
            if has_home_network {
                0
            } else {
                2
            }
        }
        (192, 168) => {
            if has_vpn {
                1
            } else {
                0
            }
        }
        (172, 16..=31) => 1,
        _ => 3,
    }
}

/// Discover the local network IP address for LAN connectivity
fn discover_local_ip() -> Result<IpAddr, LinkError> {
    let interfaces = if_addrs::get_if_addrs()?;

    let candidates: Vec<(String, Ipv4Addr)> = interfaces
        .into_iter()
        .filter_map(|iface| match iface.addr.ip() {
            IpAddr::V4(ipv4) if !ipv4.is_loopback() => Some((iface.name, ipv4)),
            _ => None,
        })
        .collect();

    let has_vpn = candidates.iter().any(|(_, ip)| ip.octets()[0] == 10);
    let has_home_network = candidates
        .iter()
        .any(|(_, ip)| ip.octets()[0] == 192 && ip.octets()[1] == 168);
    debug!(
        "Interface candidates: {:?}, has_vpn={}, has_home_network={}",
        candidates, has_vpn, has_home_network
    );

    let (name, ip) = candidates
        .into_iter()
        .min_by_key(|(_, ip)| interface_score(*ip, has_home_network, has_vpn))
        .ok_or_else(|| LinkError::Transport("no suitable network interface".to_string()))?;

    debug!("Selected interface {} with IP {}", name, ip);
    Ok(IpAddr::V4(ip))
}

/// Query STUN server for our public address.
/// Must use the socket ICE will use, otherwise the NAT mapping differs.
async fn query_stun_server(udp_socket: &StdUdpSocket, stun_server: &str) -> Result<SocketAddr, LinkError> {
    let stun_addr = tokio::net::lookup_host(stun_server)
        .await?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| LinkError::Transport(format!("cannot resolve {} to IPv4", stun_server)))?;
    debug!("STUN server resolved to {}", stun_addr);

    let socket = udp_socket.try_clone()?;
    let client = stunclient::StunClient::new(stun_addr);
    tokio::task::spawn_blocking(move || -> Result<SocketAddr, LinkError> {
        socket.set_read_timeout(Some(STUN_TIMEOUT))?;
        let result = client
            .query_external_address(&socket)
            .map_err(|e| LinkError::Transport(format!("STUN query failed: {}", e)));
        socket.set_read_timeout(None)?;
        result
    })
    .await
    .map_err(|e| LinkError::Transport(e.to_string()))?
}

fn parse_candidate(raw: &str) -> Result<Candidate, LinkError> {
    let line = raw.trim().trim_start_matches("a=");
    Candidate::from_sdp_string(line).map_err(|e| LinkError::Negotiation(format!("bad candidate: {}", e)))
}

fn datagram<'a, T>(data: &'a [u8]) -> Result<T, LinkError>
where
    T: TryFrom<&'a [u8]>,
    T::Error: std::fmt::Display,
{
    T::try_from(data).map_err(|e| LinkError::Transport(e.to_string()))
}

/// Peer link over one str0m `Rtc` instance and one UDP socket
pub struct WebRtcLink {
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    pending_offer: Option<SdpPendingOffer>,
    channels: Vec<(ChannelId, ChannelKind)>,
    events: VecDeque<LinkEvent>,
    disconnected: bool,
    buf: Vec<u8>,
}

impl WebRtcLink {
    /// Bind a UDP socket on the preferred interface and gather local candidates
    pub async fn bind(stun_server: Option<&str>) -> Result<Self, LinkError> {
        let local_ip = discover_local_ip().unwrap_or_else(|e| {
            warn!("Failed to discover local IP ({}), using 127.0.0.1", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });

        // Bind to the specific IP so local_addr() matches our host candidate
        let std_socket = StdUdpSocket::bind(SocketAddr::new(local_ip, 0))?;
        let host_addr = std_socket.local_addr()?;
        info!("Bound UDP socket: {}", host_addr);

        let mut rtc = Rtc::builder().set_rtp_mode(false).build();
        let mut events = VecDeque::new();

        let host = Candidate::host(host_addr, "udp").map_err(|e| LinkError::Negotiation(e.to_string()))?;
        if !add_local_candidate(&mut rtc, host, &mut events) {
            return Err(LinkError::Negotiation("host candidate rejected".to_string()));
        }

        if let Some(server) = stun_server.filter(|s| !s.is_empty()) {
            match query_stun_server(&std_socket, server).await {
                Ok(public_addr) => {
                    info!("🌐 Public address from STUN: {}", public_addr);
                    match Candidate::server_reflexive(public_addr, host_addr, "udp") {
                        Ok(srflx) => {
                            if !add_local_candidate(&mut rtc, srflx, &mut events) {
                                warn!("Failed to add server reflexive candidate");
                            }
                        }
                        Err(e) => warn!("Failed to create server reflexive candidate: {}", e),
                    }
                }
                // Host candidate alone still works on a LAN
                Err(e) => warn!("STUN query failed, using host candidate only: {}", e),
            }
        }

        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;

        Ok(Self {
            rtc,
            socket,
            local_addr: host_addr,
            pending_offer: None,
            channels: Vec::new(),
            events,
            disconnected: false,
            buf: vec![0u8; RECV_BUFFER_LEN],
        })
    }

    fn kind_of(&self, id: ChannelId) -> Option<ChannelKind> {
        self.channels
            .iter()
            .find(|(cid, _)| *cid == id)
            .map(|(_, kind)| *kind)
    }

    fn id_of(&self, kind: ChannelKind) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|(_, k)| *k == kind)
            .map(|(cid, _)| *cid)
    }

    fn report_disconnect(&mut self) {
        if !self.disconnected {
            self.disconnected = true;
            self.events.push_back(LinkEvent::Disconnected);
        }
    }

    fn handle_rtc_event(&mut self, event: Event) {
        match event {
            Event::Connected => {
                info!("🔗 WebRTC connection fully established (ICE + DTLS)");
            }
            Event::IceConnectionStateChange(state) => {
                debug!("ICE state: {:?}", state);
                if matches!(state, IceConnectionState::Disconnected) {
                    info!("❌ ICE connection disconnected");
                    self.report_disconnect();
                }
            }
            Event::ChannelOpen(id, label) => match ChannelKind::from_label(&label) {
                Some(kind) => {
                    info!("📨 Data channel opened: {}", label);
                    self.channels.retain(|(_, k)| *k != kind);
                    self.channels.push((id, kind));
                    self.events.push_back(LinkEvent::ChannelOpen(kind));
                }
                None => warn!("Ignoring data channel with unknown label {:?}", label),
            },
            Event::ChannelData(data) => match self.kind_of(data.id) {
                Some(kind) => self.events.push_back(LinkEvent::ChannelData(kind, data.data)),
                None => debug!("Dropping {} bytes on unbound channel", data.data.len()),
            },
            Event::ChannelClose(id) => {
                if let Some(kind) = self.kind_of(id) {
                    info!("Data channel closed: {}", kind);
                    self.events.push_back(LinkEvent::ChannelClose(kind));
                }
            }
            _ => {}
        }
    }

    async fn pump_io(&mut self, budget: Duration) -> Result<(), LinkError> {
        let until = Instant::now() + budget;

        loop {
            if !self.rtc.is_alive() {
                self.report_disconnect();
                return Ok(());
            }

            // Phase 1: drain str0m outputs until it asks us to wait
            let deadline = loop {
                match self.rtc.poll_output()? {
                    Output::Timeout(deadline) => break deadline,
                    Output::Transmit(transmit) => {
                        if let Err(e) = self
                            .socket
                            .send_to(&transmit.contents, transmit.destination)
                            .await
                        {
                            warn!("Failed to send UDP packet: {}", e);
                        }
                    }
                    Output::Event(event) => self.handle_rtc_event(event),
                }
            };

            let now = Instant::now();
            if now >= until {
                return Ok(());
            }

            // Phase 2: wait for input, but never past str0m's deadline or our budget
            let wait = deadline.min(until).saturating_duration_since(now);
            match tokio::time::timeout(wait, self.socket.recv_from(&mut self.buf)).await {
                Ok(Ok((n, source))) => {
                    let receive = Receive {
                        proto: Protocol::Udp,
                        source,
                        destination: self.local_addr,
                        contents: datagram(&self.buf[..n])?,
                    };
                    self.rtc.handle_input(Input::Receive(Instant::now(), receive))?;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => self.rtc.handle_input(Input::Timeout(Instant::now()))?,
            }
        }
    }
}

fn add_local_candidate(rtc: &mut Rtc, candidate: Candidate, events: &mut VecDeque<LinkEvent>) -> bool {
    let line = candidate.to_sdp_string();
    if rtc.add_local_candidate(candidate).is_some() {
        debug!("Added local candidate {}", line);
        events.push_back(LinkEvent::LocalCandidate(line));
        true
    } else {
        false
    }
}

impl PeerLink for WebRtcLink {
    fn create_offer(&mut self) -> Result<String, LinkError> {
        let mut change = self.rtc.sdp_api();
        change.add_channel_with_config(channel_config(ChannelKind::Unreliable));
        change.add_channel_with_config(channel_config(ChannelKind::Reliable));
        let (offer, pending) = change
            .apply()
            .ok_or_else(|| LinkError::Negotiation("no SDP changes to apply".to_string()))?;

        self.pending_offer = Some(pending);
        info!("📤 Created offer with game and reliable channels");
        Ok(offer.to_sdp_string())
    }

    fn accept_offer(&mut self, sdp: &str) -> Result<String, LinkError> {
        let offer = SdpOffer::from_sdp_string(sdp).map_err(|e| LinkError::Negotiation(e.to_string()))?;
        let answer = self
            .rtc
            .sdp_api()
            .accept_offer(offer)
            .map_err(|e| LinkError::Negotiation(e.to_string()))?;
        info!("📥 Accepted offer, answer created");
        Ok(answer.to_sdp_string())
    }

    fn accept_answer(&mut self, sdp: &str) -> Result<(), LinkError> {
        let pending = self
            .pending_offer
            .take()
            .ok_or_else(|| LinkError::Negotiation("answer without pending offer".to_string()))?;
        let answer = SdpAnswer::from_sdp_string(sdp).map_err(|e| LinkError::Negotiation(e.to_string()))?;
        self.rtc
            .sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| LinkError::Negotiation(e.to_string()))?;
        info!("✅ SDP negotiation complete");
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &str) -> Result<(), LinkError> {
        let candidate = parse_candidate(candidate)?;
        self.rtc.add_remote_candidate(candidate);
        Ok(())
    }

    fn send(&mut self, kind: ChannelKind, data: &[u8]) -> Result<(), LinkError> {
        let id = self.id_of(kind).ok_or(LinkError::ChannelNotOpen(kind))?;
        let mut channel = self.rtc.channel(id).ok_or(LinkError::ChannelNotOpen(kind))?;
        channel.write(kind.is_binary(), data)?;
        Ok(())
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    fn drive(&mut self, budget: Duration) -> impl Future<Output = Result<(), LinkError>> + Send {
        self.pump_io(budget)
    }

    fn close(&mut self) {
        self.rtc.disconnect();
        self.channels.clear();
        self.pending_offer = None;
    }
}

/// Builds a `WebRtcLink` per session, optionally gathering a STUN candidate
#[derive(Debug, Clone, Default)]
pub struct WebRtcLinkFactory {
    stun_server: Option<String>,
}

impl WebRtcLinkFactory {
    pub fn new(stun_server: Option<String>) -> Self {
        Self { stun_server }
    }
}

impl LinkFactory for WebRtcLinkFactory {
    type Link = WebRtcLink;

    fn create(&mut self) -> impl Future<Output = Result<WebRtcLink, LinkError>> + Send {
        let stun_server = self.stun_server.clone();
        async move { WebRtcLink::bind(stun_server.as_deref()).await }
    }
}
