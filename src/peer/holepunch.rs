use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::NetConfig;
use crate::util::addr::{is_unicast_endpoint, with_port};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServerHolepunchState {
    cooldown: Duration,
    ack_count: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PeerHolepunchState {
    cooldown: Duration,
    send_turn: u32,
    ack_count: u32,
    shotgun_countdown: u32,
    /// the peer's address as observed by the server, anchor for shotgun probing
    external_addr: SocketAddr,
    internal_addr: Option<SocketAddr>,
}
impl PeerHolepunchState {
    pub fn send_turn(&self) -> u32 {
        self.send_turn
    }

    pub fn shotgun_countdown(&self) -> u32 {
        self.shotgun_countdown
    }

    pub fn external_addr(&self) -> SocketAddr {
        self.external_addr
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HolepunchState {
    /// establishing this host's own UDP mapping for the peer socket by probing the server
    ServerHolepunch(ServerHolepunchState),
    /// probing the peer directly
    PeerHolepunch(PeerHolepunchState),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProbeTarget {
    Server,
    Peer(SocketAddr),
}

/// One hole punching attempt toward a single peer. It exists only while the attempt is in
///  progress: success, suppression and abandonment all drop it.
#[derive(Debug, Clone)]
pub struct HolepunchAttempt {
    tag: Uuid,
    started_at: Instant,
    server_acked: bool,
    state: HolepunchState,
}

impl HolepunchAttempt {
    pub fn new(tag: Uuid, now: Instant) -> HolepunchAttempt {
        HolepunchAttempt {
            tag,
            started_at: now,
            server_acked: false,
            state: HolepunchState::ServerHolepunch(ServerHolepunchState {
                cooldown: Duration::ZERO,
                ack_count: 0,
            }),
        }
    }

    pub fn tag(&self) -> Uuid {
        self.tag
    }

    pub fn matches(&self, tag: &Uuid) -> bool {
        self.tag == *tag
    }

    pub fn state(&self) -> &HolepunchState {
        &self.state
    }

    pub fn is_peer_phase(&self) -> bool {
        matches!(self.state, HolepunchState::PeerHolepunch(_))
    }

    pub fn server_acked(&self) -> bool {
        self.server_acked
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.started_at) > timeout
    }

    /// Called once per coordinator tick. Returns where to send probes now.
    pub fn heartbeat(&mut self, elapsed: Duration, config: &NetConfig) -> Vec<ProbeTarget> {
        match &mut self.state {
            HolepunchState::ServerHolepunch(state) => {
                match state.cooldown.checked_sub(elapsed) {
                    Some(remaining) if !remaining.is_zero() => {
                        state.cooldown = remaining;
                        vec![]
                    }
                    _ => {
                        state.cooldown = config.server_holepunch_interval;
                        vec![ProbeTarget::Server]
                    }
                }
            }
            HolepunchState::PeerHolepunch(state) => {
                match state.cooldown.checked_sub(elapsed) {
                    Some(remaining) if !remaining.is_zero() => {
                        state.cooldown = remaining;
                        vec![]
                    }
                    _ => {
                        state.cooldown = config.peer_holepunch_interval;
                        state.send_turn += 1;

                        let mut result = vec![ProbeTarget::Peer(state.external_addr)];
                        if let Some(internal) = state.internal_addr {
                            if internal != state.external_addr && is_unicast_endpoint(&internal) {
                                result.push(ProbeTarget::Peer(internal));
                            }
                        }

                        if state.shotgun_countdown > 0 {
                            state.shotgun_countdown -= 1;
                            let anchor = state.external_addr;
                            result.extend(shotgun_ports(anchor.port(), config.shotgun_port_range, config.shotgun_min_port)
                                .into_iter()
                                .map(|port| ProbeTarget::Peer(with_port(&anchor, port))));
                        }
                        trace!("hole punch turn {}: {} probes", state.send_turn, result.len());
                        result
                    }
                }
            }
        }
    }

    /// A server ack with the right tag confirms this host's mapping for the peer socket.
    pub fn on_server_ack(&mut self, tag: &Uuid) -> bool {
        if !self.matches(tag) {
            return false;
        }
        self.server_acked = true;
        if let HolepunchState::ServerHolepunch(state) = &mut self.state {
            state.ack_count += 1;
        }
        true
    }

    /// Switches to probing the peer. Re-entering with changed addresses restarts probing
    ///  (including shotgun) from the new anchor.
    pub fn enter_peer_phase(&mut self, external_addr: SocketAddr, internal_addr: Option<SocketAddr>, config: &NetConfig) {
        if let HolepunchState::PeerHolepunch(state) = &self.state {
            if state.external_addr == external_addr && state.internal_addr == internal_addr {
                return;
            }
        }
        debug!("starting peer hole punching toward {:?} / {:?}", external_addr, internal_addr);
        self.state = HolepunchState::PeerHolepunch(PeerHolepunchState {
            cooldown: Duration::ZERO,
            send_turn: 0,
            ack_count: 0,
            shotgun_countdown: config.shotgun_attempt_count,
            external_addr,
            internal_addr,
        });
    }

    pub fn on_peer_ack(&mut self) {
        if let HolepunchState::PeerHolepunch(state) = &mut self.state {
            state.ack_count += 1;
        }
    }
}

/// ports around `anchor`, nearest first, never below `min_port`
pub fn shotgun_ports(anchor: u16, range: u16, min_port: u16) -> Vec<u16> {
    let mut result = Vec::new();
    for d in 1..=range {
        if let Some(up) = anchor.checked_add(d) {
            if up >= min_port {
                result.push(up);
            }
        }
        if let Some(down) = anchor.checked_sub(d) {
            if down >= min_port {
                result.push(down);
            }
        }
    }
    result
}
