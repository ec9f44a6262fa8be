use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::client::disconnect::{Disconnect, DisconnectProgress};
use crate::config::NetConfig;
use crate::error::NetError;
use crate::events::{FallbackReason, LocalEventQueue, NetEvent};
use crate::group::{GroupTable, MemberKind};
use crate::host_id::HostId;
use crate::messaging::peer_message::{PeerMessage, MAX_USER_PAYLOAD_LEN};
use crate::messaging::relay::RelayList;
use crate::messaging::rpc::{ClientToServer, DirectAddrs, MemberJoinInfo, ServerLink, ServerToClient};
use crate::messaging::wire::Datagram;
use crate::messaging::ReceivedMessage;
use crate::peer::holepunch::ProbeTarget;
use crate::peer::{GroupMember, PingSource, RemotePeer, Route, SendTarget};
use crate::transport::fallbackable::{FallbackableTransport, SendOptions, SendPath};
use crate::transport::socket_pool::{PooledSocket, SocketPool};
use crate::transport::udp_io::{send_datagram, InboundDatagram, UdpIo};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Connected,
    Disconnecting,
    Disconnected,
}
impl ConnectionState {
    fn name(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Disconnected => "Disconnected",
        }
    }
}

/// The client's link to the server: the RPC link always, plus UDP once the server confirmed the
///  client's UDP mapping
struct ServerConnection {
    link: Box<dyn ServerLink>,
    transport: FallbackableTransport,
    udp_port: Option<u16>,
    internal_addr: Option<SocketAddr>,
    udp_tag: Option<Uuid>,
    /// the server confirmed the UDP socket, so probing it makes sense
    udp_acked: bool,
    probe_started_at: Option<Instant>,
    probe_countdown: Duration,
    ping: Option<Duration>,
    /// server clock minus local clock, in microseconds
    time_diff_micros: Option<i64>,
    ping_countdown: Duration,
    report_countdown: Duration,
    udp_recv_count: u64,
}

impl ServerConnection {
    fn new(link: Box<dyn ServerLink>) -> ServerConnection {
        ServerConnection {
            link,
            transport: FallbackableTransport::new(),
            udp_port: None,
            internal_addr: None,
            udp_tag: None,
            udp_acked: false,
            probe_started_at: None,
            probe_countdown: Duration::ZERO,
            ping: None,
            time_diff_micros: None,
            ping_countdown: Duration::ZERO,
            report_countdown: Duration::ZERO,
            udp_recv_count: 0,
        }
    }

    fn is_server_addr(&self, addr: SocketAddr) -> bool {
        self.transport.remote_addr() == Some(addr)
    }

    /// over UDP if the server link has working UDP, through the RPC link otherwise
    fn relay_unreliable(&mut self, udp: &mut dyn UdpIo, from: HostId, relay_list: RelayList, payload: Bytes) {
        match (self.transport.select_path(self.udp_port.is_some(), SendOptions::default()), self.udp_port) {
            (SendPath::Udp(to), Some(local_port)) => {
                send_datagram(udp, local_port, to, &Datagram::UnreliableRelay { from, relay_list, payload });
            }
            _ => self.link.call(ClientToServer::UnreliableRelay { relay_list, payload }),
        }
    }
}

/// The client's connectivity coordinator: server link, peers and their hole punching, groups as
///  announced by the server, and the choice of path for every message.
///
/// All methods expect the caller to hold the client's main lock (which `&mut self` proves), and
///  take the current time explicitly.
pub struct ClientCore {
    config: Arc<NetConfig>,
    host_id: HostId,
    state: ConnectionState,
    server: ServerConnection,
    udp: Box<dyn UdpIo>,
    peers: FxHashMap<HostId, RemotePeer>,
    groups: GroupTable,
    pool: SocketPool,
    events: LocalEventQueue,
    received: Vec<ReceivedMessage>,
    /// reference point for the local microsecond clock in pings
    epoch: Instant,
    last_tick: Option<Instant>,
    disconnect: Option<Disconnect>,
}

impl ClientCore {
    /// A core for a client whose TCP session to the server is established, and which was
    ///  assigned `host_id` by the server.
    pub fn new(config: Arc<NetConfig>, host_id: HostId, link: Box<dyn ServerLink>, udp: Box<dyn UdpIo>, now: Instant) -> ClientCore {
        ClientCore {
            config,
            host_id,
            state: ConnectionState::Connected,
            server: ServerConnection::new(link),
            udp,
            peers: FxHashMap::default(),
            groups: GroupTable::new(),
            pool: SocketPool::new(),
            events: LocalEventQueue::new(),
            received: Vec::new(),
            epoch: now,
            last_tick: None,
            disconnect: None,
        }
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer(&self, host_id: HostId) -> Option<&RemotePeer> {
        self.peers.get(&host_id)
    }

    pub fn peer_ids(&self) -> Vec<HostId> {
        let mut result = self.peers.keys().copied().collect::<Vec<_>>();
        result.sort();
        result
    }

    pub fn groups(&self) -> &GroupTable {
        &self.groups
    }

    pub fn socket_pool(&self) -> &SocketPool {
        &self.pool
    }

    pub fn server_udp_enabled(&self) -> bool {
        self.server.transport.real_udp_enabled()
    }

    pub fn server_udp_port(&self) -> Option<u16> {
        self.server.udp_port
    }

    pub fn server_ping(&self) -> Option<Duration> {
        self.server.ping
    }

    fn local_micros(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    /// the estimated server clock, once a UDP pong arrived
    pub fn server_time_micros(&self, now: Instant) -> Option<u64> {
        let diff = self.server.time_diff_micros?;
        Some((self.local_micros(now) as i64 + diff).max(0) as u64)
    }

    /// Events are delivered in order. Handing out a peer's leave events is what allows its
    ///  garbaged record to be removed for good.
    pub fn drain_events(&mut self) -> Vec<NetEvent> {
        let events = self.events.drain();
        for event in &events {
            if let NetEvent::P2PMemberLeft { member, .. } = event {
                if let Some(peer) = self.peers.get_mut(member) {
                    peer.dec_leave_event_count();
                }
            }
        }
        self.peers.retain(|id, peer| {
            if peer.can_be_removed() {
                debug!("removing peer {:?}", id);
                false
            }
            else {
                true
            }
        });
        events
    }

    pub fn take_received(&mut self) -> Vec<ReceivedMessage> {
        std::mem::take(&mut self.received)
    }

    fn check_connected(&self) -> Result<(), NetError> {
        if self.state != ConnectionState::Connected {
            return Err(NetError::WrongState {
                expected: ConnectionState::Connected.name(),
                actual: self.state.name(),
            });
        }
        Ok(())
    }

    /// Starts the server-link UDP handshake: the server answers with its UDP address and the
    ///  correlation tag for this client's probes.
    pub fn request_server_udp(&mut self) -> Result<(), NetError> {
        self.check_connected()?;
        self.server.link.call(ClientToServer::RequestCreateUdpSocket);
        Ok(())
    }

    // ----- sending

    pub fn send_to_peer(&mut self, now: Instant, to: HostId, payload: Bytes, reliable: bool) -> Result<(), NetError> {
        self.check_connected()?;
        if payload.len() > MAX_USER_PAYLOAD_LEN {
            return Err(NetError::PayloadTooLarge(payload.len()));
        }

        if to == self.host_id {
            self.received.push(ReceivedMessage { from: to, payload, reliable });
            return Ok(());
        }
        if to == HostId::SERVER {
            self.send_to_server(payload, reliable);
            return Ok(());
        }
        if !self.peers.get(&to).map(|p| !p.is_garbaged()).unwrap_or(false) {
            return Err(NetError::UnknownPeer(to));
        }

        self.trigger_jit(now, to);
        self.send_peer_message(now, to, PeerMessage::User(payload), reliable, SendOptions::default());
        Ok(())
    }

    /// Sends to every member of a group, including the local host. Directly connected peers get
    ///  the payload directly; everybody else is covered by one relay request, so no member
    ///  receives it twice.
    pub fn send_to_group(&mut self, now: Instant, group: HostId, payload: Bytes, reliable: bool) -> Result<(), NetError> {
        self.check_connected()?;
        if payload.len() > MAX_USER_PAYLOAD_LEN {
            return Err(NetError::PayloadTooLarge(payload.len()));
        }
        let members = self.groups.member_ids(group)
            .ok_or(NetError::UnknownGroup(group))?
            .to_vec();

        let mut relayed = Vec::new();
        for member in members {
            if member == self.host_id {
                self.received.push(ReceivedMessage { from: member, payload: payload.clone(), reliable });
                continue;
            }
            if member == HostId::SERVER {
                relayed.push(member);
                continue;
            }

            self.trigger_jit(now, member);
            let is_direct = match self.peers.get(&member) {
                Some(p) if !p.is_garbaged() => p.is_direct(),
                _ => continue,
            };
            if is_direct {
                self.send_peer_message(now, member, PeerMessage::User(payload.clone()), reliable, SendOptions::default());
            }
            else {
                relayed.push(member);
            }
        }

        if relayed.is_empty() {
            return Ok(());
        }
        let wrapped = PeerMessage::User(payload).to_bytes();
        if reliable {
            let dests = relayed.iter()
                .map(|&member| {
                    let frame_number = self.peers.get_mut(&member)
                        .map(|p| p.reliable_sender().push_relayed())
                        .unwrap_or(0);
                    (member, frame_number)
                })
                .collect();
            self.server.link.call(ClientToServer::ReliableRelay { dests, payload: wrapped });
        }
        else {
            let host_id = self.host_id;
            let targets = relayed.into_iter().collect::<FxHashSet<_>>();
            let relay_list = RelayList::compress(&targets, self.groups.iter()
                .filter(|g| g.contains(host_id))
                .map(|g| (g.id(), g.member_ids())));
            self.server.relay_unreliable(self.udp.as_mut(), host_id, relay_list, wrapped);
        }
        Ok(())
    }

    fn send_to_server(&mut self, payload: Bytes, reliable: bool) {
        let payload = PeerMessage::User(payload).to_bytes();
        if reliable {
            self.server.link.call(ClientToServer::ReliableRelay { dests: vec![(HostId::SERVER, 0)], payload });
        }
        else {
            let relay_list = RelayList { groups: vec![], peers: vec![HostId::SERVER] };
            self.server.relay_unreliable(self.udp.as_mut(), self.host_id, relay_list, payload);
        }
    }

    fn send_peer_message(&mut self, now: Instant, to: HostId, message: PeerMessage, reliable: bool, options: SendOptions) {
        let Some(peer) = self.peers.get_mut(&to).filter(|p| !p.is_garbaged()) else {
            debug!("no live peer {:?} - dropping {:?}", to, message);
            return;
        };
        let payload = message.to_bytes();

        match peer.route(options) {
            Route::Direct { local_port, to: addr } => {
                let nonce = peer.next_nonce();
                let datagram = if reliable {
                    let frame_number = peer.reliable_sender().push_direct(payload.clone(), now);
                    Datagram::Reliable { from: self.host_id, nonce, frame_number, payload }
                }
                else {
                    Datagram::Unreliable { from: self.host_id, nonce, payload }
                };
                send_datagram(self.udp.as_mut(), local_port, addr, &datagram);
            }
            Route::Relay => {
                if reliable {
                    let frame_number = peer.reliable_sender().push_relayed();
                    self.server.link.call(ClientToServer::ReliableRelay { dests: vec![(to, frame_number)], payload });
                }
                else {
                    let relay_list = RelayList { groups: vec![], peers: vec![to] };
                    self.server.relay_unreliable(self.udp.as_mut(), self.host_id, relay_list, payload);
                }
            }
        }
    }

    /// With JIT P2P, hole punching to a peer starts with the first traffic toward it
    fn trigger_jit(&mut self, now: Instant, peer_id: HostId) {
        if !(self.config.enable_jit_p2p && self.config.allow_direct_p2p) {
            return;
        }
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if peer.is_garbaged() || peer.is_direct() || peer.jit_requested() || peer.holepunch().is_some() {
            return;
        }
        if !peer.direct_p2p_allowed() || !peer.holepunch_cooltime().is_ready(now) {
            return;
        }

        debug!("traffic to relayed {:?}, starting JIT hole punching", peer_id);
        peer.set_jit_requested(true);
        if start_attempt(peer, &mut self.pool, self.udp.as_mut(), now) {
            self.server.link.call(ClientToServer::NotifyJitDirectP2PTriggered { peer: peer_id });
        }
    }

    // ----- RPC

    pub fn on_rpc(&mut self, now: Instant, rpc: ServerToClient) {
        if self.state != ConnectionState::Connected {
            debug!("{:?} is {}, ignoring RPC {:?}", self.host_id, self.state.name(), rpc);
            return;
        }
        trace!("RPC from server: {:?}", rpc);

        match rpc {
            ServerToClient::RequestCreateUdpSocket { server_udp_addr, holepunch_tag } => {
                self.on_request_create_udp_socket(server_udp_addr, holepunch_tag);
            }
            ServerToClient::CreateUdpSocketAck { ok } => {
                if ok && self.server.udp_port.is_some() {
                    debug!("server confirmed the UDP socket, probing");
                    self.server.udp_acked = true;
                    self.server.probe_started_at = Some(now);
                    self.server.probe_countdown = Duration::ZERO;
                }
                else {
                    info!("UDP to the server is not available, staying on TCP");
                }
            }
            ServerToClient::P2PGroupMemberJoin(info) => self.on_member_join(now, info),
            ServerToClient::P2PGroupMemberLeave { group, member } => self.on_member_leave(now, group, member),
            ServerToClient::RequestP2PHolepunch { peer, internal_addr, external_addr } => {
                self.on_request_p2p_holepunch(now, peer, internal_addr, external_addr);
            }
            ServerToClient::NotifyDirectP2PEstablish { a, b, addrs } => self.on_direct_p2p_establish(now, a, b, addrs),
            ServerToClient::SuppressP2PHolepunchTrial { peer } => {
                if let Some(p) = self.peers.get_mut(&peer) {
                    if p.cancel_holepunch().is_some() {
                        debug!("hole punching to {:?} suppressed by the server", peer);
                    }
                }
            }
            ServerToClient::RenewP2PConnectionState { peer, holepunch_tag } => {
                self.on_renew_p2p_connection_state(now, peer, holepunch_tag);
            }
            ServerToClient::NewDirectP2PConnection { peer } => {
                let allow_direct_p2p = self.config.allow_direct_p2p;
                let Some(p) = self.peers.get_mut(&peer) else {
                    return;
                };
                if p.is_garbaged() || p.is_direct() || p.holepunch().is_some() || !allow_direct_p2p || !p.direct_p2p_allowed() {
                    return;
                }
                debug!("server requested hole punching to {:?}", peer);
                start_attempt(p, &mut self.pool, self.udp.as_mut(), now);
            }
            ServerToClient::NotifyDirectP2PDisconnected { peer, reason } => {
                debug!("server reports that {:?} dropped the direct link: {:?}", peer, reason);
                self.fall_back_to_relay(now, peer, FallbackReason::RequestedByServer, false);
            }
            ServerToClient::ReliableRelayed { from, frame_number, payload } => {
                let delivered = match self.peers.get_mut(&from).filter(|p| !p.is_garbaged()) {
                    Some(peer) => peer.reliable_receiver().on_frame(frame_number, payload),
                    None => {
                        debug!("relayed frame from unknown peer {:?} - dropping", from);
                        return;
                    }
                };
                for payload in delivered {
                    self.on_peer_message(now, from, &payload, true);
                }
            }
            ServerToClient::UnreliableRelayed { from, payload } => self.on_peer_message(now, from, &payload, false),
        }
    }

    fn on_request_create_udp_socket(&mut self, server_udp_addr: SocketAddr, holepunch_tag: Uuid) {
        if self.server.udp_port.is_none() {
            match self.udp.open(None) {
                Ok(local_addr) => {
                    debug!("server UDP socket on {:?}", local_addr);
                    self.server.udp_port = Some(local_addr.port());
                    self.server.internal_addr = Some(local_addr);
                }
                Err(e) => {
                    warn!("could not open a UDP socket for the server link: {:#}", e);
                    self.server.link.call(ClientToServer::CreateUdpSocketAck { ok: false });
                    return;
                }
            }
        }
        self.server.udp_tag = Some(holepunch_tag);
        self.server.transport.set_remote_addr(Some(server_udp_addr));
        self.server.link.call(ClientToServer::CreateUdpSocketAck { ok: true });
    }

    fn on_member_join(&mut self, now: Instant, info: MemberJoinInfo) {
        let group = info.group;
        let member = info.member;
        self.groups.create(group, info.custom.clone());

        let kind = if member == self.host_id {
            MemberKind::Local
        }
        else if member == HostId::SERVER {
            MemberKind::Server
        }
        else {
            MemberKind::Peer
        };
        let newly_joined = self.groups.add_member(group, member, kind);

        let mut local_port_reuse_success = false;
        if kind == MemberKind::Peer {
            let peer = match self.peers.entry(member) {
                Entry::Occupied(e) => {
                    let peer = e.into_mut();
                    if peer.is_garbaged() {
                        peer.reinit(&info, &mut self.pool, now);
                    }
                    peer
                }
                Entry::Vacant(e) => {
                    debug!("new peer {:?}, relayed until hole punching succeeds", member);
                    e.insert(RemotePeer::new(&info))
                }
            };
            peer.add_group(group);

            let eager = self.config.allow_direct_p2p && !self.config.enable_jit_p2p && peer.direct_p2p_allowed();
            if eager && peer.is_relayed() && peer.holepunch().is_none() && peer.holepunch_cooltime().is_ready(now) {
                start_attempt(peer, &mut self.pool, self.udp.as_mut(), now);
            }
            local_port_reuse_success = match (peer.fixed_bind_port(), peer.udp_port()) {
                (Some(fixed), Some(actual)) => fixed == actual,
                _ => false,
            };
        }

        if newly_joined {
            info!("{:?} joined P2P group {:?}", member, group);
            self.events.push(NetEvent::P2PMemberJoined { group, member, custom: info.custom });
        }
        self.server.link.call(ClientToServer::P2PMemberJoinAck {
            group,
            added_member: member,
            event_id: info.event_id,
            local_port_reuse_success,
        });
    }

    fn on_member_leave(&mut self, now: Instant, group: HostId, member: HostId) {
        if !self.groups.get(group).map(|g| g.contains(member)).unwrap_or(false) {
            debug!("{:?} is not a member of {:?} - ignoring leave", member, group);
            return;
        }

        if member == self.host_id {
            // whoever is left in the group is gone as far as this host is concerned
            let remaining = self.groups.member_ids(group)
                .map(|m| m.to_vec())
                .unwrap_or_default();
            for other in remaining.into_iter().filter(|m| *m != member) {
                self.member_left(now, group, other);
            }
        }
        self.member_left(now, group, member);
        self.groups.remove_empty(group);
    }

    /// Without any shared group left, a peer is torn down, and the server is told to forget the
    ///  pair.
    fn member_left(&mut self, now: Instant, group: HostId, member: HostId) {
        self.groups.remove_member(group, member);
        info!("{:?} left P2P group {:?}", member, group);

        if let Some(peer) = self.peers.get_mut(&member) {
            peer.inc_leave_event_count();
            if peer.remove_group(group) && !peer.is_garbaged() {
                info!("no group shared with {:?} any more, releasing it", member);
                peer.mark_garbaged(&mut self.pool, now);
                self.server.link.call(ClientToServer::NotifyP2PPeerReleased { peer: member });
            }
        }
        self.events.push(NetEvent::P2PMemberLeft { group, member });
    }

    fn on_request_p2p_holepunch(&mut self, now: Instant, peer_id: HostId, internal_addr: SocketAddr, external_addr: SocketAddr) {
        let allow_direct_p2p = self.config.allow_direct_p2p;
        let Some(peer) = self.peers.get_mut(&peer_id).filter(|p| !p.is_garbaged()) else {
            debug!("hole punch request for unknown peer {:?} - ignoring", peer_id);
            return;
        };
        if peer.is_direct() {
            return;
        }
        peer.set_observed_addrs(internal_addr, external_addr);

        if peer.holepunch().is_none() {
            if !allow_direct_p2p || !peer.direct_p2p_allowed() || !peer.holepunch_cooltime().is_ready(now) {
                return;
            }
            debug!("{:?} is hole punching toward us, joining in", peer_id);
            if !start_attempt(peer, &mut self.pool, self.udp.as_mut(), now) {
                return;
            }
        }
        peer.try_enter_peer_phase(&self.config);
    }

    fn on_direct_p2p_establish(&mut self, now: Instant, a: HostId, b: HostId, addrs: DirectAddrs) {
        if a != self.host_id {
            warn!("direct P2P notification for {:?} / {:?} sent to {:?} - ignoring", a, b, self.host_id);
            return;
        }
        let Some(peer) = self.peers.get_mut(&b).filter(|p| !p.is_garbaged()) else {
            return;
        };
        if peer.is_direct() {
            trace!("direct P2P to {:?} was established locally already", b);
            return;
        }
        match peer.set_direct(addrs.a_send_to_b, addrs.a_recv_from_b, now) {
            Ok(()) => self.events.push(NetEvent::DirectP2PEstablished { peer: b }),
            Err(e) => {
                warn!("cannot use the direct P2P link to {:?}: {}", b, e);
                self.events.warn(format!("cannot use the direct P2P link to {:?}: {}", b, e));
            }
        }
    }

    /// The external address of either side changed, so everything hole-punched for the pair is
    ///  stale: back to relay, and start over with the new tag.
    fn on_renew_p2p_connection_state(&mut self, now: Instant, peer_id: HostId, holepunch_tag: Uuid) {
        let eager = self.config.allow_direct_p2p && !self.config.enable_jit_p2p;
        let Some(peer) = self.peers.get_mut(&peer_id).filter(|p| !p.is_garbaged()) else {
            return;
        };
        info!("renewing P2P connection state for {:?}", peer_id);
        peer.set_holepunch_tag(holepunch_tag);
        peer.cancel_holepunch();

        if peer.is_direct() {
            let unacked = peer.set_relayed(&mut self.pool, now);
            resend_via_relay(self.server.link.as_mut(), peer_id, unacked);
            self.events.push(NetEvent::RelayP2PEnabled { peer: peer_id, reason: FallbackReason::ExternalAddrChanged });
        }
        peer.reset_attempts();
        peer.set_jit_requested(false);

        if eager && peer.direct_p2p_allowed() {
            start_attempt(peer, &mut self.pool, self.udp.as_mut(), now);
        }
        self.server.link.call(ClientToServer::RenewP2PConnectionStateAck { peer: peer_id });
    }

    /// Drops a direct link. Reliable frames that were sent directly but not acknowledged go
    ///  through the relay with their original numbers before anything else is sent.
    fn fall_back_to_relay(&mut self, now: Instant, peer_id: HostId, reason: FallbackReason, detected_locally: bool) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if !peer.is_direct() {
            return;
        }

        info!("falling back to relay for {:?}: {:?}", peer_id, reason);
        let unacked = peer.set_relayed(&mut self.pool, now);
        peer.record_fallback(now, &self.config);
        peer.set_jit_requested(false);
        resend_via_relay(self.server.link.as_mut(), peer_id, unacked);
        self.events.push(NetEvent::RelayP2PEnabled { peer: peer_id, reason });

        if detected_locally && !peer.fallback_reported() {
            peer.set_fallback_reported();
            // the peer hears it from us first, then the server updates its view
            let frame_number = peer.reliable_sender().push_relayed();
            self.server.link.call(ClientToServer::ReliableRelay {
                dests: vec![(peer_id, frame_number)],
                payload: PeerMessage::DirectP2PDisconnected { reason }.to_bytes(),
            });
            self.server.link.call(ClientToServer::NotifyDirectP2PDisconnected { peer: peer_id, reason });
        }
    }

    fn on_peer_message(&mut self, now: Instant, from: HostId, payload: &[u8], reliable: bool) {
        let message = match PeerMessage::deser(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("malformed message from {:?}: {:#}", from, e);
                return;
            }
        };

        match message {
            PeerMessage::User(payload) => self.received.push(ReceivedMessage { from, payload, reliable }),
            PeerMessage::ReportServerTimeAndPing { sent_at_micros, server_time_micros, server_ping_micros } => {
                let local_micros = self.local_micros(now) as i64;
                let reply = PeerMessage::ReportServerTimeAndPong {
                    echo_sent_at_micros: sent_at_micros,
                    server_time_micros: self.server_time_micros(now).unwrap_or(0),
                    server_ping_micros: self.server.ping.map(|p| p.as_micros() as u64).unwrap_or(0),
                };
                let Some(peer) = self.peers.get_mut(&from).filter(|p| !p.is_garbaged()) else {
                    return;
                };
                peer.set_peer_to_server_ping(non_zero_micros(server_ping_micros));
                if server_time_micros != 0 {
                    peer.set_indirect_server_time_diff(server_time_micros as i64 - local_micros);
                }
                self.send_peer_message(now, from, reply, false, SendOptions { engine_only: true });
            }
            PeerMessage::ReportServerTimeAndPong { echo_sent_at_micros, server_time_micros, server_ping_micros } => {
                let local_micros = self.local_micros(now);
                let rtt = Duration::from_micros(local_micros.saturating_sub(echo_sent_at_micros));
                let weight = self.config.ping_moving_avg_new_weight;
                let Some(peer) = self.peers.get_mut(&from).filter(|p| !p.is_garbaged()) else {
                    return;
                };
                peer.on_ping_sample(rtt, weight);
                peer.set_peer_to_server_ping(non_zero_micros(server_ping_micros));
                if server_time_micros != 0 {
                    let one_way = (rtt.as_micros() / 2) as i64;
                    peer.set_indirect_server_time_diff(server_time_micros as i64 + one_way - local_micros as i64);
                }
                if let Some(recent) = peer.recent_ping() {
                    self.server.link.call(ClientToServer::ReportPeerPing { peer: from, ping_micros: recent.as_micros() as u64 });
                }
            }
            PeerMessage::DirectP2PDisconnected { reason } => {
                debug!("{:?} dropped the direct link: {:?}", from, reason);
                self.fall_back_to_relay(now, from, FallbackReason::RequestedByPeer, false);
            }
        }
    }

    // ----- UDP

    pub fn on_datagram(&mut self, now: Instant, inbound: InboundDatagram) {
        if self.state != ConnectionState::Connected {
            trace!("{:?} is {}, dropping datagram", self.host_id, self.state.name());
            return;
        }
        let datagram = match Datagram::deser(&inbound.data) {
            Ok(d) => d,
            Err(e) => {
                warn!("dropping malformed datagram from {:?}: {:#}", inbound.from, e);
                return;
            }
        };

        if Some(inbound.local_port) == self.server.udp_port {
            self.on_server_socket_datagram(now, inbound.from, datagram);
            return;
        }

        let owner = self.peers.values()
            .find(|p| p.udp_port() == Some(inbound.local_port))
            .map(|p| p.host_id());
        match owner {
            Some(peer_id) => self.on_peer_socket_datagram(now, inbound.local_port, peer_id, inbound.from, datagram),
            None => trace!("datagram on port {}, which no peer owns - ignoring", inbound.local_port),
        }
    }

    fn on_server_socket_datagram(&mut self, now: Instant, src: SocketAddr, datagram: Datagram) {
        if !self.server.is_server_addr(src) {
            warn!("datagram on the server socket from {:?} - dropping", src);
            return;
        }

        match datagram {
            Datagram::ServerHolepunchAck { tag, target, observed_addr } => {
                if target != HostId::SERVER || Some(tag) != self.server.udp_tag {
                    debug!("server hole punch ack with wrong tag or target - ignoring");
                    return;
                }
                if self.server.transport.real_udp_enabled() {
                    self.server.transport.log_packet_received(now);
                    return;
                }

                self.server.transport.set_real_udp_enabled(true, now);
                self.server.probe_started_at = None;
                self.server.ping_countdown = Duration::ZERO;
                self.server.report_countdown = self.config.report_udp_count_interval;
                info!("UDP to the server established, external address {:?}", observed_addr);
                self.events.push(NetEvent::ServerUdpChanged { enabled: true, reason: None });

                let internal_addr = self.server.internal_addr.unwrap_or(observed_addr);
                self.server.link.call(ClientToServer::NotifyServerHolepunchSuccess { internal_addr, external_addr: observed_addr });
            }
            Datagram::ServerPong { echo_sent_at_micros, server_time_micros } => {
                self.server.udp_recv_count += 1;
                self.server.transport.log_packet_received(now);

                let local_micros = self.local_micros(now);
                let rtt = Duration::from_micros(local_micros.saturating_sub(echo_sent_at_micros));
                let weight = self.config.ping_moving_avg_new_weight;
                self.server.ping = Some(match self.server.ping {
                    Some(prev) => prev.mul_f64(1.0 - weight) + rtt.mul_f64(weight),
                    None => rtt,
                });
                // the server stamped the pong half a round trip ago
                let one_way = (rtt.as_micros() / 2) as i64;
                self.server.time_diff_micros = Some(server_time_micros as i64 + one_way - local_micros as i64);
            }
            Datagram::UnreliableRelayed { from, payload } => {
                self.server.udp_recv_count += 1;
                self.server.transport.log_packet_received(now);
                self.on_peer_message(now, from, &payload, false);
            }
            other => debug!("unexpected datagram on the server socket: {:?}", other.claimed_sender()),
        }
    }

    fn on_peer_socket_datagram(&mut self, now: Instant, local_port: u16, peer_id: HostId, src: SocketAddr, datagram: Datagram) {
        let host_id = self.host_id;
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };

        match datagram {
            Datagram::ServerHolepunchAck { tag, target, observed_addr } => {
                if target != peer_id || !self.server.is_server_addr(src) {
                    debug!("misdirected server hole punch ack from {:?} - ignoring", src);
                    return;
                }
                let Some(attempt) = peer.holepunch_mut() else {
                    return;
                };
                if !attempt.on_server_ack(&tag) {
                    debug!("stale server hole punch ack for {:?} - ignoring", peer_id);
                    return;
                }
                trace!("server sees our socket for {:?} at {:?}", peer_id, observed_addr);
                peer.try_enter_peer_phase(&self.config);
            }
            Datagram::PeerHolepunch { tag, from, sent_to } => {
                if from != peer_id || tag != peer.holepunch_tag() {
                    debug!("rejecting hole punch probe from {:?} claiming to be {:?}", src, from);
                    return;
                }
                trace!("hole punch probe from {:?} at {:?}", peer_id, src);
                send_datagram(self.udp.as_mut(), local_port, src, &Datagram::PeerHolepunchAck {
                    tag,
                    from: host_id,
                    probe_sent_to: sent_to,
                    probe_seen_from: src,
                });
            }
            Datagram::PeerHolepunchAck { tag, from, probe_sent_to, probe_seen_from } => {
                if from != peer_id {
                    return;
                }
                let Some(attempt) = peer.holepunch_mut() else {
                    trace!("late hole punch ack from {:?} - already settled", peer_id);
                    return;
                };
                if !attempt.matches(&tag) {
                    debug!("hole punch ack from {:?} with stale tag - ignoring", src);
                    return;
                }
                attempt.on_peer_ack();

                if let Err(e) = peer.set_direct(probe_sent_to, src, now) {
                    warn!("hole punch to {:?} succeeded with unusable addresses: {}", peer_id, e);
                    self.events.warn(format!("hole punch to {:?} succeeded with unusable addresses: {}", peer_id, e));
                    return;
                }
                self.events.push(NetEvent::DirectP2PEstablished { peer: peer_id });
                self.server.link.call(ClientToServer::NotifyP2PHolepunchSuccess {
                    a: host_id,
                    b: peer_id,
                    addrs: DirectAddrs {
                        a_send_to_b: probe_sent_to,
                        a_recv_from_b: src,
                        b_send_to_a: probe_seen_from,
                        b_recv_from_a: probe_seen_from,
                    },
                });
            }
            // frames are only trusted from the hole-punched address, and only that address may
            //  advance the nonce
            Datagram::Reliable { .. } | Datagram::ReliableAck { .. } | Datagram::Unreliable { .. }
                if !peer.is_direct() || peer.p2p_recv_addr() != Some(src) =>
            {
                debug!("dropping direct frame for {:?} from {:?}, which is not its hole-punched address", peer_id, src);
            }
            Datagram::Reliable { from, nonce, frame_number, payload } => {
                if from != peer_id || !peer.accept_nonce(nonce) {
                    debug!("dropping replayed or misattributed frame from {:?}", src);
                    return;
                }
                peer.log_direct_packet_received(now);
                let delivered = peer.reliable_receiver().on_frame(frame_number, payload);
                let next_expected = peer.reliable_receiver().next_expected();
                let ack_nonce = peer.next_nonce();
                send_datagram(self.udp.as_mut(), local_port, src, &Datagram::ReliableAck { from: host_id, nonce: ack_nonce, next_expected });

                for payload in delivered {
                    self.on_peer_message(now, peer_id, &payload, true);
                }
            }
            Datagram::ReliableAck { from, nonce, next_expected } => {
                if from != peer_id || !peer.accept_nonce(nonce) {
                    return;
                }
                peer.log_direct_packet_received(now);
                peer.reliable_sender().on_ack(next_expected);
            }
            Datagram::Unreliable { from, nonce, payload } => {
                if from != peer_id || !peer.accept_nonce(nonce) {
                    return;
                }
                peer.log_direct_packet_received(now);
                self.on_peer_message(now, peer_id, &payload, false);
            }
            other => debug!("unexpected datagram on the socket for {:?}: {:?}", peer_id, other.claimed_sender()),
        }
    }

    // ----- periodic

    pub fn tick(&mut self, now: Instant) {
        let elapsed = self.last_tick
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO);
        self.last_tick = Some(now);
        if self.state != ConnectionState::Connected {
            return;
        }

        self.tick_server_link(now, elapsed);
        self.tick_peers(now, elapsed);

        self.pool.expire_recycled(now, self.config.recycle_pair_reuse_window);
        self.pool.collect_garbage(self.udp.as_mut());
    }

    fn tick_server_link(&mut self, now: Instant, elapsed: Duration) {
        let config = self.config.clone();
        let local_micros = self.local_micros(now);
        let server = &mut self.server;
        let (Some(local_port), Some(server_addr), Some(tag), Some(internal_addr)) = (server.udp_port, server.transport.remote_addr(), server.udp_tag, server.internal_addr) else {
            return;
        };

        if server.transport.real_udp_enabled() {
            if server.transport.is_udp_timed_out(now, config.udp_to_tcp_fallback_timeout) {
                info!("no UDP from the server for {:?}, falling back to TCP", config.udp_to_tcp_fallback_timeout);
                server.transport.fall_back_to_tcp(now, config.max_holepunch_attempt_count, config.holepunch_retry_cooltime);
                self.events.push(NetEvent::ServerUdpChanged { enabled: false, reason: Some(FallbackReason::ServerUdpTimeout) });
                server.link.call(ClientToServer::NotifyUdpToTcpFallback { reason: FallbackReason::ServerUdpTimeout });
                return;
            }
            if countdown_due(&mut server.ping_countdown, elapsed, config.ping_interval) {
                send_datagram(self.udp.as_mut(), local_port, server_addr, &Datagram::ServerPing { tag, from: self.host_id, sent_at_micros: local_micros });
            }
            if countdown_due(&mut server.report_countdown, elapsed, config.report_udp_count_interval) {
                server.link.call(ClientToServer::ReportUdpMessageCount { received: server.udp_recv_count });
            }
            return;
        }

        match server.probe_started_at {
            None => {
                if !server.udp_acked || !server.transport.holepunch_cooltime().is_ready(now) {
                    return;
                }
                debug!("probing the server over UDP again");
                server.probe_started_at = Some(now);
                server.probe_countdown = Duration::ZERO;
            }
            Some(started) if now.saturating_duration_since(started) > config.holepunch_attempt_timeout => {
                info!("UDP to the server could not be established, staying on TCP");
                server.probe_started_at = None;
                server.transport.record_failed_attempt(now, config.max_holepunch_attempt_count, config.holepunch_retry_cooltime);
                return;
            }
            Some(_) => {}
        }

        if countdown_due(&mut server.probe_countdown, elapsed, config.server_holepunch_interval) {
            send_datagram(self.udp.as_mut(), local_port, server_addr, &Datagram::ServerHolepunch {
                tag,
                from: self.host_id,
                target: HostId::SERVER,
                internal_addr,
            });
        }
    }

    fn tick_peers(&mut self, now: Instant, elapsed: Duration) {
        let config = self.config.clone();
        let host_id = self.host_id;
        let server_ping = self.server.ping;
        let server_udp_addr = self.server.transport.remote_addr();

        let mut fallbacks = Vec::new();
        let mut pings = Vec::new();

        let mut peer_ids = self.peers.keys().copied().collect::<Vec<_>>();
        peer_ids.sort();
        for peer_id in peer_ids {
            let Some(peer) = self.peers.get_mut(&peer_id).filter(|p| !p.is_garbaged()) else {
                continue;
            };

            if peer.is_direct() {
                if peer.is_direct_timed_out(now, config.p2p_fallback_timeout) {
                    fallbacks.push((peer_id, FallbackReason::P2PUdpTimeout));
                    continue;
                }
                if relay_is_faster(peer, server_ping, config.force_relay_threshold_ratio) {
                    fallbacks.push((peer_id, FallbackReason::RelayFasterThanDirect));
                    continue;
                }
                if let Route::Direct { local_port, to } = peer.route(SendOptions { engine_only: true }) {
                    for (frame_number, payload) in peer.reliable_sender().due_for_resend(now, config.reliable_resend_interval) {
                        let nonce = peer.next_nonce();
                        send_datagram(self.udp.as_mut(), local_port, to, &Datagram::Reliable { from: host_id, nonce, frame_number, payload });
                    }
                }
            }
            else {
                match peer.holepunch().map(|a| a.is_expired(now, config.holepunch_attempt_timeout)) {
                    Some(true) => {
                        info!("hole punching to {:?} timed out, staying relayed", peer_id);
                        peer.cancel_holepunch();
                        peer.record_failed_attempt(now, &config);
                        peer.set_jit_requested(false);
                        self.events.push(NetEvent::HolepunchAbandoned { peer: peer_id });
                    }
                    Some(false) => {
                        let Some(attempt) = peer.holepunch_mut() else {
                            continue;
                        };
                        let tag = attempt.tag();
                        let probes = attempt.heartbeat(elapsed, &config);
                        if let Some(socket) = peer.udp_socket() {
                            let (local_port, internal_addr) = (socket.local_port(), socket.local_addr);
                            for probe in probes {
                                match probe {
                                    ProbeTarget::Server => {
                                        if let Some(server_addr) = server_udp_addr {
                                            send_datagram(self.udp.as_mut(), local_port, server_addr, &Datagram::ServerHolepunch { tag, from: host_id, target: peer_id, internal_addr });
                                        }
                                    }
                                    ProbeTarget::Peer(addr) => {
                                        send_datagram(self.udp.as_mut(), local_port, addr, &Datagram::PeerHolepunch { tag, from: host_id, sent_to: addr });
                                    }
                                }
                            }
                        }
                    }
                    None => {
                        // automatic retry after earlier failures, once the cooltime allows it
                        let retry = config.allow_direct_p2p
                            && !config.enable_jit_p2p
                            && peer.direct_p2p_allowed()
                            && (peer.tcp_fallback_count() > 0 || peer.holepunch_attempt_count() > 0)
                            && peer.holepunch_cooltime().is_ready(now);
                        if retry {
                            debug!("retrying hole punching to {:?}", peer_id);
                            start_attempt(peer, &mut self.pool, self.udp.as_mut(), now);
                        }
                    }
                }
            }

            if peer.ping_due(elapsed, config.ping_interval) {
                pings.push(peer_id);
            }
        }

        for (peer_id, reason) in fallbacks {
            self.fall_back_to_relay(now, peer_id, reason, true);
        }

        let ping = PeerMessage::ReportServerTimeAndPing {
            sent_at_micros: self.local_micros(now),
            server_time_micros: self.server_time_micros(now).unwrap_or(0),
            server_ping_micros: server_ping.map(|p| p.as_micros() as u64).unwrap_or(0),
        };
        for peer_id in pings {
            self.send_peer_message(now, peer_id, ping.clone(), false, SendOptions { engine_only: true });
        }
    }

    // ----- teardown

    /// Releases all peers and starts closing every socket. Completion is driven by
    ///  [ClientCore::poll_disconnect].
    pub fn begin_disconnect(&mut self, now: Instant) -> Result<(), NetError> {
        self.check_connected()?;
        info!("disconnecting {:?}", self.host_id);
        self.state = ConnectionState::Disconnecting;

        for peer in self.peers.values_mut() {
            peer.mark_garbaged(&mut self.pool, now);
        }
        self.groups.clear();

        let mut closing = self.pool.drain_all(self.udp.as_mut());
        if let Some(port) = self.server.udp_port.take() {
            self.udp.begin_close(port);
            if !self.udp.is_closed(port) {
                closing.push(port);
            }
        }
        self.server.transport.set_real_udp_enabled(false, now);
        self.disconnect = Some(Disconnect::new(closing, now, self.config.socket_close_timeout()));
        Ok(())
    }

    /// Sockets still busy when the timeout elapses are parked with the I/O layer rather than
    ///  waited for. Before [ClientCore::begin_disconnect], this reports `Pending`.
    pub fn poll_disconnect(&mut self, now: Instant) -> DisconnectProgress {
        let Some(disconnect) = self.disconnect.as_mut() else {
            return if self.state == ConnectionState::Disconnected {
                DisconnectProgress::Completed
            }
            else {
                DisconnectProgress::Pending
            };
        };

        let progress = disconnect.poll(now, self.udp.as_ref());
        if progress == DisconnectProgress::Pending {
            return progress;
        }
        if let DisconnectProgress::TimedOut { busy_ports } = &progress {
            for &port in busy_ports {
                warn!("socket on port {} still busy after {:?}, parking it", port, self.config.socket_close_timeout());
                self.udp.park(port);
            }
        }

        self.disconnect = None;
        self.state = ConnectionState::Disconnected;
        self.peers.clear();
        info!("{:?} disconnected", self.host_id);
        self.events.push(NetEvent::Disconnected);
        progress
    }
}

fn ensure_peer_socket(peer: &mut RemotePeer, pool: &mut SocketPool, udp: &mut dyn UdpIo, now: Instant) -> anyhow::Result<()> {
    if peer.udp_socket().is_some() {
        return Ok(());
    }
    let socket = match pool.take_recycled_for(peer.host_id()) {
        Some(socket) => socket,
        None => {
            let local_addr = udp.open(peer.fixed_bind_port())
                .with_context(|| format!("open UDP socket for {:?}", peer.host_id()))?;
            PooledSocket::new(local_addr, peer.host_id())
        }
    };
    peer.attach_socket(socket, pool, now);
    Ok(())
}

fn start_attempt(peer: &mut RemotePeer, pool: &mut SocketPool, udp: &mut dyn UdpIo, now: Instant) -> bool {
    if let Err(e) = ensure_peer_socket(peer, pool, udp, now) {
        warn!("cannot hole punch to {:?}: {:#}", peer.host_id(), e);
        return false;
    }
    peer.start_holepunch(now).is_ok()
}

fn resend_via_relay(link: &mut dyn ServerLink, peer_id: HostId, frames: Vec<(u32, Bytes)>) {
    for (frame_number, payload) in frames {
        link.call(ClientToServer::ReliableRelay { dests: vec![(peer_id, frame_number)], payload });
    }
}

/// Relay wins if `relay_ping * ratio < direct_ping`. The direct link must have produced a ping
///  sample of its own first.
fn relay_is_faster(peer: &RemotePeer, server_ping: Option<Duration>, ratio: f64) -> bool {
    if ratio <= 0.0 || peer.relayed_ping_needs_reset() {
        return false;
    }
    match (peer.relay_ping(server_ping), peer.recent_ping()) {
        (Some(relay), Some(direct)) => relay.mul_f64(ratio) < direct,
        _ => false,
    }
}

fn non_zero_micros(micros: u64) -> Option<Duration> {
    if micros == 0 {
        None
    }
    else {
        Some(Duration::from_micros(micros))
    }
}

/// true when due, restarting the countdown at `interval`
fn countdown_due(countdown: &mut Duration, elapsed: Duration, interval: Duration) -> bool {
    match countdown.checked_sub(elapsed) {
        Some(remaining) if !remaining.is_zero() => {
            *countdown = remaining;
            false
        }
        _ => {
            *countdown = interval;
            true
        }
    }
}
