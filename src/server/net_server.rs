use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::NetConfig;
use crate::error::NetError;
use crate::events::{LocalEventQueue, NetEvent};
use crate::group::join_ack::{JoinAckTable, JoinCompletion};
use crate::group::{GroupTable, MemberKind};
use crate::host_id::{new_host_id_factory, HostId, HostIdFactory};
use crate::messaging::peer_message::PeerMessage;
use crate::messaging::relay::RelayList;
use crate::messaging::rpc::{ClientLinks, ClientToServer, MemberJoinInfo, ServerToClient};
use crate::messaging::wire::Datagram;
use crate::messaging::ReceivedMessage;
use crate::server::p2p_pairs::P2PPairTable;
use crate::server::remote_client::RemoteClient;
use crate::transport::udp_io::{send_datagram, InboundDatagram, UdpIo};

/// The server's connectivity coordinator. It is the authority for group membership and for the
///  state of each P2P pair, and it relays traffic between clients that are not directly
///  connected.
///
/// All methods expect the caller to hold the server's main lock (which `&mut self` proves), and
///  take the current time explicitly.
pub struct ServerCore {
    config: Arc<NetConfig>,
    host_ids: Box<dyn HostIdFactory>,
    clients: FxHashMap<HostId, RemoteClient>,
    groups: GroupTable,
    pairs: P2PPairTable,
    join_acks: JoinAckTable,
    links: Box<dyn ClientLinks>,
    udp: Box<dyn UdpIo>,
    udp_addr: Option<SocketAddr>,
    events: LocalEventQueue,
    /// application messages relayed to the server as a group member
    inbox: Vec<ReceivedMessage>,
    started_at: Instant,
    next_event_id: u32,
}

impl ServerCore {
    pub fn new(config: Arc<NetConfig>, links: Box<dyn ClientLinks>, udp: Box<dyn UdpIo>, now: Instant) -> ServerCore {
        ServerCore {
            host_ids: new_host_id_factory(&config),
            config,
            clients: FxHashMap::default(),
            groups: GroupTable::new(),
            pairs: P2PPairTable::new(),
            join_acks: JoinAckTable::new(),
            links,
            udp,
            udp_addr: None,
            events: LocalEventQueue::new(),
            inbox: Vec::new(),
            started_at: now,
            next_event_id: 0,
        }
    }

    pub fn open_udp(&mut self, preferred_port: Option<u16>) -> anyhow::Result<SocketAddr> {
        let addr = self.udp.open(preferred_port)?;
        info!("server UDP socket on {:?}", addr);
        self.udp_addr = Some(addr);
        Ok(addr)
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn client(&self, host_id: HostId) -> Option<&RemoteClient> {
        self.clients.get(&host_id)
    }

    pub fn client_ids(&self) -> Vec<HostId> {
        let mut result = self.clients.keys().copied().collect::<Vec<_>>();
        result.sort();
        result
    }

    pub fn groups(&self) -> &GroupTable {
        &self.groups
    }

    pub fn pairs(&self) -> &P2PPairTable {
        &self.pairs
    }

    pub fn join_acks(&self) -> &JoinAckTable {
        &self.join_acks
    }

    pub fn server_time_micros(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.started_at).as_micros() as u64
    }

    pub fn drain_events(&mut self) -> Vec<NetEvent> {
        self.events.drain()
    }

    pub fn take_inbox(&mut self) -> Vec<ReceivedMessage> {
        std::mem::take(&mut self.inbox)
    }

    /// Registers a client whose TCP session was established. `requested` is only honored by the
    ///  externally assigned host id policy.
    pub fn on_client_connected(&mut self, now: Instant, requested: HostId) -> Result<HostId, NetError> {
        let host_id = self.host_ids.create(now, requested);
        if host_id.is_none() || self.clients.contains_key(&host_id) {
            warn!("could not issue a host id for a new client (requested {:?})", requested);
            return Err(NetError::HostIdUnavailable(requested));
        }
        info!("client {:?} connected", host_id);
        self.clients.insert(host_id, RemoteClient::new(host_id, now));
        self.events.push(NetEvent::ClientJoined { host_id });
        Ok(host_id)
    }

    pub fn on_client_disconnected(&mut self, now: Instant, host_id: HostId) {
        let Some(client) = self.clients.get(&host_id) else {
            debug!("disconnect of unknown client {:?} - ignoring", host_id);
            return;
        };

        let mut groups = client.joined_groups().iter().copied().collect::<Vec<_>>();
        groups.sort();
        for group in groups {
            let _ = self.leave_p2p_group(group, host_id);
        }

        for key in self.pairs.remove_host(host_id) {
            debug!("removing leftover P2P pair {:?}", key);
        }
        for completion in self.join_acks.remove_member(None, host_id) {
            self.on_join_completed(completion);
        }

        self.clients.remove(&host_id);
        self.host_ids.drop_id(now, host_id);
        info!("client {:?} disconnected", host_id);
        self.events.push(NetEvent::ClientLeft { host_id });
    }

    fn next_event_id(&mut self) -> u32 {
        self.next_event_id = self.next_event_id.wrapping_add(1);
        self.next_event_id
    }

    // ----- group API

    /// Creates a group with the given initial members. The group id comes from the host id
    ///  allocator, so it never collides with a client's id.
    pub fn create_p2p_group(&mut self, now: Instant, members: &[HostId], custom: Bytes) -> Result<HostId, NetError> {
        if let Some(unknown) = members.iter().find(|m| **m != HostId::SERVER && !self.clients.contains_key(m)) {
            return Err(NetError::UnknownPeer(*unknown));
        }

        let group = self.host_ids.create(now, HostId::NONE);
        if group.is_none() {
            return Err(NetError::HostIdUnavailable(HostId::NONE));
        }
        info!("creating P2P group {:?} with {:?}", group, members);
        self.groups.create(group, custom);

        for member in members {
            self.join_p2p_group(now, group, *member)?;
        }
        Ok(group)
    }

    /// Adds `member` to `group`: every existing member learns about the new member and vice
    ///  versa, and the join completes once everyone acknowledged (or the ack waiter times out).
    pub fn join_p2p_group(&mut self, now: Instant, group: HostId, member: HostId) -> Result<(), NetError> {
        let (existing, custom) = match self.groups.get(group) {
            None => return Err(NetError::UnknownGroup(group)),
            Some(g) if g.contains(member) => return Ok(()),
            Some(g) => (g.member_ids().to_vec(), g.custom().clone()),
        };

        let member_is_client = self.clients.contains_key(&member);
        let kind = if member == HostId::SERVER {
            MemberKind::Server
        }
        else if member_is_client {
            MemberKind::Peer
        }
        else {
            return Err(NetError::UnknownPeer(member));
        };

        self.groups.add_member(group, member, kind);
        if let Some(client) = self.clients.get_mut(&member) {
            client.add_group(group);
        }

        let event_id = self.next_event_id();
        let mut expected = Vec::new();
        for other in existing {
            let other_is_client = self.clients.contains_key(&other);
            if other_is_client && member_is_client {
                self.pairs.add_ref(other, member);
            }
            if other_is_client {
                let info = self.join_info(group, &custom, other, member, event_id);
                self.links.call(other, ServerToClient::P2PGroupMemberJoin(info));
                expected.push((other, member));
            }
            if member_is_client {
                let info = self.join_info(group, &custom, member, other, event_id);
                self.links.call(member, ServerToClient::P2PGroupMemberJoin(info));
                expected.push((member, other));
            }
        }
        if member_is_client {
            let info = self.join_info(group, &custom, member, member, event_id);
            self.links.call(member, ServerToClient::P2PGroupMemberJoin(info));
            expected.push((member, member));
        }

        info!("{:?} joined P2P group {:?}", member, group);
        if let Some(completion) = self.join_acks.start(group, member, event_id, expected, now) {
            self.on_join_completed(completion);
        }
        Ok(())
    }

    /// `member` as announced to `receiver`
    fn join_info(&self, group: HostId, custom: &Bytes, receiver: HostId, member: HostId, event_id: u32) -> MemberJoinInfo {
        let pair = if receiver != member {
            self.pairs.get(receiver, member)
        }
        else {
            None
        };

        match pair {
            Some(pair) => MemberJoinInfo {
                group,
                member,
                custom: custom.clone(),
                session_key: pair.session_key().clone(),
                first_frame_to_member: pair.first_frame_from(receiver),
                first_frame_from_member: pair.first_frame_from(member),
                holepunch_tag: pair.holepunch_tag(),
                direct_p2p_enabled: self.config.allow_direct_p2p,
                fixed_bind_port: self.config.fixed_p2p_bind_port,
                event_id,
            },
            // the receiver itself, or the server
            None => MemberJoinInfo {
                group,
                member,
                custom: custom.clone(),
                session_key: Bytes::new(),
                first_frame_to_member: 0,
                first_frame_from_member: 0,
                holepunch_tag: Uuid::nil(),
                direct_p2p_enabled: false,
                fixed_bind_port: None,
                event_id,
            },
        }
    }

    pub fn leave_p2p_group(&mut self, group: HostId, member: HostId) -> Result<(), NetError> {
        let Some(g) = self.groups.get(group) else {
            return Err(NetError::UnknownGroup(group));
        };
        if !g.contains(member) {
            return Err(NetError::UnknownPeer(member));
        }

        self.groups.remove_member(group, member);
        let remaining = self.groups.member_ids(group)
            .map(|m| m.to_vec())
            .unwrap_or_default();
        if let Some(client) = self.clients.get_mut(&member) {
            client.remove_group(group);
        }

        let member_is_client = self.clients.contains_key(&member);
        for other in remaining {
            let other_is_client = self.clients.contains_key(&other);
            if other_is_client {
                self.links.call(other, ServerToClient::P2PGroupMemberLeave { group, member });
            }
            if member_is_client {
                self.links.call(member, ServerToClient::P2PGroupMemberLeave { group, member: other });
            }
            if other_is_client && member_is_client {
                self.pairs.release(other, member);
            }
        }
        if member_is_client {
            self.links.call(member, ServerToClient::P2PGroupMemberLeave { group, member });
        }

        for completion in self.join_acks.remove_member(Some(group), member) {
            self.on_join_completed(completion);
        }
        info!("{:?} left P2P group {:?}", member, group);
        Ok(())
    }

    pub fn destroy_p2p_group(&mut self, now: Instant, group: HostId) -> Result<(), NetError> {
        let members = self.groups.member_ids(group)
            .ok_or(NetError::UnknownGroup(group))?
            .to_vec();
        for member in members {
            self.leave_p2p_group(group, member)?;
        }
        self.groups.remove_group(group);
        self.join_acks.remove_group(group);
        self.host_ids.drop_id(now, group);
        info!("destroyed P2P group {:?}", group);
        Ok(())
    }

    fn on_join_completed(&mut self, completion: JoinCompletion) {
        debug!("join of {:?} to group {:?} completed", completion.member, completion.group);
        self.events.push(NetEvent::P2PGroupJoinCompleted {
            group: completion.group,
            member: completion.member,
            missing_acks: completion.missing_acks,
        });
    }

    // ----- RPC

    pub fn on_rpc(&mut self, now: Instant, from: HostId, rpc: ClientToServer) {
        if !self.clients.contains_key(&from) {
            warn!("RPC from unknown client {:?} - ignoring", from);
            return;
        }
        trace!("RPC from {:?}: {:?}", from, rpc);

        match rpc {
            ClientToServer::RequestCreateUdpSocket => self.on_request_create_udp_socket(from),
            ClientToServer::CreateUdpSocketAck { ok } => {
                if ok {
                    self.links.call(from, ServerToClient::CreateUdpSocketAck { ok: true });
                }
                else {
                    info!("{:?} could not create a UDP socket, staying on TCP", from);
                }
            }
            ClientToServer::NotifyServerHolepunchSuccess { internal_addr, external_addr } => {
                self.on_server_holepunch_success(now, from, internal_addr, external_addr);
            }
            ClientToServer::ReportUdpMessageCount { received } => {
                if let Some(client) = self.clients.get_mut(&from) {
                    client.set_reported_udp_recv_count(received);
                    debug!("{:?} received {} of {} UDP messages", from, received, client.udp_sent_count());
                }
            }
            ClientToServer::NotifyUdpToTcpFallback { reason } => {
                if let Some(client) = self.clients.get_mut(&from) {
                    info!("{:?} fell back to TCP: {:?}", from, reason);
                    client.transport.set_real_udp_enabled(false, now);
                }
            }
            ClientToServer::P2PMemberJoinAck { group, added_member, event_id, local_port_reuse_success } => {
                trace!("join ack from {:?} for {:?} in {:?} (port reuse: {})", from, added_member, group, local_port_reuse_success);
                if let Some(completion) = self.join_acks.on_ack(from, group, added_member, event_id) {
                    self.on_join_completed(completion);
                }
            }
            ClientToServer::NotifyP2PHolepunchSuccess { a, b, addrs } => {
                if a != from {
                    warn!("{:?} reported hole punch success on behalf of {:?} - ignoring", from, a);
                    self.events.warn(format!("{:?} reported hole punch success on behalf of {:?}", from, a));
                    return;
                }
                let Some(pair) = self.pairs.get_mut(a, b) else {
                    debug!("hole punch success for {:?} / {:?}, which are not a pair (any more)", a, b);
                    return;
                };
                if pair.is_direct() {
                    debug!("{:?} / {:?} are already directly connected - suppressing", a, b);
                    self.links.call(a, ServerToClient::SuppressP2PHolepunchTrial { peer: b });
                    return;
                }
                pair.set_direct();
                info!("direct P2P between {:?} and {:?} established", a, b);
                self.links.call(a, ServerToClient::NotifyDirectP2PEstablish { a, b, addrs });
                self.links.call(b, ServerToClient::NotifyDirectP2PEstablish { a: b, b: a, addrs: addrs.swapped() });
                self.links.call(b, ServerToClient::SuppressP2PHolepunchTrial { peer: a });
            }
            ClientToServer::NotifyDirectP2PDisconnected { peer, reason } => {
                let Some(pair) = self.pairs.get_mut(from, peer) else {
                    return;
                };
                if !pair.is_direct() {
                    debug!("{:?} / {:?} reported direct P2P loss, but are relayed already", from, peer);
                    return;
                }
                pair.set_relayed();
                info!("direct P2P between {:?} and {:?} lost: {:?}", from, peer, reason);
                if self.config.notify_opposite_on_p2p_fallback {
                    self.links.call(peer, ServerToClient::NotifyDirectP2PDisconnected { peer: from, reason });
                }
            }
            ClientToServer::NotifyJitDirectP2PTriggered { peer } => {
                let Some(pair) = self.pairs.get_mut(from, peer) else {
                    return;
                };
                if pair.is_direct() || pair.jit_triggered() {
                    return;
                }
                pair.set_jit_triggered();
                debug!("JIT P2P triggered by {:?} toward {:?}", from, peer);
                self.links.call(from, ServerToClient::NewDirectP2PConnection { peer });
                self.links.call(peer, ServerToClient::NewDirectP2PConnection { peer: from });
            }
            ClientToServer::NotifyP2PPeerReleased { peer } => {
                if self.pairs.get(from, peer).is_some() {
                    warn!("{:?} released {:?}, but they still share a group", from, peer);
                }
                else {
                    debug!("{:?} released {:?}", from, peer);
                }
            }
            ClientToServer::ReportPeerPing { peer, ping_micros } => {
                if let Some(pair) = self.pairs.get_mut(from, peer) {
                    pair.set_ping(std::time::Duration::from_micros(ping_micros));
                }
            }
            ClientToServer::RenewP2PConnectionStateAck { peer } => {
                debug!("{:?} renewed its connection state for {:?}", from, peer);
            }
            ClientToServer::ReliableRelay { dests, payload } => {
                for (dest, frame_number) in dests {
                    if dest == HostId::SERVER {
                        self.deliver_to_inbox(from, &payload, true);
                    }
                    else if self.pairs.get(from, dest).is_some() {
                        self.links.call(dest, ServerToClient::ReliableRelayed { from, frame_number, payload: payload.clone() });
                    }
                    else {
                        warn!("{:?} relayed to {:?}, which it does not share a group with - dropping", from, dest);
                    }
                }
            }
            ClientToServer::UnreliableRelay { relay_list, payload } => {
                self.relay_unreliable(from, &relay_list, payload);
            }
        }
    }

    fn on_request_create_udp_socket(&mut self, from: HostId) {
        let Some(client) = self.clients.get_mut(&from) else {
            return;
        };
        match self.udp_addr {
            Some(server_udp_addr) => {
                client.set_udp_requested();
                self.links.call(from, ServerToClient::RequestCreateUdpSocket { server_udp_addr, holepunch_tag: client.udp_tag() });
            }
            None => {
                debug!("{:?} requested UDP, but the server has no UDP socket", from);
                self.links.call(from, ServerToClient::CreateUdpSocketAck { ok: false });
            }
        }
    }

    fn on_server_holepunch_success(&mut self, now: Instant, from: HostId, internal_addr: SocketAddr, external_addr: SocketAddr) {
        let Some(client) = self.clients.get_mut(&from) else {
            return;
        };
        let changed = client.set_addrs(internal_addr, external_addr);
        client.transport.set_real_udp_enabled(true, now);
        info!("UDP to {:?} enabled, external address {:?}", from, external_addr);
        if changed {
            self.on_external_addr_changed(from);
        }
    }

    /// Hole-punched addresses of all of a client's pairs are stale: every pair starts a new epoch
    ///  with a fresh tag, and both ends are told to renew.
    fn on_external_addr_changed(&mut self, host_id: HostId) {
        for key in self.pairs.pairs_of(host_id) {
            let Some(other) = key.other(host_id) else {
                continue;
            };
            let Some(pair) = self.pairs.get_mut(host_id, other) else {
                continue;
            };
            let holepunch_tag = pair.renew();
            info!("renewing P2P connection state of {:?} / {:?}", host_id, other);
            self.links.call(host_id, ServerToClient::RenewP2PConnectionState { peer: other, holepunch_tag });
            self.links.call(other, ServerToClient::RenewP2PConnectionState { peer: host_id, holepunch_tag });
        }
    }

    fn relay_unreliable(&mut self, from: HostId, relay_list: &RelayList, payload: Bytes) {
        let groups = &self.groups;
        // only groups the sender is a member of can be used as a shorthand
        let targets = relay_list.expand(from, |g| {
            groups.get(g)
                .filter(|g| g.contains(from))
                .map(|g| g.member_ids())
        });

        for target in targets {
            if target == HostId::SERVER {
                self.deliver_to_inbox(from, &payload, false);
                continue;
            }
            let Some(client) = self.clients.get_mut(&target) else {
                debug!("relay target {:?} is not connected - skipping", target);
                continue;
            };
            if !self.groups.shares_any_group(from, target) {
                warn!("{:?} relayed to {:?}, which it does not share a group with - dropping", from, target);
                continue;
            }

            match (client.udp_addr(), self.udp_addr) {
                (Some(to), Some(local)) => {
                    client.inc_udp_sent_count();
                    send_datagram(self.udp.as_mut(), local.port(), to, &Datagram::UnreliableRelayed { from, payload: payload.clone() });
                }
                _ => {
                    self.links.call(target, ServerToClient::UnreliableRelayed { from, payload: payload.clone() });
                }
            }
        }
    }

    fn deliver_to_inbox(&mut self, from: HostId, payload: &[u8], reliable: bool) {
        match PeerMessage::deser(payload) {
            Ok(PeerMessage::User(payload)) => self.inbox.push(ReceivedMessage { from, payload, reliable }),
            Ok(other) => trace!("ignoring {:?} from {:?} addressed to the server", other, from),
            Err(e) => warn!("malformed relayed message from {:?}: {:#}", from, e),
        }
    }

    // ----- UDP

    pub fn on_datagram(&mut self, now: Instant, inbound: InboundDatagram) {
        let src = inbound.from;
        let datagram = match Datagram::deser(&inbound.data) {
            Ok(d) => d,
            Err(e) => {
                warn!("dropping malformed datagram from {:?}: {:#}", src, e);
                return;
            }
        };

        match datagram {
            Datagram::ServerHolepunch { tag, from, target, internal_addr } => {
                self.on_server_holepunch(now, inbound.local_port, src, tag, from, target, internal_addr);
            }
            Datagram::ServerPing { tag, from, sent_at_micros } => {
                let server_time_micros = self.server_time_micros(now);
                let Some(client) = self.clients.get_mut(&from) else {
                    debug!("ping from unknown client {:?} at {:?} - ignoring", from, src);
                    return;
                };
                if !client.udp_requested() {
                    return;
                }
                // the tag is the only proof that a ping from a new address comes from the client
                if tag != client.udp_tag() {
                    warn!("ping claiming to be from {:?} arrived from {:?} with wrong tag - dropping", from, src);
                    return;
                }
                client.transport.log_packet_received(now);
                let changed = client.transport.real_udp_enabled() && client.external_addr() != Some(src);
                if changed {
                    let internal_addr = client.internal_addr().unwrap_or(src);
                    client.set_addrs(internal_addr, src);
                }
                client.inc_udp_sent_count();
                send_datagram(self.udp.as_mut(), inbound.local_port, src, &Datagram::ServerPong { echo_sent_at_micros: sent_at_micros, server_time_micros });
                if changed {
                    self.on_external_addr_changed(from);
                }
            }
            Datagram::UnreliableRelay { from, relay_list, payload } => {
                match self.clients.get_mut(&from) {
                    Some(client) if client.external_addr() == Some(src) => {
                        client.transport.log_packet_received(now);
                    }
                    _ => {
                        warn!("relay datagram claiming to be from {:?} arrived from {:?} - dropping", from, src);
                        return;
                    }
                }
                self.relay_unreliable(from, &relay_list, payload);
            }
            other => {
                debug!("unexpected datagram from {:?}: {:?} - ignoring", src, other.claimed_sender());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_server_holepunch(&mut self, now: Instant, local_port: u16, src: SocketAddr, tag: Uuid, from: HostId, target: HostId, internal_addr: SocketAddr) {
        let Some(client) = self.clients.get_mut(&from) else {
            debug!("hole punch probe from unknown client {:?} at {:?} - ignoring", from, src);
            return;
        };

        if target == HostId::SERVER {
            if tag != client.udp_tag() {
                warn!("server hole punch probe from {:?} with wrong tag - ignoring", src);
                return;
            }
            client.transport.log_packet_received(now);
            let changed = client.transport.real_udp_enabled() && client.external_addr() != Some(src);
            if changed {
                client.set_addrs(internal_addr, src);
            }
            client.inc_udp_sent_count();
            send_datagram(self.udp.as_mut(), local_port, src, &Datagram::ServerHolepunchAck { tag, target, observed_addr: src });
            if changed {
                self.on_external_addr_changed(from);
            }
            return;
        }

        let Some(pair) = self.pairs.get_mut(from, target) else {
            debug!("hole punch probe from {:?} for {:?}, which are not a pair - ignoring", from, target);
            return;
        };
        if pair.holepunch_tag() != tag {
            debug!("hole punch probe from {:?} for {:?} with stale tag - ignoring", from, target);
            return;
        }

        send_datagram(self.udp.as_mut(), local_port, src, &Datagram::ServerHolepunchAck { tag, target, observed_addr: src });
        if pair.set_observed_addrs(from, internal_addr, src) {
            debug!("{:?} is reachable for {:?} at {:?} / {:?}", from, target, src, internal_addr);
            self.links.call(target, ServerToClient::RequestP2PHolepunch { peer: from, internal_addr, external_addr: src });
        }
    }

    // ----- periodic

    pub fn tick(&mut self, now: Instant) {
        for completion in self.join_acks.expire(now, self.config.join_ack_timeout) {
            self.on_join_completed(completion);
        }

        for client in self.clients.values_mut() {
            if client.transport.is_udp_timed_out(now, self.config.udp_to_tcp_fallback_timeout) {
                info!("no UDP from {:?} for {:?}, using TCP", client.host_id(), self.config.udp_to_tcp_fallback_timeout);
                client.transport.set_real_udp_enabled(false, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::events::FallbackReason;
    use crate::messaging::rpc::DirectAddrs;
    use crate::test_util::mesh::{SimNetwork, SimUdpIo, SERVER_IP};

    fn addr(s: &str) -> SocketAddr {
        SocketAddr::from_str(s).unwrap()
    }

    struct Fixture {
        server: ServerCore,
        rpcs: mpsc::UnboundedReceiver<(HostId, ServerToClient)>,
        now: Instant,
    }
    impl Fixture {
        fn new(num_clients: usize) -> Fixture {
            let now = Instant::now();
            let net = Arc::new(Mutex::new(SimNetwork::new()));
            let (send, rpcs) = mpsc::unbounded_channel();
            let udp = SimUdpIo::new(net, SERVER_IP);
            let mut server = ServerCore::new(Arc::new(NetConfig::new()), Box::new(send), Box::new(udp), now);
            server.open_udp(Some(7000)).unwrap();
            for _ in 0..num_clients {
                server.on_client_connected(now, HostId::NONE).unwrap();
            }
            server.drain_events();
            Fixture { server, rpcs, now }
        }

        fn rpcs(&mut self) -> Vec<(HostId, ServerToClient)> {
            let mut result = Vec::new();
            while let Ok(rpc) = self.rpcs.try_recv() {
                result.push(rpc);
            }
            result
        }

        fn joins_to(&mut self, to: HostId) -> Vec<MemberJoinInfo> {
            self.rpcs().into_iter()
                .filter(|(h, _)| *h == to)
                .filter_map(|(_, rpc)| match rpc {
                    ServerToClient::P2PGroupMemberJoin(info) => Some(info),
                    _ => None,
                })
                .collect()
        }
    }

    const C1: HostId = HostId(3);
    const C2: HostId = HostId(4);
    const C3: HostId = HostId(5);

    #[test]
    fn test_client_ids_are_issued() {
        let fixture = Fixture::new(3);
        assert_eq!(fixture.server.client_ids(), vec![C1, C2, C3]);
    }

    #[test]
    fn test_join_announces_members_both_ways() {
        let mut f = Fixture::new(2);
        let group = f.server.create_p2p_group(f.now, &[C1], Bytes::from_static(b"lobby")).unwrap();
        assert_eq!(f.joins_to(C1).len(), 1);
        assert_eq!(f.server.drain_events(), vec![]);

        f.server.join_p2p_group(f.now, group, C2).unwrap();
        let rpcs = f.rpcs();
        let to_c1 = rpcs.iter()
            .filter_map(|(h, rpc)| match rpc { ServerToClient::P2PGroupMemberJoin(info) if *h == C1 => Some(info.clone()), _ => None })
            .collect::<Vec<_>>();
        let to_c2 = rpcs.iter()
            .filter_map(|(h, rpc)| match rpc { ServerToClient::P2PGroupMemberJoin(info) if *h == C2 => Some(info.clone()), _ => None })
            .collect::<Vec<_>>();

        assert_eq!(to_c1.iter().map(|i| i.member).collect::<Vec<_>>(), vec![C2]);
        assert_eq!(to_c2.iter().map(|i| i.member).collect::<Vec<_>>(), vec![C1, C2]);

        // both sides agree on the pair's session state, with mirrored frame numbers
        let (c2_seen_by_c1, c1_seen_by_c2) = (&to_c1[0], &to_c2[0]);
        assert_eq!(c2_seen_by_c1.holepunch_tag, c1_seen_by_c2.holepunch_tag);
        assert_eq!(c2_seen_by_c1.session_key, c1_seen_by_c2.session_key);
        assert_eq!(c2_seen_by_c1.first_frame_to_member, c1_seen_by_c2.first_frame_from_member);
        assert_eq!(c2_seen_by_c1.first_frame_from_member, c1_seen_by_c2.first_frame_to_member);
        assert!(c2_seen_by_c1.direct_p2p_enabled);
        assert_eq!(c2_seen_by_c1.custom, Bytes::from_static(b"lobby"));
        assert_eq!(c2_seen_by_c1.event_id, c1_seen_by_c2.event_id);
        assert_eq!(f.server.pairs().get(C1, C2).unwrap().ref_count(), 1);
    }

    #[test]
    fn test_join_completes_with_all_acks() {
        let mut f = Fixture::new(2);
        let group = f.server.create_p2p_group(f.now, &[C1, C2], Bytes::new()).unwrap();
        let event_id = f.joins_to(C2)[0].event_id;
        f.server.drain_events();

        for (acker, added_member) in [(C1, C2), (C2, C1), (C2, C2)] {
            f.server.on_rpc(f.now, acker, ClientToServer::P2PMemberJoinAck { group, added_member, event_id, local_port_reuse_success: false });
        }
        assert_eq!(f.server.drain_events(), vec![NetEvent::P2PGroupJoinCompleted { group, member: C2, missing_acks: vec![] }]);
    }

    #[test]
    fn test_join_times_out_with_missing_acks() {
        let mut f = Fixture::new(2);
        let group = f.server.create_p2p_group(f.now, &[C1, C2], Bytes::new()).unwrap();
        let event_id = f.joins_to(C2)[0].event_id;
        f.server.drain_events();
        f.server.on_rpc(f.now, C2, ClientToServer::P2PMemberJoinAck { group, added_member: C2, event_id, local_port_reuse_success: false });
        f.server.on_rpc(f.now, C2, ClientToServer::P2PMemberJoinAck { group, added_member: C1, event_id, local_port_reuse_success: false });

        f.server.tick(f.now + Duration::from_secs(5));
        assert_eq!(f.server.drain_events(), vec![]);
        f.server.tick(f.now + Duration::from_secs(11));
        assert_eq!(f.server.drain_events(), vec![
            NetEvent::P2PGroupJoinCompleted { group, member: C1, missing_acks: vec![C1] },
            NetEvent::P2PGroupJoinCompleted { group, member: C2, missing_acks: vec![C1] },
        ]);
    }

    #[rstest::rstest]
    #[case::unknown_group(HostId(99), C1, Err(NetError::UnknownGroup(HostId(99))))]
    #[case::unknown_member(HostId(0), HostId(77), Err(NetError::UnknownPeer(HostId(77))))]
    #[case::already_member(HostId(0), C1, Ok(()))]
    fn test_join_preconditions(#[case] group: HostId, #[case] member: HostId, #[case] expected: Result<(), NetError>) {
        let mut f = Fixture::new(1);
        let created = f.server.create_p2p_group(f.now, &[C1], Bytes::new()).unwrap();
        let group = if group == HostId(0) { created } else { group };
        assert_eq!(f.server.join_p2p_group(f.now, group, member), expected);
    }

    #[test]
    fn test_pair_ref_counted_across_groups() {
        let mut f = Fixture::new(2);
        let g1 = f.server.create_p2p_group(f.now, &[C1, C2], Bytes::new()).unwrap();
        let g2 = f.server.create_p2p_group(f.now, &[C1, C2], Bytes::new()).unwrap();
        assert_eq!(f.server.pairs().get(C1, C2).unwrap().ref_count(), 2);

        f.server.leave_p2p_group(g1, C2).unwrap();
        assert!(f.server.pairs().get(C1, C2).is_some());
        f.rpcs();
        f.server.leave_p2p_group(g2, C2).unwrap();
        assert!(f.server.pairs().get(C1, C2).is_none());

        let rpcs = f.rpcs();
        assert!(rpcs.contains(&(C1, ServerToClient::P2PGroupMemberLeave { group: g2, member: C2 })));
        assert!(rpcs.contains(&(C2, ServerToClient::P2PGroupMemberLeave { group: g2, member: C1 })));
        assert!(rpcs.contains(&(C2, ServerToClient::P2PGroupMemberLeave { group: g2, member: C2 })));
    }

    fn direct_addrs() -> DirectAddrs {
        DirectAddrs {
            a_send_to_b: addr("203.0.113.2:40001"),
            a_recv_from_b: addr("203.0.113.2:40001"),
            b_send_to_a: addr("203.0.113.1:40001"),
            b_recv_from_a: addr("203.0.113.1:40001"),
        }
    }

    #[test]
    fn test_holepunch_success_is_deduplicated() {
        let mut f = Fixture::new(2);
        f.server.create_p2p_group(f.now, &[C1, C2], Bytes::new()).unwrap();
        f.rpcs();

        f.server.on_rpc(f.now, C1, ClientToServer::NotifyP2PHolepunchSuccess { a: C1, b: C2, addrs: direct_addrs() });
        assert_eq!(f.rpcs(), vec![
            (C1, ServerToClient::NotifyDirectP2PEstablish { a: C1, b: C2, addrs: direct_addrs() }),
            (C2, ServerToClient::NotifyDirectP2PEstablish { a: C2, b: C1, addrs: direct_addrs().swapped() }),
            (C2, ServerToClient::SuppressP2PHolepunchTrial { peer: C1 }),
        ]);
        assert!(f.server.pairs().get(C1, C2).unwrap().is_direct());

        f.server.on_rpc(f.now, C2, ClientToServer::NotifyP2PHolepunchSuccess { a: C2, b: C1, addrs: direct_addrs().swapped() });
        assert_eq!(f.rpcs(), vec![(C2, ServerToClient::SuppressP2PHolepunchTrial { peer: C1 })]);
    }

    #[test]
    fn test_holepunch_success_on_behalf_of_others_is_ignored() {
        let mut f = Fixture::new(3);
        f.server.create_p2p_group(f.now, &[C1, C2], Bytes::new()).unwrap();
        f.rpcs();
        f.server.drain_events();
        f.server.on_rpc(f.now, C3, ClientToServer::NotifyP2PHolepunchSuccess { a: C1, b: C2, addrs: direct_addrs() });
        assert!(f.rpcs().is_empty());
        assert!(!f.server.pairs().get(C1, C2).unwrap().is_direct());
        assert_eq!(f.server.drain_events(), vec![NetEvent::Warning {
            message: format!("{:?} reported hole punch success on behalf of {:?}", C3, C1),
        }]);
    }

    #[rstest::rstest]
    #[case::notify_opposite(true)]
    #[case::keep_opposite(false)]
    fn test_direct_disconnect_forwarded_once(#[case] notify_opposite: bool) {
        let mut f = Fixture::new(2);
        let mut config = NetConfig::new();
        config.notify_opposite_on_p2p_fallback = notify_opposite;
        f.server.config = Arc::new(config);
        f.server.create_p2p_group(f.now, &[C1, C2], Bytes::new()).unwrap();
        f.server.on_rpc(f.now, C1, ClientToServer::NotifyP2PHolepunchSuccess { a: C1, b: C2, addrs: direct_addrs() });
        f.rpcs();

        f.server.on_rpc(f.now, C1, ClientToServer::NotifyDirectP2PDisconnected { peer: C2, reason: FallbackReason::P2PUdpTimeout });
        f.server.on_rpc(f.now, C2, ClientToServer::NotifyDirectP2PDisconnected { peer: C1, reason: FallbackReason::RequestedByPeer });

        let expected = if notify_opposite {
            vec![(C2, ServerToClient::NotifyDirectP2PDisconnected { peer: C1, reason: FallbackReason::P2PUdpTimeout })]
        }
        else {
            vec![]
        };
        assert_eq!(f.rpcs(), expected);
        assert!(!f.server.pairs().get(C1, C2).unwrap().is_direct());
    }

    #[test]
    fn test_jit_trigger_notifies_both_once() {
        let mut f = Fixture::new(2);
        f.server.create_p2p_group(f.now, &[C1, C2], Bytes::new()).unwrap();
        f.rpcs();

        f.server.on_rpc(f.now, C1, ClientToServer::NotifyJitDirectP2PTriggered { peer: C2 });
        f.server.on_rpc(f.now, C2, ClientToServer::NotifyJitDirectP2PTriggered { peer: C1 });
        assert_eq!(f.rpcs(), vec![
            (C1, ServerToClient::NewDirectP2PConnection { peer: C2 }),
            (C2, ServerToClient::NewDirectP2PConnection { peer: C1 }),
        ]);
    }

    #[test]
    fn test_reliable_relay_requires_shared_group() {
        let mut f = Fixture::new(3);
        f.server.create_p2p_group(f.now, &[C1, C2, HostId::SERVER], Bytes::new()).unwrap();
        f.rpcs();

        let payload = PeerMessage::User(Bytes::from_static(b"x")).to_bytes();
        f.server.on_rpc(f.now, C1, ClientToServer::ReliableRelay { dests: vec![(C2, 17), (C3, 5), (HostId::SERVER, 0)], payload: payload.clone() });

        assert_eq!(f.rpcs(), vec![(C2, ServerToClient::ReliableRelayed { from: C1, frame_number: 17, payload })]);
        assert_eq!(f.server.take_inbox(), vec![ReceivedMessage { from: C1, payload: Bytes::from_static(b"x"), reliable: true }]);
    }

    #[test]
    fn test_unreliable_relay_expands_groups() {
        let mut f = Fixture::new(3);
        let group = f.server.create_p2p_group(f.now, &[C1, C2, C3], Bytes::new()).unwrap();
        f.rpcs();

        let payload = PeerMessage::User(Bytes::from_static(b"x")).to_bytes();
        let relay_list = RelayList {
            groups: vec![crate::messaging::relay::GroupRelay { group, excluded: vec![C3] }],
            peers: vec![],
        };
        f.server.on_rpc(f.now, C1, ClientToServer::UnreliableRelay { relay_list, payload: payload.clone() });
        // no client has UDP enabled, so everything goes over TCP
        assert_eq!(f.rpcs(), vec![(C2, ServerToClient::UnreliableRelayed { from: C1, payload })]);
    }

    #[test]
    fn test_disconnect_cleans_up() {
        let mut f = Fixture::new(2);
        let group = f.server.create_p2p_group(f.now, &[C1, C2], Bytes::new()).unwrap();
        f.server.drain_events();
        f.rpcs();

        f.server.on_client_disconnected(f.now, C2);
        assert!(f.server.pairs().is_empty());
        assert!(!f.server.join_acks().is_waiting(group, C2));
        assert_eq!(f.server.groups().member_ids(group), Some([C1].as_slice()));
        assert!(f.rpcs().contains(&(C1, ServerToClient::P2PGroupMemberLeave { group, member: C2 })));
        let events = f.server.drain_events();
        assert_eq!(events.last(), Some(&NetEvent::ClientLeft { host_id: C2 }));
    }

    #[test]
    fn test_request_create_udp_socket() {
        let mut f = Fixture::new(1);
        f.server.on_rpc(f.now, C1, ClientToServer::RequestCreateUdpSocket);
        let tag = f.server.client(C1).unwrap().udp_tag();
        assert_eq!(f.rpcs(), vec![(C1, ServerToClient::RequestCreateUdpSocket { server_udp_addr: addr("10.0.0.1:7000"), holepunch_tag: tag })]);

        f.server.on_rpc(f.now, C1, ClientToServer::CreateUdpSocketAck { ok: true });
        assert_eq!(f.rpcs(), vec![(C1, ServerToClient::CreateUdpSocketAck { ok: true })]);
    }

    #[test]
    fn test_server_udp_timeout() {
        let mut f = Fixture::new(1);
        f.server.on_rpc(f.now, C1, ClientToServer::NotifyServerHolepunchSuccess { internal_addr: addr("192.168.1.2:50000"), external_addr: addr("203.0.113.1:40000") });
        assert_eq!(f.server.client(C1).unwrap().udp_addr(), Some(addr("203.0.113.1:40000")));

        f.server.tick(f.now + Duration::from_secs(21));
        assert_eq!(f.server.client(C1).unwrap().udp_addr(), None);
    }

    fn udp_fixture() -> (Fixture, Uuid) {
        let mut f = Fixture::new(2);
        f.server.create_p2p_group(f.now, &[C1, C2], Bytes::new()).unwrap();
        f.server.on_rpc(f.now, C1, ClientToServer::RequestCreateUdpSocket);
        f.server.on_rpc(f.now, C1, ClientToServer::NotifyServerHolepunchSuccess { internal_addr: addr("192.168.1.2:50000"), external_addr: addr("203.0.113.1:40000") });
        f.rpcs();
        let tag = f.server.client(C1).unwrap().udp_tag();
        (f, tag)
    }

    #[rstest::rstest]
    #[case::ping_with_client_tag(true, false)]
    #[case::ping_with_foreign_tag(false, false)]
    #[case::holepunch_with_client_tag(true, true)]
    #[case::holepunch_with_foreign_tag(false, true)]
    fn test_new_source_address_requires_client_tag(#[case] client_tag: bool, #[case] holepunch: bool) {
        let (mut f, tag) = udp_fixture();
        let tag = if client_tag { tag } else { Uuid::new_v4() };
        let src = addr("198.51.100.9:4444");
        let datagram = if holepunch {
            Datagram::ServerHolepunch { tag, from: C1, target: HostId::SERVER, internal_addr: addr("192.168.1.2:50000") }
        }
        else {
            Datagram::ServerPing { tag, from: C1, sent_at_micros: 1 }
        };

        f.server.on_datagram(f.now, InboundDatagram { local_port: 7000, from: src, data: datagram.to_bytes() });

        let renewals = f.rpcs().into_iter()
            .filter(|(_, rpc)| matches!(rpc, ServerToClient::RenewP2PConnectionState { .. }))
            .count();
        if client_tag {
            assert_eq!(f.server.client(C1).unwrap().external_addr(), Some(src));
            assert_eq!(renewals, 2);
        }
        else {
            assert_eq!(f.server.client(C1).unwrap().external_addr(), Some(addr("203.0.113.1:40000")));
            assert_eq!(renewals, 0);
        }
    }

    #[test]
    fn test_relay_datagram_from_foreign_address_is_dropped() {
        let (mut f, _) = udp_fixture();
        let payload = PeerMessage::User(Bytes::from_static(b"x")).to_bytes();
        let datagram = Datagram::UnreliableRelay { from: C1, relay_list: RelayList { groups: vec![], peers: vec![C2] }, payload };

        f.server.on_datagram(f.now, InboundDatagram { local_port: 7000, from: addr("198.51.100.9:4444"), data: datagram.to_bytes() });
        assert!(f.rpcs().is_empty());
    }
}
