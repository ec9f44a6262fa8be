use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashSet;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::config::NetConfig;
use crate::error::NetError;
use crate::host_id::HostId;
use crate::messaging::reliable::{ReliableReceiver, ReliableSender};
use crate::messaging::rpc::MemberJoinInfo;
use crate::peer::holepunch::HolepunchAttempt;
use crate::peer::{GroupMember, PingSource, Route, SendTarget};
use crate::transport::fallbackable::{Cooltime, FallbackableTransport, SendOptions, SendPath};
use crate::transport::socket_pool::{PooledSocket, SocketPool};
use crate::util::addr::is_unicast_endpoint;
use crate::util::rolling_stats::RollingStats;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum P2PMode {
    Relayed,
    Direct,
}

/// Another client as seen from a client. Direct vs. relayed mode is the peer transport's
///  'real UDP' flag, so the two modes are exclusive by construction.
pub struct RemotePeer {
    host_id: HostId,
    holepunch_tag: Uuid,
    session_key: Bytes,
    direct_p2p_allowed: bool,
    fixed_bind_port: Option<u16>,

    transport: FallbackableTransport,
    udp_socket: Option<PooledSocket>,

    /// the peer as observed by the server
    external_addr: Option<SocketAddr>,
    /// the peer's own view of its local address
    internal_addr: Option<SocketAddr>,
    p2p_send_addr: Option<SocketAddr>,
    p2p_recv_addr: Option<SocketAddr>,

    recent_ping: Option<Duration>,
    last_ping: Option<Duration>,
    peer_to_server_ping: Option<Duration>,
    jitter: RollingStats<16>,
    /// the next ping sample replaces `recent_ping` instead of being smoothed into it, so that a
    ///  relayed-mode value does not linger after switching to direct
    relayed_ping_needs_reset: bool,
    /// the peer's estimate of server time minus ours, in microseconds
    indirect_server_time_diff: Option<i64>,

    encrypt_count: u64,
    decrypt_count: u64,

    joined_groups: FxHashSet<HostId>,
    garbaged: bool,
    leave_event_count: u32,

    holepunch: Option<HolepunchAttempt>,
    jit_requested: bool,
    /// the current loss of the direct link was reported to the server
    fallback_reported: bool,

    sender: ReliableSender,
    receiver: ReliableReceiver,
    ping_countdown: Duration,
}

impl RemotePeer {
    /// Peers always start relayed: direct connectivity is only ever the result of a successful
    ///  hole punch.
    pub fn new(info: &MemberJoinInfo) -> RemotePeer {
        RemotePeer {
            host_id: info.member,
            holepunch_tag: info.holepunch_tag,
            session_key: info.session_key.clone(),
            direct_p2p_allowed: info.direct_p2p_enabled,
            fixed_bind_port: info.fixed_bind_port,
            transport: FallbackableTransport::new(),
            udp_socket: None,
            external_addr: None,
            internal_addr: None,
            p2p_send_addr: None,
            p2p_recv_addr: None,
            recent_ping: None,
            last_ping: None,
            peer_to_server_ping: None,
            jitter: RollingStats::new(),
            relayed_ping_needs_reset: false,
            indirect_server_time_diff: None,
            encrypt_count: 0,
            decrypt_count: 0,
            joined_groups: FxHashSet::default(),
            garbaged: false,
            leave_event_count: 0,
            holepunch: None,
            jit_requested: false,
            fallback_reported: false,
            sender: ReliableSender::new(info.first_frame_to_member),
            receiver: ReliableReceiver::new(info.first_frame_from_member),
            ping_countdown: Duration::ZERO,
        }
    }

    /// Brings a garbaged peer back to life in place, with fresh session state. Undelivered leave
    ///  events stay counted.
    pub fn reinit(&mut self, info: &MemberJoinInfo, pool: &mut SocketPool, now: Instant) {
        debug!("reinitializing garbaged peer {:?}", self.host_id);
        if let Some(socket) = self.udp_socket.take() {
            pool.release(socket, now);
        }
        let leave_event_count = self.leave_event_count;
        *self = RemotePeer::new(info);
        self.leave_event_count = leave_event_count;
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn holepunch_tag(&self) -> Uuid {
        self.holepunch_tag
    }

    pub fn set_holepunch_tag(&mut self, tag: Uuid) {
        self.holepunch_tag = tag;
    }

    pub fn session_key(&self) -> &Bytes {
        &self.session_key
    }

    pub fn direct_p2p_allowed(&self) -> bool {
        self.direct_p2p_allowed
    }

    pub fn set_direct_p2p_allowed(&mut self, allowed: bool) {
        self.direct_p2p_allowed = allowed;
    }

    pub fn fixed_bind_port(&self) -> Option<u16> {
        self.fixed_bind_port
    }

    pub fn mode(&self) -> P2PMode {
        if self.transport.real_udp_enabled() {
            P2PMode::Direct
        }
        else {
            P2PMode::Relayed
        }
    }

    pub fn is_direct(&self) -> bool {
        self.mode() == P2PMode::Direct
    }

    pub fn is_relayed(&self) -> bool {
        self.mode() == P2PMode::Relayed
    }

    /// Switches to direct mode. Both hole-punched addresses must be unicast endpoints, and the
    ///  peer must own the socket the hole was punched from.
    pub fn set_direct(&mut self, send_addr: SocketAddr, recv_addr: SocketAddr, now: Instant) -> Result<(), NetError> {
        for addr in [send_addr, recv_addr] {
            if !is_unicast_endpoint(&addr) {
                return Err(NetError::NotUnicast(addr));
            }
        }
        let socket = self.udp_socket.as_mut()
            .ok_or(NetError::NoUdpSocket(self.host_id))?;

        socket.confirmed_direct = true;
        self.p2p_send_addr = Some(send_addr);
        self.p2p_recv_addr = Some(recv_addr);
        self.transport.set_remote_addr(Some(send_addr));
        self.transport.set_real_udp_enabled(true, now);
        self.relayed_ping_needs_reset = true;
        self.fallback_reported = false;
        self.holepunch = None;

        info!("direct P2P to {:?} established: sending to {:?}, receiving from {:?}", self.host_id, send_addr, recv_addr);
        Ok(())
    }

    /// Switches to relayed mode, handing the UDP socket to the pool. Returns the reliable frames
    ///  that were sent directly but not acknowledged: the caller must re-send them through the
    ///  relay before sending anything else to this peer.
    #[must_use]
    pub fn set_relayed(&mut self, pool: &mut SocketPool, now: Instant) -> Vec<(u32, Bytes)> {
        if self.is_direct() {
            info!("P2P to {:?} is relayed now", self.host_id);
        }
        self.transport.set_real_udp_enabled(false, now);
        self.transport.set_remote_addr(None);
        self.p2p_send_addr = None;
        self.p2p_recv_addr = None;
        self.holepunch = None;
        if let Some(socket) = self.udp_socket.take() {
            pool.release(socket, now);
        }
        self.sender.take_unacked()
    }

    pub fn p2p_send_addr(&self) -> Option<SocketAddr> {
        self.p2p_send_addr
    }

    pub fn p2p_recv_addr(&self) -> Option<SocketAddr> {
        self.p2p_recv_addr
    }

    pub fn external_addr(&self) -> Option<SocketAddr> {
        self.external_addr
    }

    pub fn internal_addr(&self) -> Option<SocketAddr> {
        self.internal_addr
    }

    pub fn set_observed_addrs(&mut self, internal_addr: SocketAddr, external_addr: SocketAddr) {
        self.internal_addr = Some(internal_addr);
        self.external_addr = Some(external_addr);
    }

    pub fn udp_socket(&self) -> Option<&PooledSocket> {
        self.udp_socket.as_ref()
    }

    pub fn udp_port(&self) -> Option<u16> {
        self.udp_socket.as_ref().map(|s| s.local_port())
    }

    pub fn attach_socket(&mut self, socket: PooledSocket, pool: &mut SocketPool, now: Instant) {
        if let Some(prev) = self.udp_socket.replace(socket) {
            pool.release(prev, now);
        }
    }

    // ----- direct link health

    pub fn log_direct_packet_received(&mut self, now: Instant) {
        self.transport.log_packet_received(now);
    }

    pub fn is_direct_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.transport.is_udp_timed_out(now, timeout)
    }

    pub fn last_direct_packet_time(&self) -> Option<Instant> {
        self.transport.last_packet_recv_time()
    }

    pub fn direct_recv_interval(&self) -> Option<Duration> {
        self.transport.recv_interval()
    }

    pub fn holepunch_cooltime(&self) -> Cooltime {
        self.transport.holepunch_cooltime()
    }

    /// counts the loss of a direct link against the retry budget
    pub fn record_fallback(&mut self, now: Instant, config: &NetConfig) {
        self.transport.record_fallback(now, config.max_holepunch_attempt_count, config.holepunch_retry_cooltime);
    }

    pub fn record_failed_attempt(&mut self, now: Instant, config: &NetConfig) {
        self.transport.record_failed_attempt(now, config.max_holepunch_attempt_count, config.holepunch_retry_cooltime);
    }

    pub fn reset_attempts(&mut self) {
        self.transport.reset_attempts();
    }

    pub fn tcp_fallback_count(&self) -> u32 {
        self.transport.tcp_fallback_count()
    }

    pub fn holepunch_attempt_count(&self) -> u32 {
        self.transport.holepunch_attempt_count()
    }

    // ----- hole punching

    pub fn holepunch(&self) -> Option<&HolepunchAttempt> {
        self.holepunch.as_ref()
    }

    pub fn holepunch_mut(&mut self) -> Option<&mut HolepunchAttempt> {
        self.holepunch.as_mut()
    }

    /// A new attempt is only possible with a socket to punch from. An attempt in progress is
    ///  replaced.
    pub fn start_holepunch(&mut self, now: Instant) -> Result<(), NetError> {
        if self.udp_socket.is_none() {
            return Err(NetError::NoUdpSocket(self.host_id));
        }
        debug!("starting hole punch attempt to {:?}", self.host_id);
        self.holepunch = Some(HolepunchAttempt::new(self.holepunch_tag, now));
        Ok(())
    }

    pub fn cancel_holepunch(&mut self) -> Option<HolepunchAttempt> {
        self.holepunch.take()
    }

    /// Moves the attempt to the peer phase once both preconditions hold: the server confirmed
    ///  this host's mapping, and the peer's addresses are known.
    pub fn try_enter_peer_phase(&mut self, config: &NetConfig) -> bool {
        let (Some(attempt), Some(external)) = (self.holepunch.as_mut(), self.external_addr) else {
            return false;
        };
        if !attempt.server_acked() {
            return false;
        }
        attempt.enter_peer_phase(external, self.internal_addr, config);
        true
    }

    pub fn jit_requested(&self) -> bool {
        self.jit_requested
    }

    pub fn set_jit_requested(&mut self, requested: bool) {
        self.jit_requested = requested;
    }

    pub fn fallback_reported(&self) -> bool {
        self.fallback_reported
    }

    pub fn set_fallback_reported(&mut self) {
        self.fallback_reported = true;
    }

    // ----- nonces

    pub fn next_nonce(&mut self) -> u64 {
        self.encrypt_count += 1;
        self.encrypt_count
    }

    /// Nonces must increase strictly; anything else is a replay or a regression.
    pub fn accept_nonce(&mut self, nonce: u64) -> bool {
        if nonce <= self.decrypt_count {
            return false;
        }
        self.decrypt_count = nonce;
        true
    }

    pub fn encrypt_count(&self) -> u64 {
        self.encrypt_count
    }

    pub fn decrypt_count(&self) -> u64 {
        self.decrypt_count
    }

    // ----- reliable stream

    pub fn reliable_sender(&mut self) -> &mut ReliableSender {
        &mut self.sender
    }

    pub fn reliable_receiver(&mut self) -> &mut ReliableReceiver {
        &mut self.receiver
    }

    // ----- timing

    pub fn on_ping_sample(&mut self, rtt: Duration, new_weight: f64) {
        self.last_ping = Some(rtt);
        self.recent_ping = match self.recent_ping {
            Some(prev) if !self.relayed_ping_needs_reset => {
                Some(prev.mul_f64(1.0 - new_weight) + rtt.mul_f64(new_weight))
            }
            _ => Some(rtt),
        };
        self.relayed_ping_needs_reset = false;
        self.jitter.add(rtt);
        trace!("ping to {:?}: {:?} (smoothed {:?})", self.host_id, rtt, self.recent_ping);
    }

    pub fn relayed_ping_needs_reset(&self) -> bool {
        self.relayed_ping_needs_reset
    }

    pub fn peer_to_server_ping(&self) -> Option<Duration> {
        self.peer_to_server_ping
    }

    pub fn set_peer_to_server_ping(&mut self, ping: Option<Duration>) {
        self.peer_to_server_ping = ping;
    }

    /// end-to-end latency of the relay path, if both legs are known
    pub fn relay_ping(&self, server_ping: Option<Duration>) -> Option<Duration> {
        Some(server_ping? + self.peer_to_server_ping?)
    }

    pub fn indirect_server_time_diff(&self) -> Option<i64> {
        self.indirect_server_time_diff
    }

    pub fn set_indirect_server_time_diff(&mut self, diff_micros: i64) {
        self.indirect_server_time_diff = Some(diff_micros);
    }

    /// returns `true` when a ping is due
    pub fn ping_due(&mut self, elapsed: Duration, interval: Duration) -> bool {
        match self.ping_countdown.checked_sub(elapsed) {
            Some(remaining) if !remaining.is_zero() => {
                self.ping_countdown = remaining;
                false
            }
            _ => {
                self.ping_countdown = interval;
                true
            }
        }
    }

    // ----- lifecycle

    pub fn is_garbaged(&self) -> bool {
        self.garbaged
    }

    /// soft delete: the record stays until pending leave events are delivered
    pub fn mark_garbaged(&mut self, pool: &mut SocketPool, now: Instant) {
        let _ = self.set_relayed(pool, now);
        self.garbaged = true;
        self.jit_requested = false;
    }

    pub fn leave_event_count(&self) -> u32 {
        self.leave_event_count
    }

    pub fn inc_leave_event_count(&mut self) {
        self.leave_event_count += 1;
    }

    pub fn dec_leave_event_count(&mut self) {
        self.leave_event_count = self.leave_event_count.saturating_sub(1);
    }

    /// a garbaged peer without undelivered leave events can be removed for good
    pub fn can_be_removed(&self) -> bool {
        self.garbaged && self.leave_event_count == 0
    }
}

impl SendTarget for RemotePeer {
    fn target_id(&self) -> HostId {
        self.host_id
    }

    fn route(&mut self, options: SendOptions) -> Route {
        let local_port = self.udp_port();
        match (self.transport.select_path(local_port.is_some(), options), local_port) {
            (SendPath::Udp(to), Some(local_port)) => Route::Direct { local_port, to },
            _ => Route::Relay,
        }
    }
}

impl GroupMember for RemotePeer {
    fn joined_groups(&self) -> &FxHashSet<HostId> {
        &self.joined_groups
    }

    fn add_group(&mut self, group: HostId) -> bool {
        self.joined_groups.insert(group)
    }

    fn remove_group(&mut self, group: HostId) -> bool {
        self.joined_groups.remove(&group);
        self.joined_groups.is_empty()
    }
}

impl PingSource for RemotePeer {
    fn recent_ping(&self) -> Option<Duration> {
        self.recent_ping
    }

    fn last_ping(&self) -> Option<Duration> {
        self.last_ping
    }

    fn jitter(&self) -> Duration {
        self.jitter.std_dev()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rstest::rstest;

    use super::*;

    fn addr(s: &str) -> SocketAddr {
        SocketAddr::from_str(s).unwrap()
    }

    fn join_info() -> MemberJoinInfo {
        MemberJoinInfo {
            group: HostId(50),
            member: HostId(7),
            custom: Bytes::new(),
            session_key: Bytes::from_static(b"key"),
            first_frame_to_member: 100,
            first_frame_from_member: 200,
            holepunch_tag: Uuid::new_v4(),
            direct_p2p_enabled: true,
            fixed_bind_port: None,
            event_id: 1,
        }
    }

    fn peer_with_socket(pool: &mut SocketPool, now: Instant) -> RemotePeer {
        let mut peer = RemotePeer::new(&join_info());
        peer.attach_socket(PooledSocket::new(addr("192.168.0.2:4000"), HostId(7)), pool, now);
        peer
    }

    #[test]
    fn test_new_peer_is_relayed() {
        let peer = RemotePeer::new(&join_info());
        assert_eq!(peer.mode(), P2PMode::Relayed);
        assert!(peer.holepunch().is_none());
        assert_eq!(peer.recent_ping(), None);
    }

    #[rstest]
    #[case::zero_port("1.2.3.4:0", "1.2.3.4:5")]
    #[case::unspecified("1.2.3.4:5", "0.0.0.0:5")]
    #[case::broadcast("255.255.255.255:5", "1.2.3.4:5")]
    #[case::multicast("1.2.3.4:5", "224.0.0.1:5")]
    fn test_set_direct_requires_unicast(#[case] send: &str, #[case] recv: &str) {
        let now = Instant::now();
        let mut pool = SocketPool::new();
        let mut peer = peer_with_socket(&mut pool, now);

        assert!(matches!(peer.set_direct(addr(send), addr(recv), now), Err(NetError::NotUnicast(_))));
        assert!(peer.is_relayed());
    }

    #[test]
    fn test_set_direct_requires_socket() {
        let mut peer = RemotePeer::new(&join_info());
        assert_eq!(peer.set_direct(addr("1.2.3.4:5"), addr("1.2.3.4:5"), Instant::now()), Err(NetError::NoUdpSocket(HostId(7))));
    }

    #[test]
    fn test_direct_relayed_round_trip() {
        let now = Instant::now();
        let mut pool = SocketPool::new();
        let mut peer = peer_with_socket(&mut pool, now);
        peer.start_holepunch(now).unwrap();

        peer.set_direct(addr("203.0.113.7:5000"), addr("203.0.113.7:5001"), now).unwrap();
        assert!(peer.is_direct());
        assert!(peer.holepunch().is_none());
        assert!(peer.relayed_ping_needs_reset());
        assert_eq!(peer.route(SendOptions::default()), Route::Direct { local_port: 4000, to: addr("203.0.113.7:5000") });

        peer.reliable_sender().push_direct(Bytes::from_static(b"a"), now);
        let unacked = peer.set_relayed(&mut pool, now);
        assert_eq!(unacked, vec![(100, Bytes::from_static(b"a"))]);
        assert!(peer.is_relayed());
        assert_eq!(peer.udp_port(), None);
        assert!(pool.is_recycled(4000));
        assert_eq!(peer.route(SendOptions::default()), Route::Relay);
    }

    #[test]
    fn test_unconfirmed_socket_is_discarded() {
        let now = Instant::now();
        let mut pool = SocketPool::new();
        let mut peer = peer_with_socket(&mut pool, now);
        let _ = peer.set_relayed(&mut pool, now);
        assert!(pool.is_garbage(4000));
    }

    #[test]
    fn test_ping_reset_after_direct() {
        let now = Instant::now();
        let mut pool = SocketPool::new();
        let mut peer = peer_with_socket(&mut pool, now);

        peer.on_ping_sample(Duration::from_millis(100), 0.5);
        peer.on_ping_sample(Duration::from_millis(200), 0.5);
        assert_eq!(peer.recent_ping(), Some(Duration::from_millis(150)));

        peer.set_direct(addr("203.0.113.7:5000"), addr("203.0.113.7:5000"), now).unwrap();
        peer.on_ping_sample(Duration::from_millis(20), 0.5);
        assert_eq!(peer.recent_ping(), Some(Duration::from_millis(20)));
        peer.on_ping_sample(Duration::from_millis(40), 0.5);
        assert_eq!(peer.recent_ping(), Some(Duration::from_millis(30)));
        assert_eq!(peer.last_ping(), Some(Duration::from_millis(40)));
    }

    #[rstest]
    #[case::first(vec![], 1, true)]
    #[case::increasing(vec![1, 2], 5, true)]
    #[case::replay(vec![1, 2], 2, false)]
    #[case::regress(vec![5], 3, false)]
    fn test_accept_nonce(#[case] previous: Vec<u64>, #[case] nonce: u64, #[case] expected: bool) {
        let mut peer = RemotePeer::new(&join_info());
        for n in previous {
            assert!(peer.accept_nonce(n));
        }
        assert_eq!(peer.accept_nonce(nonce), expected);
    }

    #[test]
    fn test_next_nonce_increases() {
        let mut peer = RemotePeer::new(&join_info());
        assert_eq!(peer.next_nonce(), 1);
        assert_eq!(peer.next_nonce(), 2);
        assert_eq!(peer.encrypt_count(), 2);
    }

    #[test]
    fn test_peer_phase_needs_server_ack_and_addrs() {
        let now = Instant::now();
        let config = NetConfig::new();
        let mut pool = SocketPool::new();
        let mut peer = peer_with_socket(&mut pool, now);
        peer.start_holepunch(now).unwrap();

        assert!(!peer.try_enter_peer_phase(&config));
        peer.set_observed_addrs(addr("192.168.7.2:4000"), addr("203.0.113.7:40001"));
        assert!(!peer.try_enter_peer_phase(&config));

        let tag = peer.holepunch_tag();
        assert!(peer.holepunch_mut().unwrap().on_server_ack(&tag));
        assert!(peer.try_enter_peer_phase(&config));
        assert!(peer.holepunch().unwrap().is_peer_phase());
    }

    #[test]
    fn test_groups_and_garbage() {
        let now = Instant::now();
        let mut pool = SocketPool::new();
        let mut peer = peer_with_socket(&mut pool, now);

        assert!(peer.add_group(HostId(50)));
        assert!(peer.add_group(HostId(51)));
        assert!(!peer.add_group(HostId(51)));
        assert!(!peer.remove_group(HostId(50)));
        assert!(peer.remove_group(HostId(51)));

        peer.mark_garbaged(&mut pool, now);
        peer.inc_leave_event_count();
        assert!(!peer.can_be_removed());
        peer.dec_leave_event_count();
        assert!(peer.can_be_removed());
    }

    #[test]
    fn test_reinit_keeps_pending_leave_events() {
        let now = Instant::now();
        let mut pool = SocketPool::new();
        let mut peer = peer_with_socket(&mut pool, now);
        peer.next_nonce();
        peer.mark_garbaged(&mut pool, now);
        peer.inc_leave_event_count();

        let mut info = join_info();
        info.first_frame_to_member = 500;
        peer.reinit(&info, &mut pool, now);

        assert!(!peer.is_garbaged());
        assert!(peer.is_relayed());
        assert_eq!(peer.leave_event_count(), 1);
        assert_eq!(peer.encrypt_count(), 0);
        assert_eq!(peer.reliable_sender().next_frame_number(), 500);
    }

    #[test]
    fn test_record_fallback_counts() {
        let now = Instant::now();
        let config = NetConfig::new();
        let mut peer = RemotePeer::new(&join_info());
        peer.record_fallback(now, &config);
        assert_eq!(peer.tcp_fallback_count(), 1);
        assert!(peer.is_relayed());
        assert_eq!(peer.holepunch_cooltime(), Cooltime::Until(now + config.holepunch_retry_cooltime));
    }
}
