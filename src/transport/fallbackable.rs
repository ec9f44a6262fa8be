use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

/// When the next automatic (re-)attempt to establish UDP connectivity is allowed
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Cooltime {
    Ready,
    Until(Instant),
    /// the link gave up on UDP, only an explicit renewal resets this
    Never,
}
impl Cooltime {
    pub fn is_ready(&self, now: Instant) -> bool {
        match self {
            Cooltime::Ready => true,
            Cooltime::Until(t) => now >= *t,
            Cooltime::Never => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendPath {
    Udp(SocketAddr),
    Tcp,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct SendOptions {
    /// engine-internal traffic (probes, pings) is not counted as a UDP send attempt
    pub engine_only: bool,
}

/// UDP-or-TCP path selection and health tracking for one destination (the server, or one peer
///  where 'TCP' means the server relay).
#[derive(Debug)]
pub struct FallbackableTransport {
    real_udp_enabled: bool,
    remote_addr: Option<SocketAddr>,
    udp_enabled_since: Option<Instant>,
    last_packet_recv_time: Option<Instant>,
    recv_interval: Option<Duration>,
    recv_count: u64,
    udp_attempt_count: u64,

    holepunch_cooltime: Cooltime,
    holepunch_attempt_count: u32,
    tcp_fallback_count: u32,
}

impl FallbackableTransport {
    pub fn new() -> FallbackableTransport {
        FallbackableTransport {
            real_udp_enabled: false,
            remote_addr: None,
            udp_enabled_since: None,
            last_packet_recv_time: None,
            recv_interval: None,
            recv_count: 0,
            udp_attempt_count: 0,
            holepunch_cooltime: Cooltime::Ready,
            holepunch_attempt_count: 0,
            tcp_fallback_count: 0,
        }
    }

    pub fn real_udp_enabled(&self) -> bool {
        self.real_udp_enabled
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn set_remote_addr(&mut self, addr: Option<SocketAddr>) {
        self.remote_addr = addr;
    }

    pub fn udp_enabled_since(&self) -> Option<Instant> {
        self.udp_enabled_since
    }

    pub fn last_packet_recv_time(&self) -> Option<Instant> {
        self.last_packet_recv_time
    }

    pub fn recv_interval(&self) -> Option<Duration> {
        self.recv_interval
    }

    pub fn recv_count(&self) -> u64 {
        self.recv_count
    }

    pub fn udp_attempt_count(&self) -> u64 {
        self.udp_attempt_count
    }

    pub fn holepunch_cooltime(&self) -> Cooltime {
        self.holepunch_cooltime
    }

    pub fn holepunch_attempt_count(&self) -> u32 {
        self.holepunch_attempt_count
    }

    pub fn tcp_fallback_count(&self) -> u32 {
        self.tcp_fallback_count
    }

    /// The path for a send. UDP is only used if real UDP is believed to work, the local socket
    ///  is open, and the remote address is known.
    pub fn select_path(&mut self, udp_socket_open: bool, options: SendOptions) -> SendPath {
        match (self.real_udp_enabled && udp_socket_open, self.remote_addr) {
            (true, Some(addr)) => {
                if !options.engine_only {
                    self.udp_attempt_count += 1;
                }
                SendPath::Udp(addr)
            }
            _ => SendPath::Tcp,
        }
    }

    /// Redundant calls are no-ops. Any actual change restarts receive bookkeeping, so timeout
    ///  detection starts from a clean slate.
    pub fn set_real_udp_enabled(&mut self, enabled: bool, now: Instant) {
        if self.real_udp_enabled == enabled {
            return;
        }
        debug!("real UDP {} for {:?}", if enabled { "enabled" } else { "disabled" }, self.remote_addr);

        self.real_udp_enabled = enabled;
        self.udp_enabled_since = if enabled { Some(now) } else { None };
        self.last_packet_recv_time = None;
        self.recv_interval = None;
    }

    pub fn log_packet_received(&mut self, now: Instant) {
        if let Some(prev) = self.last_packet_recv_time {
            // tolerate clock anomalies: only positive deltas are meaningful
            if now > prev {
                self.recv_interval = Some(now - prev);
            }
        }
        self.last_packet_recv_time = Some(now);
        self.recv_count += 1;
    }

    /// true if real UDP is enabled but nothing was received for longer than `timeout`. The
    ///  reference point is the last received packet, or the moment UDP was enabled.
    pub fn is_udp_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        if !self.real_udp_enabled {
            return false;
        }
        match self.last_packet_recv_time.or(self.udp_enabled_since) {
            Some(t) => now.saturating_duration_since(t) > timeout,
            None => false,
        }
    }

    /// One-way transition to TCP after a detected failure. Returns `false` if UDP was disabled
    ///  already. Re-attempts are bounded: once `max_count` fallbacks happened, the cooltime
    ///  becomes [Cooltime::Never].
    pub fn fall_back_to_tcp(&mut self, now: Instant, max_count: u32, cooltime: Duration) -> bool {
        if !self.real_udp_enabled {
            return false;
        }
        self.set_real_udp_enabled(false, now);
        self.record_fallback(now, max_count, cooltime);
        true
    }

    /// counts a fallback against the retry budget, for links whose UDP path was torn down
    ///  by other means
    pub fn record_fallback(&mut self, now: Instant, max_count: u32, cooltime: Duration) {
        self.tcp_fallback_count += 1;
        self.holepunch_cooltime = self.next_cooltime(now, self.tcp_fallback_count, max_count, cooltime);
        info!("UDP link to {:?} fell back ({} times), next attempt: {:?}", self.remote_addr, self.tcp_fallback_count, self.holepunch_cooltime);
    }

    /// an attempt to establish UDP connectivity was abandoned
    pub fn record_failed_attempt(&mut self, now: Instant, max_count: u32, cooltime: Duration) {
        self.holepunch_attempt_count += 1;
        self.holepunch_cooltime = self.next_cooltime(now, self.holepunch_attempt_count, max_count, cooltime);
        debug!("UDP attempt to {:?} failed ({} times), next attempt: {:?}", self.remote_addr, self.holepunch_attempt_count, self.holepunch_cooltime);
    }

    fn next_cooltime(&self, now: Instant, count: u32, max_count: u32, cooltime: Duration) -> Cooltime {
        if count >= max_count || self.holepunch_cooltime == Cooltime::Never {
            Cooltime::Never
        }
        else {
            Cooltime::Until(now + cooltime)
        }
    }

    /// explicit renewal: forget previous failures
    pub fn reset_attempts(&mut self) {
        self.holepunch_cooltime = Cooltime::Ready;
        self.holepunch_attempt_count = 0;
        self.tcp_fallback_count = 0;
    }
}

impl Default for FallbackableTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rstest::rstest;

    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from_str("10.0.0.1:7000").unwrap()
    }

    fn enabled_transport(now: Instant) -> FallbackableTransport {
        let mut transport = FallbackableTransport::new();
        transport.set_remote_addr(Some(addr()));
        transport.set_real_udp_enabled(true, now);
        transport
    }

    #[test]
    fn test_set_real_udp_enabled_is_idempotent() {
        let t0 = Instant::now();
        let mut transport = enabled_transport(t0);
        transport.log_packet_received(t0 + Duration::from_secs(1));

        transport.set_real_udp_enabled(true, t0 + Duration::from_secs(2));
        assert_eq!(transport.udp_enabled_since(), Some(t0));
        assert_eq!(transport.last_packet_recv_time(), Some(t0 + Duration::from_secs(1)));

        transport.set_real_udp_enabled(false, t0 + Duration::from_secs(3));
        assert_eq!(transport.udp_enabled_since(), None);
        assert_eq!(transport.last_packet_recv_time(), None);
        transport.set_real_udp_enabled(false, t0 + Duration::from_secs(4));
        assert!(!transport.real_udp_enabled());
    }

    #[rstest]
    #[case::udp(true, true, false, SendPath::Udp(addr()), 1)]
    #[case::engine_only(true, true, true, SendPath::Udp(addr()), 0)]
    #[case::socket_closed(true, false, false, SendPath::Tcp, 0)]
    #[case::udp_disabled(false, true, false, SendPath::Tcp, 0)]
    fn test_select_path(#[case] enabled: bool, #[case] socket_open: bool, #[case] engine_only: bool, #[case] expected: SendPath, #[case] expected_count: u64) {
        let t0 = Instant::now();
        let mut transport = enabled_transport(t0);
        transport.set_real_udp_enabled(enabled, t0);
        assert_eq!(transport.select_path(socket_open, SendOptions { engine_only }), expected);
        assert_eq!(transport.udp_attempt_count(), expected_count);
    }

    #[test]
    fn test_log_packet_received_ignores_non_positive_intervals() {
        let t0 = Instant::now();
        let mut transport = enabled_transport(t0);
        transport.log_packet_received(t0 + Duration::from_secs(2));
        transport.log_packet_received(t0 + Duration::from_secs(3));
        assert_eq!(transport.recv_interval(), Some(Duration::from_secs(1)));

        transport.log_packet_received(t0 + Duration::from_secs(3));
        assert_eq!(transport.recv_interval(), Some(Duration::from_secs(1)));
        assert_eq!(transport.recv_count(), 3);
    }

    #[rstest]
    #[case::fresh(None, 10, false)]
    #[case::since_enabled(None, 21, true)]
    #[case::recent_packet(Some(15), 30, false)]
    #[case::stale_packet(Some(5), 30, true)]
    fn test_timeout(#[case] packet_at: Option<u64>, #[case] now: u64, #[case] expected: bool) {
        let t0 = Instant::now();
        let mut transport = enabled_transport(t0);
        if let Some(secs) = packet_at {
            transport.log_packet_received(t0 + Duration::from_secs(secs));
        }
        assert_eq!(transport.is_udp_timed_out(t0 + Duration::from_secs(now), Duration::from_secs(20)), expected);
    }

    #[test]
    fn test_fallback_is_bounded() {
        let t0 = Instant::now();
        let cooltime = Duration::from_secs(30);
        let mut transport = enabled_transport(t0);

        assert!(transport.fall_back_to_tcp(t0, 2, cooltime));
        assert!(!transport.fall_back_to_tcp(t0, 2, cooltime));
        assert_eq!(transport.holepunch_cooltime(), Cooltime::Until(t0 + cooltime));
        assert!(!transport.holepunch_cooltime().is_ready(t0 + Duration::from_secs(29)));
        assert!(transport.holepunch_cooltime().is_ready(t0 + cooltime));

        transport.set_real_udp_enabled(true, t0 + cooltime);
        assert!(transport.fall_back_to_tcp(t0 + cooltime, 2, cooltime));
        assert_eq!(transport.tcp_fallback_count(), 2);
        assert_eq!(transport.holepunch_cooltime(), Cooltime::Never);

        transport.reset_attempts();
        assert_eq!(transport.holepunch_cooltime(), Cooltime::Ready);
    }

    #[test]
    fn test_failed_attempts_are_bounded() {
        let t0 = Instant::now();
        let mut transport = FallbackableTransport::new();
        transport.record_failed_attempt(t0, 2, Duration::from_secs(1));
        assert!(transport.holepunch_cooltime().is_ready(t0 + Duration::from_secs(1)));
        transport.record_failed_attempt(t0, 2, Duration::from_secs(1));
        assert!(!transport.holepunch_cooltime().is_ready(t0 + Duration::from_secs(1000)));
    }
}
