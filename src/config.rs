use std::time::Duration;

use anyhow::bail;

use crate::host_id::HostId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostIdPolicy {
    Monotonic,
    /// dropped ids are reused once they were unused for at least `issue_valid_time`
    RecycleWithCooldown { issue_valid_time: Duration },
    /// the application passes the desired id when a client connects
    Assigned,
}

#[derive(Debug, Clone)]
pub struct NetConfig {
    /// cadence of the coordinator heartbeat that drives all timers
    pub tick_interval: Duration,

    /// peers exchange pings at this interval, and the client pings the server over UDP
    pub ping_interval: Duration,
    /// session level timeout, bounds a whole disconnect including the wait for the driver loop
    pub default_timeout: Duration,
    /// upper bound for waiting on outstanding socket I/O when disconnecting, capped at
    ///  `default_timeout`
    pub disconnect_timeout: Duration,

    pub server_holepunch_interval: Duration,
    pub peer_holepunch_interval: Duration,
    /// an attempt that did not succeed within this time is abandoned, the peer stays relayed
    pub holepunch_attempt_timeout: Duration,
    /// after this many failed attempts or fallbacks for a link, it is never retried automatically
    pub max_holepunch_attempt_count: u32,
    pub holepunch_retry_cooltime: Duration,

    /// the server link falls back to TCP if no UDP packet arrived from the server for this long
    pub udp_to_tcp_fallback_timeout: Duration,
    /// a direct P2P link falls back to relay if no UDP packet arrived from the peer for this long
    pub p2p_fallback_timeout: Duration,
    /// Relay is preferred over a working direct link if `relay_ping * ratio < direct_ping`.
    ///  Values <= 0 disable the heuristic.
    pub force_relay_threshold_ratio: f64,

    /// number of holepunch heartbeats that fan out probes to neighbouring ports
    pub shotgun_attempt_count: u32,
    /// width of the port window around the observed external port
    pub shotgun_port_range: u16,
    /// ports below this are never probed
    pub shotgun_min_port: u16,

    /// how long a socket stays in the recycle bin, available for a second holepunch to the same
    ///  peer from the same local port
    pub recycle_pair_reuse_window: Duration,

    pub join_ack_timeout: Duration,
    /// > 0 and <= 1
    pub ping_moving_avg_new_weight: f64,
    pub reliable_resend_interval: Duration,
    pub report_udp_count_interval: Duration,

    pub allow_direct_p2p: bool,
    /// defer holepunching until there is actual traffic to a peer
    pub enable_jit_p2p: bool,
    /// when a client reports a direct P2P fallback, the server makes the opposite peer fall back
    ///  as well
    pub notify_opposite_on_p2p_fallback: bool,
    /// local port clients should try to bind for P2P sockets
    pub fixed_p2p_bind_port: Option<u16>,

    pub host_id_policy: HostIdPolicy,
    pub host_id_reserved_last: HostId,
}

impl NetConfig {
    pub fn new() -> NetConfig {
        NetConfig {
            tick_interval: Duration::from_millis(10),
            ping_interval: Duration::from_secs(3),
            default_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(3),
            server_holepunch_interval: Duration::from_millis(300),
            peer_holepunch_interval: Duration::from_millis(300),
            holepunch_attempt_timeout: Duration::from_secs(20),
            max_holepunch_attempt_count: 3,
            holepunch_retry_cooltime: Duration::from_secs(30),
            udp_to_tcp_fallback_timeout: Duration::from_secs(20),
            p2p_fallback_timeout: Duration::from_secs(10),
            force_relay_threshold_ratio: 0.0,
            shotgun_attempt_count: 3,
            shotgun_port_range: 8,
            shotgun_min_port: 1024,
            recycle_pair_reuse_window: Duration::from_secs(30),
            join_ack_timeout: Duration::from_secs(10),
            ping_moving_avg_new_weight: 0.5,
            reliable_resend_interval: Duration::from_millis(500),
            report_udp_count_interval: Duration::from_secs(10),
            allow_direct_p2p: true,
            enable_jit_p2p: false,
            notify_opposite_on_p2p_fallback: true,
            fixed_p2p_bind_port: None,
            host_id_policy: HostIdPolicy::Monotonic,
            host_id_reserved_last: HostId::LAST,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, interval) in [
            ("tick interval", self.tick_interval),
            ("ping interval", self.ping_interval),
            ("server hole punch interval", self.server_holepunch_interval),
            ("peer hole punch interval", self.peer_holepunch_interval),
            ("reliable resend interval", self.reliable_resend_interval),
            ("UDP count report interval", self.report_udp_count_interval),
        ] {
            if interval.is_zero() {
                bail!("{} must be positive", name);
            }
        }
        if self.p2p_fallback_timeout <= self.ping_interval {
            bail!("P2P fallback timeout must exceed the ping interval, or every direct link would time out");
        }
        if self.udp_to_tcp_fallback_timeout <= self.ping_interval {
            bail!("UDP to TCP fallback timeout must exceed the ping interval");
        }
        if !(self.ping_moving_avg_new_weight > 0.0 && self.ping_moving_avg_new_weight <= 1.0) {
            bail!("ping moving average weight must be in (0, 1]");
        }
        if self.host_id_reserved_last < HostId::SERVER {
            bail!("the reserved host id range must include the server id");
        }
        if self.host_id_reserved_last == HostId(u32::MAX) {
            bail!("the reserved host id range must leave ids for clients and groups");
        }
        if self.disconnect_timeout >= self.default_timeout {
            bail!("disconnect timeout must be shorter than the default timeout that bounds the whole disconnect");
        }
        if self.shotgun_port_range > 1024 {
            bail!("shotgun port range is unreasonably wide");
        }
        Ok(())
    }
}

impl NetConfig {
    /// how long a disconnect waits for sockets to close before parking them
    pub fn socket_close_timeout(&self) -> Duration {
        self.disconnect_timeout.min(self.default_timeout)
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::new()
    }
}
