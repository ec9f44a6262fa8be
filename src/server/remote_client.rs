use std::net::SocketAddr;

use rustc_hash::FxHashSet;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::host_id::HostId;
use crate::transport::fallbackable::FallbackableTransport;

/// A connected client as seen from the server
pub struct RemoteClient {
    host_id: HostId,
    /// correlation tag for this client's server-link UDP probes
    udp_tag: Uuid,
    udp_requested: bool,
    pub transport: FallbackableTransport,
    external_addr: Option<SocketAddr>,
    internal_addr: Option<SocketAddr>,
    connected_at: Instant,

    udp_sent_count: u64,
    reported_udp_recv_count: u64,
    joined_groups: FxHashSet<HostId>,
}

impl RemoteClient {
    pub fn new(host_id: HostId, now: Instant) -> RemoteClient {
        RemoteClient {
            host_id,
            udp_tag: Uuid::new_v4(),
            udp_requested: false,
            transport: FallbackableTransport::new(),
            external_addr: None,
            internal_addr: None,
            connected_at: now,
            udp_sent_count: 0,
            reported_udp_recv_count: 0,
            joined_groups: FxHashSet::default(),
        }
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn udp_tag(&self) -> Uuid {
        self.udp_tag
    }

    pub fn udp_requested(&self) -> bool {
        self.udp_requested
    }

    pub fn set_udp_requested(&mut self) {
        self.udp_requested = true;
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn external_addr(&self) -> Option<SocketAddr> {
        self.external_addr
    }

    pub fn internal_addr(&self) -> Option<SocketAddr> {
        self.internal_addr
    }

    /// Returns `true` if a previously known external address changed.
    pub fn set_addrs(&mut self, internal_addr: SocketAddr, external_addr: SocketAddr) -> bool {
        let changed = matches!(self.external_addr, Some(prev) if prev != external_addr);
        if changed {
            debug!("external address of {:?} changed from {:?} to {:?}", self.host_id, self.external_addr, external_addr);
        }
        self.internal_addr = Some(internal_addr);
        self.external_addr = Some(external_addr);
        self.transport.set_remote_addr(Some(external_addr));
        changed
    }

    /// the address to send server-link datagrams to, if UDP to this client works
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        if self.transport.real_udp_enabled() {
            self.transport.remote_addr()
        }
        else {
            None
        }
    }

    pub fn udp_sent_count(&self) -> u64 {
        self.udp_sent_count
    }

    pub fn inc_udp_sent_count(&mut self) {
        self.udp_sent_count += 1;
    }

    pub fn reported_udp_recv_count(&self) -> u64 {
        self.reported_udp_recv_count
    }

    pub fn set_reported_udp_recv_count(&mut self, count: u64) {
        self.reported_udp_recv_count = count;
    }

    pub fn joined_groups(&self) -> &FxHashSet<HostId> {
        &self.joined_groups
    }

    pub fn add_group(&mut self, group: HostId) {
        self.joined_groups.insert(group);
    }

    pub fn remove_group(&mut self, group: HostId) {
        self.joined_groups.remove(&group);
    }
}
