use std::net::SocketAddr;
use std::time::Duration;

use rustc_hash::FxHashSet;

use crate::host_id::HostId;
use crate::transport::fallbackable::SendOptions;

pub mod holepunch;
pub mod remote_peer;

pub use remote_peer::RemotePeer;

/// How a message to one destination leaves this host
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Route {
    Direct {
        local_port: u16,
        to: SocketAddr,
    },
    /// through the server
    Relay,
}

/// Something messages can be addressed to
pub trait SendTarget {
    fn target_id(&self) -> HostId;

    fn route(&mut self, options: SendOptions) -> Route;
}

/// Membership of a host in the P2P groups it shares with the local host
pub trait GroupMember {
    fn joined_groups(&self) -> &FxHashSet<HostId>;

    /// returns `true` if the group was not joined before
    fn add_group(&mut self, group: HostId) -> bool;

    /// returns `true` if no shared group remains
    fn remove_group(&mut self, group: HostId) -> bool;
}

/// Latency statistics of a link
pub trait PingSource {
    /// smoothed round trip time
    fn recent_ping(&self) -> Option<Duration>;

    /// the most recent sample
    fn last_ping(&self) -> Option<Duration>;

    /// standard deviation over recent samples
    fn jitter(&self) -> Duration;
}
