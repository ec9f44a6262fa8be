//! The typed RPC surface between clients and the server. Serialization and dispatch belong to
//!  the RPC layer underneath; the connectivity core sees calls as plain values, delivered
//!  reliably and in order per connection.

use std::net::SocketAddr;

#[cfg(test)] use mockall::automock;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::events::FallbackReason;
use crate::host_id::HostId;
use crate::messaging::relay::RelayList;

/// Everything a client needs to know about a (new) member of one of its P2P groups. Frame
///  numbers are from the receiving client's point of view.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MemberJoinInfo {
    pub group: HostId,
    pub member: HostId,
    pub custom: Bytes,
    pub session_key: Bytes,
    pub first_frame_to_member: u32,
    pub first_frame_from_member: u32,
    pub holepunch_tag: Uuid,
    pub direct_p2p_enabled: bool,
    pub fixed_bind_port: Option<u16>,
    /// correlates the join acks with the server's ack waiter
    pub event_id: u32,
}

/// The four addresses of a direct link as reported by its endpoints: `a_send_to_b` is where
///  `a` sends to reach `b`, `a_recv_from_b` is where `b`'s packets arrive from at `a`, and so on.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DirectAddrs {
    pub a_send_to_b: SocketAddr,
    pub a_recv_from_b: SocketAddr,
    pub b_send_to_a: SocketAddr,
    pub b_recv_from_a: SocketAddr,
}
impl DirectAddrs {
    /// the same link, seen from the other end
    pub fn swapped(&self) -> DirectAddrs {
        DirectAddrs {
            a_send_to_b: self.b_send_to_a,
            a_recv_from_b: self.b_recv_from_a,
            b_send_to_a: self.a_send_to_b,
            b_recv_from_a: self.a_recv_from_b,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ClientToServer {
    RequestCreateUdpSocket,
    CreateUdpSocketAck {
        ok: bool,
    },
    NotifyServerHolepunchSuccess {
        internal_addr: SocketAddr,
        external_addr: SocketAddr,
    },
    ReportUdpMessageCount {
        received: u64,
    },
    NotifyUdpToTcpFallback {
        reason: FallbackReason,
    },
    P2PMemberJoinAck {
        group: HostId,
        added_member: HostId,
        event_id: u32,
        local_port_reuse_success: bool,
    },
    NotifyP2PHolepunchSuccess {
        a: HostId,
        b: HostId,
        addrs: DirectAddrs,
    },
    NotifyDirectP2PDisconnected {
        peer: HostId,
        reason: FallbackReason,
    },
    NotifyJitDirectP2PTriggered {
        peer: HostId,
    },
    NotifyP2PPeerReleased {
        peer: HostId,
    },
    ReportPeerPing {
        peer: HostId,
        ping_micros: u64,
    },
    RenewP2PConnectionStateAck {
        peer: HostId,
    },
    /// one payload to several peers, each with the frame number of its own reliable stream
    ReliableRelay {
        dests: Vec<(HostId, u32)>,
        payload: Bytes,
    },
    UnreliableRelay {
        relay_list: RelayList,
        payload: Bytes,
    },
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ServerToClient {
    RequestCreateUdpSocket {
        server_udp_addr: SocketAddr,
        holepunch_tag: Uuid,
    },
    CreateUdpSocketAck {
        ok: bool,
    },
    P2PGroupMemberJoin(MemberJoinInfo),
    P2PGroupMemberLeave {
        group: HostId,
        member: HostId,
    },
    RequestP2PHolepunch {
        peer: HostId,
        internal_addr: SocketAddr,
        external_addr: SocketAddr,
    },
    /// `addrs` is from the receiver's point of view, i.e. the receiver is `a`
    NotifyDirectP2PEstablish {
        a: HostId,
        b: HostId,
        addrs: DirectAddrs,
    },
    SuppressP2PHolepunchTrial {
        peer: HostId,
    },
    RenewP2PConnectionState {
        peer: HostId,
        holepunch_tag: Uuid,
    },
    NewDirectP2PConnection {
        peer: HostId,
    },
    NotifyDirectP2PDisconnected {
        peer: HostId,
        reason: FallbackReason,
    },
    ReliableRelayed {
        from: HostId,
        frame_number: u32,
        payload: Bytes,
    },
    UnreliableRelayed {
        from: HostId,
        payload: Bytes,
    },
}

/// A client's outbound RPC queue to the server. Calls must not block: implementations enqueue.
#[cfg_attr(test, automock)]
pub trait ServerLink: Send + 'static {
    fn call(&mut self, rpc: ClientToServer);
}

/// The server's outbound RPC queues to its connected clients.
#[cfg_attr(test, automock)]
pub trait ClientLinks: Send + 'static {
    fn call(&mut self, to: HostId, rpc: ServerToClient);
}

impl ServerLink for mpsc::UnboundedSender<ClientToServer> {
    fn call(&mut self, rpc: ClientToServer) {
        if self.send(rpc).is_err() {
            debug!("RPC queue to the server is closed - dropping call");
        }
    }
}

impl ClientLinks for mpsc::UnboundedSender<(HostId, ServerToClient)> {
    fn call(&mut self, to: HostId, rpc: ServerToClient) {
        if self.send((to, rpc)).is_err() {
            debug!("RPC queue to clients is closed - dropping call to {:?}", to);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_swapped() {
        let addrs = DirectAddrs {
            a_send_to_b: SocketAddr::from_str("1.1.1.1:1").unwrap(),
            a_recv_from_b: SocketAddr::from_str("2.2.2.2:2").unwrap(),
            b_send_to_a: SocketAddr::from_str("3.3.3.3:3").unwrap(),
            b_recv_from_a: SocketAddr::from_str("4.4.4.4:4").unwrap(),
        };
        let swapped = addrs.swapped();
        assert_eq!(swapped.a_send_to_b, addrs.b_send_to_a);
        assert_eq!(swapped.b_recv_from_a, addrs.a_recv_from_b);
        assert_eq!(swapped.swapped(), addrs);
    }

    #[tokio::test]
    async fn test_channel_server_link() {
        let (send, mut recv) = mpsc::unbounded_channel();
        let mut link: Box<dyn ServerLink> = Box::new(send);
        link.call(ClientToServer::RequestCreateUdpSocket);
        assert_eq!(recv.recv().await, Some(ClientToServer::RequestCreateUdpSocket));

        drop(recv);
        // closed queue is not an error for the caller
        link.call(ClientToServer::RequestCreateUdpSocket);
    }
}
