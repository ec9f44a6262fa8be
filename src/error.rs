use std::net::SocketAddr;

use crate::host_id::HostId;

/// Precondition violations a caller can reasonably react to. Everything else is either handled
///  internally (fallback, retry) or reported as `anyhow::Error`.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum NetError {
    #[error("operation requires connection state {expected}, but state is {actual}")]
    WrongState {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("unknown peer {0:?}")]
    UnknownPeer(HostId),
    #[error("unknown P2P group {0:?}")]
    UnknownGroup(HostId),
    #[error("{0} is not a unicast endpoint")]
    NotUnicast(SocketAddr),
    #[error("{0:?} has no UDP socket")]
    NoUdpSocket(HostId),
    #[error("payload of {0} bytes exceeds the maximum datagram payload")]
    PayloadTooLarge(usize),
    #[error("host id {0:?} could not be issued")]
    HostIdUnavailable(HostId),
}
