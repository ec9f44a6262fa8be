use bytes::Bytes;

use crate::host_id::HostId;

pub mod peer_message;
pub mod relay;
pub mod reliable;
pub mod rpc;
pub mod wire;

/// An application payload ready for delivery
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceivedMessage {
    pub from: HostId,
    pub payload: Bytes,
    pub reliable: bool,
}
