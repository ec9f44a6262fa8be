//! Raw engine-internal UDP datagrams. Every datagram starts with a two-byte magic number and a
//!  one-byte kind; anything that does not parse is treated as noise from an untrusted source.

use std::net::SocketAddr;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::host_id::HostId;
use crate::messaging::relay::RelayList;
use crate::util::buf::{put_bytes, put_host_id, put_socket_addr, put_uuid, try_get_bytes, try_get_host_id, try_get_socket_addr, try_get_uuid};

pub const DATAGRAM_MAGIC: u16 = 0x524d;

/// upper bound for payloads, keeping datagrams below typical path MTUs after headers
pub const MAX_PAYLOAD_LEN: usize = 1200;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum DatagramKind {
    ServerHolepunch = 1,
    ServerHolepunchAck = 2,
    PeerHolepunch = 3,
    PeerHolepunchAck = 4,
    ServerPing = 5,
    ServerPong = 6,
    Reliable = 7,
    ReliableAck = 8,
    Unreliable = 9,
    UnreliableRelay = 10,
    UnreliableRelayed = 11,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Datagram {
    /// Probe from a client socket to the server. `target` is [HostId::SERVER] for the client's
    ///  own server link, or the peer a per-peer socket is being punched for.
    ServerHolepunch {
        tag: Uuid,
        from: HostId,
        target: HostId,
        internal_addr: SocketAddr,
    },
    ServerHolepunchAck {
        tag: Uuid,
        target: HostId,
        observed_addr: SocketAddr,
    },
    PeerHolepunch {
        tag: Uuid,
        from: HostId,
        /// the address the probe was sent to, echoed back in the ack
        sent_to: SocketAddr,
    },
    PeerHolepunchAck {
        tag: Uuid,
        from: HostId,
        probe_sent_to: SocketAddr,
        probe_seen_from: SocketAddr,
    },
    /// carries the server link's tag, which only the server and the client know
    ServerPing {
        tag: Uuid,
        from: HostId,
        sent_at_micros: u64,
    },
    ServerPong {
        echo_sent_at_micros: u64,
        server_time_micros: u64,
    },
    Reliable {
        from: HostId,
        nonce: u64,
        frame_number: u32,
        payload: Bytes,
    },
    ReliableAck {
        from: HostId,
        nonce: u64,
        next_expected: u32,
    },
    Unreliable {
        from: HostId,
        nonce: u64,
        payload: Bytes,
    },
    UnreliableRelay {
        from: HostId,
        relay_list: RelayList,
        payload: Bytes,
    },
    UnreliableRelayed {
        from: HostId,
        payload: Bytes,
    },
}

impl Datagram {
    fn kind(&self) -> DatagramKind {
        match self {
            Datagram::ServerHolepunch { .. } => DatagramKind::ServerHolepunch,
            Datagram::ServerHolepunchAck { .. } => DatagramKind::ServerHolepunchAck,
            Datagram::PeerHolepunch { .. } => DatagramKind::PeerHolepunch,
            Datagram::PeerHolepunchAck { .. } => DatagramKind::PeerHolepunchAck,
            Datagram::ServerPing { .. } => DatagramKind::ServerPing,
            Datagram::ServerPong { .. } => DatagramKind::ServerPong,
            Datagram::Reliable { .. } => DatagramKind::Reliable,
            Datagram::ReliableAck { .. } => DatagramKind::ReliableAck,
            Datagram::Unreliable { .. } => DatagramKind::Unreliable,
            Datagram::UnreliableRelay { .. } => DatagramKind::UnreliableRelay,
            Datagram::UnreliableRelayed { .. } => DatagramKind::UnreliableRelayed,
        }
    }

    /// the sending host as claimed by the datagram itself, if the datagram carries one
    pub fn claimed_sender(&self) -> Option<HostId> {
        match self {
            Datagram::ServerHolepunch { from, .. } |
            Datagram::PeerHolepunch { from, .. } |
            Datagram::PeerHolepunchAck { from, .. } |
            Datagram::ServerPing { from, .. } |
            Datagram::Reliable { from, .. } |
            Datagram::ReliableAck { from, .. } |
            Datagram::Unreliable { from, .. } |
            Datagram::UnreliableRelay { from, .. } |
            Datagram::UnreliableRelayed { from, .. } => Some(*from),
            Datagram::ServerHolepunchAck { .. } |
            Datagram::ServerPong { .. } => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(DATAGRAM_MAGIC);
        buf.put_u8(self.kind().into());

        match self {
            Datagram::ServerHolepunch { tag, from, target, internal_addr } => {
                put_uuid(buf, tag);
                put_host_id(buf, *from);
                put_host_id(buf, *target);
                put_socket_addr(buf, internal_addr);
            }
            Datagram::ServerHolepunchAck { tag, target, observed_addr } => {
                put_uuid(buf, tag);
                put_host_id(buf, *target);
                put_socket_addr(buf, observed_addr);
            }
            Datagram::PeerHolepunch { tag, from, sent_to } => {
                put_uuid(buf, tag);
                put_host_id(buf, *from);
                put_socket_addr(buf, sent_to);
            }
            Datagram::PeerHolepunchAck { tag, from, probe_sent_to, probe_seen_from } => {
                put_uuid(buf, tag);
                put_host_id(buf, *from);
                put_socket_addr(buf, probe_sent_to);
                put_socket_addr(buf, probe_seen_from);
            }
            Datagram::ServerPing { tag, from, sent_at_micros } => {
                put_uuid(buf, tag);
                put_host_id(buf, *from);
                buf.put_u64(*sent_at_micros);
            }
            Datagram::ServerPong { echo_sent_at_micros, server_time_micros } => {
                buf.put_u64(*echo_sent_at_micros);
                buf.put_u64(*server_time_micros);
            }
            Datagram::Reliable { from, nonce, frame_number, payload } => {
                put_host_id(buf, *from);
                buf.put_u64(*nonce);
                buf.put_u32_varint(*frame_number);
                put_bytes(buf, payload);
            }
            Datagram::ReliableAck { from, nonce, next_expected } => {
                put_host_id(buf, *from);
                buf.put_u64(*nonce);
                buf.put_u32_varint(*next_expected);
            }
            Datagram::Unreliable { from, nonce, payload } => {
                put_host_id(buf, *from);
                buf.put_u64(*nonce);
                put_bytes(buf, payload);
            }
            Datagram::UnreliableRelay { from, relay_list, payload } => {
                put_host_id(buf, *from);
                relay_list.ser(buf);
                put_bytes(buf, payload);
            }
            Datagram::UnreliableRelayed { from, payload } => {
                put_host_id(buf, *from);
                put_bytes(buf, payload);
            }
        }
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<Datagram> {
        let mut buf = buf;

        let magic = buf.try_get_u16()?;
        if magic != DATAGRAM_MAGIC {
            bail!("not an engine datagram: magic number {:04x}", magic);
        }

        let kind = buf.try_get_u8()?;
        let kind = DatagramKind::try_from(kind)
            .map_err(|_| anyhow!("invalid datagram kind {}", kind))?;

        let result = match kind {
            DatagramKind::ServerHolepunch => Datagram::ServerHolepunch {
                tag: try_get_uuid(&mut buf)?,
                from: try_get_host_id(&mut buf)?,
                target: try_get_host_id(&mut buf)?,
                internal_addr: try_get_socket_addr(&mut buf)?,
            },
            DatagramKind::ServerHolepunchAck => Datagram::ServerHolepunchAck {
                tag: try_get_uuid(&mut buf)?,
                target: try_get_host_id(&mut buf)?,
                observed_addr: try_get_socket_addr(&mut buf)?,
            },
            DatagramKind::PeerHolepunch => Datagram::PeerHolepunch {
                tag: try_get_uuid(&mut buf)?,
                from: try_get_host_id(&mut buf)?,
                sent_to: try_get_socket_addr(&mut buf)?,
            },
            DatagramKind::PeerHolepunchAck => Datagram::PeerHolepunchAck {
                tag: try_get_uuid(&mut buf)?,
                from: try_get_host_id(&mut buf)?,
                probe_sent_to: try_get_socket_addr(&mut buf)?,
                probe_seen_from: try_get_socket_addr(&mut buf)?,
            },
            DatagramKind::ServerPing => Datagram::ServerPing {
                tag: try_get_uuid(&mut buf)?,
                from: try_get_host_id(&mut buf)?,
                sent_at_micros: buf.try_get_u64()?,
            },
            DatagramKind::ServerPong => Datagram::ServerPong {
                echo_sent_at_micros: buf.try_get_u64()?,
                server_time_micros: buf.try_get_u64()?,
            },
            DatagramKind::Reliable => Datagram::Reliable {
                from: try_get_host_id(&mut buf)?,
                nonce: buf.try_get_u64()?,
                frame_number: buf.try_get_u32_varint()?,
                payload: try_get_bytes(&mut buf, MAX_PAYLOAD_LEN)?,
            },
            DatagramKind::ReliableAck => Datagram::ReliableAck {
                from: try_get_host_id(&mut buf)?,
                nonce: buf.try_get_u64()?,
                next_expected: buf.try_get_u32_varint()?,
            },
            DatagramKind::Unreliable => Datagram::Unreliable {
                from: try_get_host_id(&mut buf)?,
                nonce: buf.try_get_u64()?,
                payload: try_get_bytes(&mut buf, MAX_PAYLOAD_LEN)?,
            },
            DatagramKind::UnreliableRelay => Datagram::UnreliableRelay {
                from: try_get_host_id(&mut buf)?,
                relay_list: RelayList::deser(&mut buf)?,
                payload: try_get_bytes(&mut buf, MAX_PAYLOAD_LEN)?,
            },
            DatagramKind::UnreliableRelayed => Datagram::UnreliableRelayed {
                from: try_get_host_id(&mut buf)?,
                payload: try_get_bytes(&mut buf, MAX_PAYLOAD_LEN)?,
            },
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after {:?} datagram", buf.remaining(), kind);
        }
        Ok(result)
    }
}
