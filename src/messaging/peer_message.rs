use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::events::FallbackReason;
use crate::messaging::wire::MAX_PAYLOAD_LEN;
use crate::util::buf::{put_bytes, try_get_bytes};

const ID_REPORT_SERVER_TIME_AND_PING: u8 = 1;
const ID_REPORT_SERVER_TIME_AND_PONG: u8 = 2;
const ID_DIRECT_P2P_DISCONNECTED: u8 = 3;
const ID_USER: u8 = 4;

/// leaves room for the peer message header inside a datagram payload
pub const MAX_USER_PAYLOAD_LEN: usize = MAX_PAYLOAD_LEN - 8;

/// Messages exchanged between peers, either directly or relayed through the server. Timestamps
///  are microseconds on the sender's local clock unless noted otherwise; ping values of 0 mean
///  'not measured yet'.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PeerMessage {
    ReportServerTimeAndPing {
        sent_at_micros: u64,
        /// the sender's estimate of the server's clock
        server_time_micros: u64,
        server_ping_micros: u64,
    },
    ReportServerTimeAndPong {
        echo_sent_at_micros: u64,
        server_time_micros: u64,
        server_ping_micros: u64,
    },
    DirectP2PDisconnected {
        reason: FallbackReason,
    },
    User(Bytes),
}

impl PeerMessage {
    pub fn id(&self) -> u8 {
        match self {
            PeerMessage::ReportServerTimeAndPing { .. } => ID_REPORT_SERVER_TIME_AND_PING,
            PeerMessage::ReportServerTimeAndPong { .. } => ID_REPORT_SERVER_TIME_AND_PONG,
            PeerMessage::DirectP2PDisconnected { .. } => ID_DIRECT_P2P_DISCONNECTED,
            PeerMessage::User(_) => ID_USER,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.id());
        match self {
            PeerMessage::ReportServerTimeAndPing { sent_at_micros, server_time_micros, server_ping_micros } => {
                buf.put_u64_varint(*sent_at_micros);
                buf.put_u64_varint(*server_time_micros);
                buf.put_u64_varint(*server_ping_micros);
            }
            PeerMessage::ReportServerTimeAndPong { echo_sent_at_micros, server_time_micros, server_ping_micros } => {
                buf.put_u64_varint(*echo_sent_at_micros);
                buf.put_u64_varint(*server_time_micros);
                buf.put_u64_varint(*server_ping_micros);
            }
            PeerMessage::DirectP2PDisconnected { reason } => {
                buf.put_u8((*reason).into());
            }
            PeerMessage::User(payload) => {
                put_bytes(buf, payload);
            }
        }
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<PeerMessage> {
        let mut buf = buf;
        let result = match buf.try_get_u8()? {
            ID_REPORT_SERVER_TIME_AND_PING => PeerMessage::ReportServerTimeAndPing {
                sent_at_micros: buf.try_get_u64_varint()?,
                server_time_micros: buf.try_get_u64_varint()?,
                server_ping_micros: buf.try_get_u64_varint()?,
            },
            ID_REPORT_SERVER_TIME_AND_PONG => PeerMessage::ReportServerTimeAndPong {
                echo_sent_at_micros: buf.try_get_u64_varint()?,
                server_time_micros: buf.try_get_u64_varint()?,
                server_ping_micros: buf.try_get_u64_varint()?,
            },
            ID_DIRECT_P2P_DISCONNECTED => {
                let raw = buf.try_get_u8()?;
                PeerMessage::DirectP2PDisconnected {
                    reason: FallbackReason::try_from(raw)
                        .map_err(|_| anyhow!("invalid fallback reason {}", raw))?,
                }
            }
            ID_USER => PeerMessage::User(try_get_bytes(&mut buf, MAX_USER_PAYLOAD_LEN)?),
            id => return Err(anyhow!("invalid peer message discriminator {}", id)),
        };
        Ok(result)
    }
}
