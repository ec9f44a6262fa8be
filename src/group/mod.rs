pub mod join_ack;
pub mod p2p_group;

pub use p2p_group::{GroupTable, MemberKind, P2PGroup};
