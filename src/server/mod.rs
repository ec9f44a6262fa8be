pub mod net_server;
pub mod p2p_pairs;
pub mod remote_client;

pub use net_server::ServerCore;
