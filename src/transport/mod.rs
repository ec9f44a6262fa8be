pub mod fallbackable;
pub mod socket_pool;
pub mod udp_io;
