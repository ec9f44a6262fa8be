pub mod disconnect;
pub mod net_client;

pub use net_client::{ClientCore, ConnectionState};
