pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod group;
pub mod host_id;
pub mod messaging;
pub mod peer;
pub mod server;
pub mod test_util;
pub mod transport;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
