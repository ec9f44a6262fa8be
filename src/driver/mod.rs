//! Async drivers around the synchronous coordinators. Each driver owns its core behind a single
//!  tokio mutex (the 'main lock'), feeds it RPCs, datagrams and periodic ticks, and delivers
//!  events and received messages after releasing the lock.

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::messaging::ReceivedMessage;

pub mod client_driver;
pub mod server_driver;

pub use client_driver::NetClient;
pub use server_driver::NetServer;

/// Application callback for received payloads. Calls are made from the driver loop, one at a
///  time and never while the main lock is held.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReceivedMessageHandler: Send + Sync + 'static {
    async fn on_message(&self, msg: ReceivedMessage);
}
