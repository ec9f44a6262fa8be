use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::transport::udp_io::UdpIo;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DisconnectProgress {
    Pending,
    Completed,
    /// the timeout elapsed with I/O still outstanding on these sockets
    TimedOut {
        busy_ports: Vec<u16>,
    },
}

/// Teardown of a client's sockets. Closing a socket is asynchronous, so teardown waits for the
///  I/O layer to confirm each socket closed, polled from the regular tick, but never longer than
///  the timeout.
#[derive(Debug)]
pub struct Disconnect {
    started_at: Instant,
    timeout: Duration,
    closing: Vec<u16>,
}

impl Disconnect {
    /// `closing` are the ports on which [UdpIo::begin_close] was called already
    pub fn new(closing: Vec<u16>, now: Instant, timeout: Duration) -> Disconnect {
        debug!("disconnecting, waiting for {} sockets to close", closing.len());
        Disconnect {
            started_at: now,
            timeout,
            closing,
        }
    }

    pub fn poll(&mut self, now: Instant, io: &dyn UdpIo) -> DisconnectProgress {
        self.closing.retain(|port| !io.is_closed(*port));

        if self.closing.is_empty() {
            return DisconnectProgress::Completed;
        }
        if now.saturating_duration_since(self.started_at) > self.timeout {
            return DisconnectProgress::TimedOut { busy_ports: self.closing.clone() };
        }
        DisconnectProgress::Pending
    }
}
