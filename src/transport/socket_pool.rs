use std::net::SocketAddr;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::host_id::HostId;
use crate::transport::udp_io::UdpIo;

/// A per-peer UDP socket. The owner is a lookup key, never a reference: once a socket is handed
///  to the pool, `owner` is cleared and late datagrams on it are ignored.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PooledSocket {
    pub local_addr: SocketAddr,
    pub owner: Option<HostId>,
    /// the socket carried a confirmed direct link at some point
    pub confirmed_direct: bool,
}
impl PooledSocket {
    pub fn new(local_addr: SocketAddr, owner: HostId) -> PooledSocket {
        PooledSocket {
            local_addr,
            owner: Some(owner),
            confirmed_direct: false,
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }
}

#[derive(Debug)]
struct RecycledSocket {
    socket: PooledSocket,
    last_peer: HostId,
    binned_at: Instant,
}

#[derive(Debug)]
struct GarbageSocket {
    local_port: u16,
    close_started: bool,
}

/// Sockets no peer owns any more. Sockets that carried a confirmed direct link go to the recycle
///  bin (keyed by local port) for a while, so a second hole punch to the same peer can reuse the
///  same local port. Everything else goes to the garbage list until the I/O layer confirms
///  nothing is outstanding on it.
#[derive(Default, Debug)]
pub struct SocketPool {
    recycle_bin: FxHashMap<u16, RecycledSocket>,
    garbage: Vec<GarbageSocket>,
}

impl SocketPool {
    pub fn new() -> SocketPool {
        SocketPool::default()
    }

    /// Takes over a socket a peer gives up. Whether it is recycled or discarded depends on
    ///  whether it ever carried a confirmed direct link.
    pub fn release(&mut self, mut socket: PooledSocket, now: Instant) {
        let last_peer = socket.owner.take();
        match last_peer {
            Some(last_peer) if socket.confirmed_direct => {
                let port = socket.local_port();
                debug!("moving socket on port {} of {:?} to the recycle bin", port, last_peer);
                if let Some(prev) = self.recycle_bin.insert(port, RecycledSocket { socket, last_peer, binned_at: now }) {
                    warn!("recycle bin already contained a socket for port {} - discarding it", port);
                    self.discard(prev.socket);
                }
            }
            _ => self.discard(socket),
        }
    }

    pub fn discard(&mut self, mut socket: PooledSocket) {
        socket.owner = None;
        trace!("moving socket on port {} to garbage", socket.local_port());
        self.garbage.push(GarbageSocket { local_port: socket.local_port(), close_started: false });
    }

    /// A recycled socket that last served `peer`, handed to `peer` as its new owner
    pub fn take_recycled_for(&mut self, peer: HostId) -> Option<PooledSocket> {
        let port = self.recycle_bin.iter()
            .find(|(_, r)| r.last_peer == peer)
            .map(|(port, _)| *port)?;
        self.take_port(port, peer)
    }

    pub fn take_port(&mut self, port: u16, new_owner: HostId) -> Option<PooledSocket> {
        let mut recycled = self.recycle_bin.remove(&port)?.socket;
        debug!("reusing recycled socket on port {} for {:?}", port, new_owner);
        recycled.owner = Some(new_owner);
        Some(recycled)
    }

    pub fn is_recycled(&self, port: u16) -> bool {
        self.recycle_bin.contains_key(&port)
    }

    pub fn is_garbage(&self, port: u16) -> bool {
        self.garbage.iter().any(|g| g.local_port == port)
    }

    pub fn num_recycled(&self) -> usize {
        self.recycle_bin.len()
    }

    pub fn num_garbage(&self) -> usize {
        self.garbage.len()
    }

    /// moves recycle bin entries older than `window` to the garbage list
    pub fn expire_recycled(&mut self, now: Instant, window: Duration) {
        let expired = self.recycle_bin.iter()
            .filter(|(_, r)| now.saturating_duration_since(r.binned_at) > window)
            .map(|(port, _)| *port)
            .collect::<Vec<_>>();

        for port in expired {
            if let Some(r) = self.recycle_bin.remove(&port) {
                debug!("recycled socket on port {} expired", port);
                self.discard(r.socket);
            }
        }
    }

    /// Starts closing garbage sockets and forgets the ones the I/O layer reports closed.
    pub fn collect_garbage(&mut self, io: &mut dyn UdpIo) {
        for g in self.garbage.iter_mut() {
            if !g.close_started {
                io.begin_close(g.local_port);
                g.close_started = true;
            }
        }
        self.garbage.retain(|g| !io.is_closed(g.local_port));
    }

    /// Teardown: everything becomes garbage. Returns the ports that are still being closed.
    pub fn drain_all(&mut self, io: &mut dyn UdpIo) -> Vec<u16> {
        let recycled = self.recycle_bin.drain()
            .map(|(_, r)| r.socket)
            .collect::<Vec<_>>();
        for socket in recycled {
            self.discard(socket);
        }
        self.collect_garbage(io);
        self.garbage.drain(..)
            .map(|g| g.local_port)
            .collect()
    }
}
