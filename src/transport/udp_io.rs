use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::messaging::wire::Datagram;

/// The socket layer as seen by the connectivity core. Sockets are identified by their local
///  port. All calls are non-blocking; received datagrams are delivered by the implementation
///  through whatever channel it was set up with.
#[cfg_attr(test, automock)]
pub trait UdpIo: Send + 'static {
    /// Binds a new socket, preferably to `preferred_port`. Callers compare the returned port to
    ///  detect whether the preferred port could be used.
    fn open(&mut self, preferred_port: Option<u16>) -> anyhow::Result<SocketAddr>;

    fn send_to(&mut self, local_port: u16, to: SocketAddr, data: &[u8]) -> anyhow::Result<()>;

    /// Stops using a socket. Asynchronous operations on it may still be outstanding afterwards,
    ///  see [UdpIo::is_closed].
    fn begin_close(&mut self, local_port: u16);

    /// true once no asynchronous operation is outstanding on a socket passed to
    ///  [UdpIo::begin_close]
    fn is_closed(&self, local_port: u16) -> bool;

    /// hands a socket that is still busy after teardown over to a manager-level wait list
    fn park(&mut self, local_port: u16);
}

/// Best effort: UDP is unreliable anyway, so send errors are logged and otherwise ignored.
pub fn send_datagram(io: &mut dyn UdpIo, local_port: u16, to: SocketAddr, datagram: &Datagram) {
    trace!("sending {:?} from port {} to {:?}", datagram, local_port, to);
    if let Err(e) = io.send_to(local_port, to, &datagram.to_bytes()) {
        debug!("error sending datagram from port {} to {:?}: {:#}", local_port, to, e);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InboundDatagram {
    pub local_port: u16,
    pub from: SocketAddr,
    pub data: Bytes,
}

struct OpenSocket {
    /// duplicate of the receiving socket's descriptor, for synchronous sends
    sender: std::net::UdpSocket,
    recv_task: JoinHandle<()>,
}

/// [UdpIo] on tokio sockets: one receive task per socket, forwarding into a shared channel.
///  Must be used from within a tokio runtime.
pub struct TokioUdpIo {
    bind_ip: IpAddr,
    sockets: FxHashMap<u16, OpenSocket>,
    closing: FxHashMap<u16, JoinHandle<()>>,
    parked: Vec<(u16, JoinHandle<()>)>,
    inbound: mpsc::Sender<InboundDatagram>,
}

impl TokioUdpIo {
    const RECEIVE_BUFFER_SIZE: usize = 2048;

    pub fn new(bind_ip: IpAddr, inbound: mpsc::Sender<InboundDatagram>) -> TokioUdpIo {
        TokioUdpIo {
            bind_ip,
            sockets: FxHashMap::default(),
            closing: FxHashMap::default(),
            parked: Vec::new(),
            inbound,
        }
    }

    fn bind(&self, port: u16) -> anyhow::Result<std::net::UdpSocket> {
        let addr = SocketAddr::new(self.bind_ip, port);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .context("create socket")?;
        socket.set_nonblocking(true)
            .context("set_nonblocking")?;
        // rebinding a recently closed port is what makes port reuse for repeated hole punching work
        socket.set_reuse_address(true)
            .context("set_reuse_address")?;
        socket.bind(&addr.into())
            .with_context(|| format!("bind {}", addr))?;
        Ok(socket.into())
    }

    fn prune_parked(&mut self) {
        self.parked.retain(|(port, handle)| {
            if handle.is_finished() {
                debug!("parked socket on port {} finished", port);
                false
            }
            else {
                true
            }
        });
    }

    pub fn num_parked(&mut self) -> usize {
        self.prune_parked();
        self.parked.len()
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, local_port: u16, inbound: mpsc::Sender<InboundDatagram>) {
    let mut buf = vec![0u8; TokioUdpIo::RECEIVE_BUFFER_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                trace!("received {} bytes on port {} from {:?}", len, local_port, from);
                let datagram = InboundDatagram {
                    local_port,
                    from,
                    data: Bytes::copy_from_slice(&buf[..len]),
                };
                if inbound.send(datagram).await.is_err() {
                    debug!("inbound channel closed - stopping receive loop for port {}", local_port);
                    return;
                }
            }
            Err(e) => {
                // e.g. ICMP 'port unreachable' surfacing as a receive error - not fatal for the socket
                debug!("error receiving on port {}: {}", local_port, e);
            }
        }
    }
}

impl UdpIo for TokioUdpIo {
    fn open(&mut self, preferred_port: Option<u16>) -> anyhow::Result<SocketAddr> {
        let std_socket = match preferred_port {
            // sockets are keyed by local port, so a port can only be handed out once
            Some(port) if self.sockets.contains_key(&port) => self.bind(0)?,
            Some(port) => match self.bind(port) {
                Ok(s) => s,
                Err(e) => {
                    debug!("could not bind preferred port {}, using an ephemeral port: {:#}", port, e);
                    self.bind(0)?
                }
            },
            None => self.bind(0)?,
        };

        let sender = std_socket.try_clone()?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let local_addr = socket.local_addr()?;
        let local_port = local_addr.port();

        let recv_task = tokio::spawn(recv_loop(socket, local_port, self.inbound.clone()));
        self.sockets.insert(local_port, OpenSocket { sender, recv_task });
        debug!("opened UDP socket on {:?}", local_addr);
        Ok(local_addr)
    }

    fn send_to(&mut self, local_port: u16, to: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        let open = self.sockets.get(&local_port)
            .ok_or_else(|| anyhow!("no open socket on port {}", local_port))?;
        let sent = open.sender.send_to(data, to)?;
        if sent < data.len() {
            warn!("datagram to {:?} truncated: {} of {} bytes sent", to, sent, data.len());
        }
        Ok(())
    }

    fn begin_close(&mut self, local_port: u16) {
        if let Some(open) = self.sockets.remove(&local_port) {
            debug!("closing UDP socket on port {}", local_port);
            open.recv_task.abort();
            self.closing.insert(local_port, open.recv_task);
        }
    }

    fn is_closed(&self, local_port: u16) -> bool {
        if self.sockets.contains_key(&local_port) {
            return false;
        }
        self.closing.get(&local_port)
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    fn park(&mut self, local_port: u16) {
        if let Some(handle) = self.closing.remove(&local_port) {
            warn!("socket on port {} still busy after teardown - parking it", local_port);
            self.parked.push((local_port, handle));
        }
        self.prune_parked();
    }
}
