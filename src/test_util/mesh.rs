use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::client::net_client::ClientCore;
use crate::config::NetConfig;
use crate::host_id::HostId;
use crate::messaging::rpc::{ClientToServer, ServerToClient};
use crate::server::net_server::ServerCore;
use crate::transport::udp_io::{InboundDatagram, UdpIo};

pub const SERVER_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
pub const SERVER_UDP_PORT: u16 = 7000;

/// the LAN address of the k-th client, starting at 1
pub fn client_private_ip(k: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, k, 2))
}

/// the address the k-th client's NAT uses on the internet
pub fn client_public_ip(k: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(203, 0, 113, k))
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SentPacket {
    /// source address as it appears on the wire, i.e. after NAT
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub data: Bytes,
    pub delivered: bool,
}

/// An address restricted cone NAT: one public port per local port regardless of destination, and
///  inbound traffic is only let through from IPs the local port sent to before.
struct Nat {
    public_ip: IpAddr,
    next_port: u16,
    mappings: FxHashMap<u16, u16>,
    reverse: FxHashMap<u16, u16>,
    permits: FxHashSet<(u16, IpAddr)>,
}
impl Nat {
    fn new(public_ip: IpAddr) -> Nat {
        Nat {
            public_ip,
            next_port: 40000,
            mappings: FxHashMap::default(),
            reverse: FxHashMap::default(),
            permits: FxHashSet::default(),
        }
    }

    fn outbound(&mut self, local_port: u16, to: IpAddr) -> SocketAddr {
        let public_port = match self.mappings.get(&local_port) {
            Some(p) => *p,
            None => {
                let p = self.next_port;
                self.next_port += 1;
                self.mappings.insert(local_port, p);
                self.reverse.insert(p, local_port);
                p
            }
        };
        self.permits.insert((local_port, to));
        SocketAddr::new(self.public_ip, public_port)
    }

    fn inbound(&self, public_port: u16, from: IpAddr) -> Option<u16> {
        let local_port = *self.reverse.get(&public_port)?;
        if self.permits.contains(&(local_port, from)) {
            Some(local_port)
        }
        else {
            None
        }
    }
}

struct SimHost {
    nat: Option<Nat>,
    next_port: u16,
    open: FxHashSet<u16>,
    closing: FxHashSet<u16>,
    parked: FxHashSet<u16>,
    inbox: VecDeque<InboundDatagram>,
}
impl SimHost {
    fn new(nat: Option<Nat>) -> SimHost {
        SimHost {
            nat,
            next_port: 50000,
            open: FxHashSet::default(),
            closing: FxHashSet::default(),
            parked: FxHashSet::default(),
            inbox: VecDeque::new(),
        }
    }
}

/// An in-memory internet. Hosts are keyed by their own (LAN) IP, NATed hosts additionally have
///  a public IP. Delivery is immediate: datagrams queue up at the receiving host until taken.
#[derive(Default)]
pub struct SimNetwork {
    hosts: FxHashMap<IpAddr, SimHost>,
    /// (wire source IP, destination IP)
    blocked: FxHashSet<(IpAddr, IpAddr)>,
    log: Vec<SentPacket>,
    /// if set, closed sockets stay busy until [SimNetwork::finish_closes]
    hold_closes: bool,
}

impl SimNetwork {
    pub fn new() -> SimNetwork {
        SimNetwork::default()
    }

    /// a host with a public address
    pub fn add_host(&mut self, ip: IpAddr) {
        self.hosts.entry(ip).or_insert_with(|| SimHost::new(None));
    }

    pub fn add_natted_host(&mut self, private_ip: IpAddr, public_ip: IpAddr) {
        self.hosts.insert(private_ip, SimHost::new(Some(Nat::new(public_ip))));
    }

    /// Opening a socket on an unknown IP registers a host with a public address.
    pub fn open(&mut self, ip: IpAddr, preferred_port: Option<u16>) -> anyhow::Result<SocketAddr> {
        let host = self.hosts.entry(ip).or_insert_with(|| SimHost::new(None));
        let port = match preferred_port {
            Some(p) if !host.open.contains(&p) && !host.closing.contains(&p) => p,
            _ => {
                while host.open.contains(&host.next_port) || host.closing.contains(&host.next_port) {
                    host.next_port += 1;
                }
                host.next_port
            }
        };
        host.open.insert(port);
        Ok(SocketAddr::new(ip, port))
    }

    pub fn send(&mut self, ip: IpAddr, local_port: u16, to: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        let Some(host) = self.hosts.get_mut(&ip) else {
            bail!("no host {:?}", ip);
        };
        if !host.open.contains(&local_port) {
            bail!("port {} on {:?} is not open", local_port, ip);
        }
        let from = match host.nat.as_mut() {
            Some(nat) => nat.outbound(local_port, to.ip()),
            None => SocketAddr::new(ip, local_port),
        };

        let delivered = !self.blocked.contains(&(from.ip(), to.ip())) && self.deliver(from, to, data);
        trace!("{:?} -> {:?}: {} bytes{}", from, to, data.len(), if delivered { "" } else { " (dropped)" });
        self.log.push(SentPacket { from, to, data: Bytes::copy_from_slice(data), delivered });
        Ok(())
    }

    fn deliver(&mut self, from: SocketAddr, to: SocketAddr, data: &[u8]) -> bool {
        let natted = self.hosts.values_mut()
            .find(|h| h.nat.as_ref().map(|n| n.public_ip == to.ip()).unwrap_or(false));

        let (host, local_port) = match natted {
            Some(host) => {
                let Some(local_port) = host.nat.as_ref().and_then(|n| n.inbound(to.port(), from.ip())) else {
                    return false;
                };
                (host, local_port)
            }
            None => match self.hosts.get_mut(&to.ip()) {
                // LAN addresses behind a NAT are not routable from outside
                Some(host) if host.nat.is_none() => (host, to.port()),
                _ => return false,
            },
        };

        if !host.open.contains(&local_port) {
            return false;
        }
        host.inbox.push_back(InboundDatagram { local_port, from, data: Bytes::copy_from_slice(data) });
        true
    }

    pub fn take_inbound(&mut self, ip: IpAddr) -> Vec<InboundDatagram> {
        self.hosts.get_mut(&ip)
            .map(|h| h.inbox.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn begin_close(&mut self, ip: IpAddr, local_port: u16) {
        let hold_closes = self.hold_closes;
        if let Some(host) = self.hosts.get_mut(&ip) {
            if host.open.remove(&local_port) && hold_closes {
                host.closing.insert(local_port);
            }
            host.inbox.retain(|d| d.local_port != local_port);
        }
    }

    pub fn is_closed(&self, ip: IpAddr, local_port: u16) -> bool {
        match self.hosts.get(&ip) {
            Some(host) => !host.open.contains(&local_port) && !host.closing.contains(&local_port),
            None => true,
        }
    }

    pub fn park(&mut self, ip: IpAddr, local_port: u16) {
        if let Some(host) = self.hosts.get_mut(&ip) {
            host.closing.remove(&local_port);
            host.parked.insert(local_port);
        }
    }

    pub fn num_parked(&self, ip: IpAddr) -> usize {
        self.hosts.get(&ip)
            .map(|h| h.parked.len())
            .unwrap_or(0)
    }

    pub fn set_hold_closes(&mut self, hold_closes: bool) {
        self.hold_closes = hold_closes;
    }

    pub fn finish_closes(&mut self) {
        for host in self.hosts.values_mut() {
            host.closing.clear();
        }
    }

    /// drops all datagrams whose wire source IP is `from` and destination IP is `to`
    pub fn block(&mut self, from: IpAddr, to: IpAddr) {
        self.blocked.insert((from, to));
    }

    pub fn unblock(&mut self, from: IpAddr, to: IpAddr) {
        self.blocked.remove(&(from, to));
    }

    /// The NAT in front of `private_ip` forgets all mappings, as after a router reboot: the next
    ///  outbound datagram of every socket gets a new public port.
    pub fn rebind_nat(&mut self, private_ip: IpAddr) {
        if let Some(nat) = self.hosts.get_mut(&private_ip).and_then(|h| h.nat.as_mut()) {
            debug!("rebinding NAT {:?}", nat.public_ip);
            nat.mappings.clear();
            nat.reverse.clear();
            nat.permits.clear();
        }
    }

    pub fn sent(&self) -> &[SentPacket] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }
}

fn lock(net: &Mutex<SimNetwork>) -> MutexGuard<'_, SimNetwork> {
    net.lock().unwrap_or_else(|e| e.into_inner())
}

/// [UdpIo] for one host of a [SimNetwork]
pub struct SimUdpIo {
    net: Arc<Mutex<SimNetwork>>,
    ip: IpAddr,
}
impl SimUdpIo {
    pub fn new(net: Arc<Mutex<SimNetwork>>, ip: IpAddr) -> SimUdpIo {
        SimUdpIo { net, ip }
    }
}

impl UdpIo for SimUdpIo {
    fn open(&mut self, preferred_port: Option<u16>) -> anyhow::Result<SocketAddr> {
        lock(&self.net).open(self.ip, preferred_port)
    }

    fn send_to(&mut self, local_port: u16, to: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        lock(&self.net).send(self.ip, local_port, to, data)
    }

    fn begin_close(&mut self, local_port: u16) {
        lock(&self.net).begin_close(self.ip, local_port);
    }

    fn is_closed(&self, local_port: u16) -> bool {
        lock(&self.net).is_closed(self.ip, local_port)
    }

    fn park(&mut self, local_port: u16) {
        lock(&self.net).park(self.ip, local_port);
    }
}

/// A server and `n` NATed clients on a [SimNetwork], with RPCs and datagrams pumped between them
///  synchronously. Time is virtual and advances in ticks.
pub struct TestMesh {
    pub net: Arc<Mutex<SimNetwork>>,
    pub config: Arc<NetConfig>,
    pub server: ServerCore,
    /// the k-th client sits at [client_private_ip] (k+1)
    pub clients: Vec<ClientCore>,
    /// every RPC from a client to the server, in order
    pub rpc_log: Vec<(HostId, ClientToServer)>,
    /// every RPC from the server to a client, in order
    pub server_rpc_log: Vec<(HostId, ServerToClient)>,
    pub now: Instant,
    server_rpcs: mpsc::UnboundedReceiver<(HostId, ServerToClient)>,
    client_rpcs: Vec<mpsc::UnboundedReceiver<ClientToServer>>,
}

impl TestMesh {
    /// Connects `num_clients` clients and lets them establish UDP to the server.
    pub fn new(config: NetConfig, num_clients: u8) -> anyhow::Result<TestMesh> {
        config.validate()?;
        let config = Arc::new(config);
        let now = Instant::now();
        let net = Arc::new(Mutex::new(SimNetwork::new()));

        let (server_send, server_rpcs) = mpsc::unbounded_channel();
        let mut server = ServerCore::new(config.clone(), Box::new(server_send), Box::new(SimUdpIo::new(net.clone(), SERVER_IP)), now);
        server.open_udp(Some(SERVER_UDP_PORT))?;

        let mut clients = Vec::new();
        let mut client_rpcs = Vec::new();
        for k in 1..=num_clients {
            lock(&net).add_natted_host(client_private_ip(k), client_public_ip(k));
            let host_id = server.on_client_connected(now, HostId::NONE)?;

            let (send, recv) = mpsc::unbounded_channel();
            let udp = SimUdpIo::new(net.clone(), client_private_ip(k));
            let mut client = ClientCore::new(config.clone(), host_id, Box::new(send), Box::new(udp), now);
            client.request_server_udp()?;
            clients.push(client);
            client_rpcs.push(recv);
        }

        let mut mesh = TestMesh {
            net,
            config,
            server,
            clients,
            rpc_log: Vec::new(),
            server_rpc_log: Vec::new(),
            now,
            server_rpcs,
            client_rpcs,
        };
        mesh.pump();
        Ok(mesh)
    }

    pub fn host_id(&self, idx: usize) -> HostId {
        self.clients[idx].host_id()
    }

    pub fn net(&self) -> MutexGuard<'_, SimNetwork> {
        lock(&self.net)
    }

    /// Delivers RPCs and datagrams until nothing is in flight any more.
    pub fn pump(&mut self) {
        for _ in 0..1000 {
            let mut quiet = true;

            for (idx, rpcs) in self.client_rpcs.iter_mut().enumerate() {
                let from = self.clients[idx].host_id();
                while let Ok(rpc) = rpcs.try_recv() {
                    quiet = false;
                    self.rpc_log.push((from, rpc.clone()));
                    self.server.on_rpc(self.now, from, rpc);
                }
            }

            while let Ok((to, rpc)) = self.server_rpcs.try_recv() {
                quiet = false;
                self.server_rpc_log.push((to, rpc.clone()));
                match self.clients.iter_mut().find(|c| c.host_id() == to) {
                    Some(client) => client.on_rpc(self.now, rpc),
                    None => trace!("RPC to disconnected client {:?} - dropping", to),
                }
            }

            let inbound = lock(&self.net).take_inbound(SERVER_IP);
            for datagram in inbound {
                quiet = false;
                self.server.on_datagram(self.now, datagram);
            }
            for (idx, client) in self.clients.iter_mut().enumerate() {
                let inbound = lock(&self.net).take_inbound(client_private_ip(idx as u8 + 1));
                for datagram in inbound {
                    quiet = false;
                    client.on_datagram(self.now, datagram);
                }
            }

            if quiet {
                return;
            }
        }
        warn!("mesh did not settle");
    }

    /// Advances virtual time by `duration` in steps of the tick interval, ticking everybody and
    ///  pumping after each step.
    pub fn advance(&mut self, duration: Duration) {
        let tick = self.config.tick_interval;
        let steps = (duration.as_nanos() / tick.as_nanos()).max(1);
        for _ in 0..steps {
            self.now += tick;
            self.server.tick(self.now);
            for client in self.clients.iter_mut() {
                client.tick(self.now);
            }
            self.pump();
        }
    }
}
