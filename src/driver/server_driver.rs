use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::select;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::info;

use crate::config::NetConfig;
use crate::driver::ReceivedMessageHandler;
use crate::error::NetError;
use crate::events::{EventNotifier, NetEvent};
use crate::host_id::HostId;
use crate::messaging::rpc::{ClientLinks, ClientToServer};
use crate::server::net_server::ServerCore;
use crate::transport::udp_io::{InboundDatagram, UdpIo};

/// The server side coordinator as an async service, see [crate::driver::NetClient] for the
///  locking model.
#[derive(Clone)]
pub struct NetServer {
    config: Arc<NetConfig>,
    core: Arc<Mutex<ServerCore>>,
    events: Arc<EventNotifier>,
}

impl NetServer {
    pub fn new(config: Arc<NetConfig>, links: Box<dyn ClientLinks>, udp: Box<dyn UdpIo>) -> anyhow::Result<NetServer> {
        config.validate()?;

        let core = ServerCore::new(config.clone(), links, udp, Instant::now());
        Ok(NetServer {
            config,
            core: Arc::new(Mutex::new(core)),
            events: Arc::new(EventNotifier::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.events.subscribe()
    }

    pub async fn with_core<R>(&self, f: impl FnOnce(&ServerCore) -> R) -> R {
        f(&*self.core.lock().await)
    }

    pub async fn open_udp(&self, preferred_port: Option<u16>) -> anyhow::Result<SocketAddr> {
        self.core.lock().await.open_udp(preferred_port)
    }

    pub async fn client_connected(&self, requested: HostId) -> Result<HostId, NetError> {
        self.core.lock().await.on_client_connected(Instant::now(), requested)
    }

    pub async fn client_disconnected(&self, host_id: HostId) {
        self.core.lock().await.on_client_disconnected(Instant::now(), host_id)
    }

    pub async fn create_p2p_group(&self, members: &[HostId], custom: Bytes) -> Result<HostId, NetError> {
        self.core.lock().await.create_p2p_group(Instant::now(), members, custom)
    }

    pub async fn join_p2p_group(&self, group: HostId, member: HostId) -> Result<(), NetError> {
        self.core.lock().await.join_p2p_group(Instant::now(), group, member)
    }

    pub async fn leave_p2p_group(&self, group: HostId, member: HostId) -> Result<(), NetError> {
        self.core.lock().await.leave_p2p_group(group, member)
    }

    pub async fn destroy_p2p_group(&self, group: HostId) -> Result<(), NetError> {
        self.core.lock().await.destroy_p2p_group(Instant::now(), group)
    }

    /// Runs until the channel of incoming client RPCs is closed.
    pub async fn run(
        &self,
        mut rpcs: mpsc::UnboundedReceiver<(HostId, ClientToServer)>,
        mut datagrams: mpsc::Receiver<InboundDatagram>,
        handler: Arc<dyn ReceivedMessageHandler>,
    ) {
        let mut ticks = interval(self.config.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("starting server driver");

        loop {
            let mut finished = false;

            select! {
                _ = ticks.tick() => {
                    self.core.lock().await.tick(Instant::now());
                }
                rpc = rpcs.recv() => match rpc {
                    Some((from, rpc)) => self.core.lock().await.on_rpc(Instant::now(), from, rpc),
                    None => {
                        info!("RPC channel closed - stopping server driver");
                        finished = true;
                    }
                },
                Some(datagram) = datagrams.recv() => {
                    self.core.lock().await.on_datagram(Instant::now(), datagram);
                }
            }

            let (events, inbox) = {
                let mut core = self.core.lock().await;
                (core.drain_events(), core.take_inbox())
            };
            for event in events {
                self.events.send_event(event);
            }
            for msg in inbox {
                handler.on_message(msg).await;
            }

            if finished {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use mockall::predicate::eq;
    use rstest::rstest;

    use super::*;
    use crate::driver::MockReceivedMessageHandler;
    use crate::messaging::peer_message::PeerMessage;
    use crate::messaging::rpc::ServerToClient;
    use crate::messaging::ReceivedMessage;
    use crate::test_util::mesh::{SimNetwork, SimUdpIo, SERVER_IP, SERVER_UDP_PORT};

    fn try_new_server(config: NetConfig) -> (anyhow::Result<NetServer>, mpsc::UnboundedReceiver<(HostId, ServerToClient)>) {
        let net = Arc::new(StdMutex::new(SimNetwork::new()));
        net.lock().unwrap().add_host(SERVER_IP);

        let (links, rpc_out) = mpsc::unbounded_channel::<(HostId, ServerToClient)>();
        let server = NetServer::new(
            Arc::new(config),
            Box::new(links),
            Box::new(SimUdpIo::new(net, SERVER_IP)),
        );
        (server, rpc_out)
    }

    fn new_server() -> (NetServer, mpsc::UnboundedReceiver<(HostId, ServerToClient)>) {
        let (server, rpc_out) = try_new_server(NetConfig::new());
        (server.unwrap(), rpc_out)
    }

    #[rstest]
    #[case::zero_tick(|c: &mut NetConfig| c.tick_interval = Duration::ZERO)]
    #[case::ping_weight(|c: &mut NetConfig| c.ping_moving_avg_new_weight = 0.0)]
    #[case::everything_reserved(|c: &mut NetConfig| c.host_id_reserved_last = HostId(u32::MAX))]
    fn test_invalid_config_is_rejected(#[case] break_config: fn(&mut NetConfig)) {
        let mut config = NetConfig::new();
        break_config(&mut config);
        assert!(try_new_server(config).0.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_and_messages_are_delivered() {
        let (server, _rpc_out) = new_server();
        assert_eq!(server.open_udp(Some(SERVER_UDP_PORT)).await.unwrap(), SocketAddr::new(SERVER_IP, SERVER_UDP_PORT));
        let mut events = server.subscribe();

        let (rpc_in, rpc_rx) = mpsc::unbounded_channel();
        let (_datagrams, datagram_rx) = mpsc::channel(16);
        let (received_tx, mut received_rx) = mpsc::unbounded_channel();
        let mut handler = MockReceivedMessageHandler::new();
        handler.expect_on_message()
            .returning(move |msg| { let _ = received_tx.send(msg); });

        let s = server.clone();
        let driver = tokio::spawn(async move { s.run(rpc_rx, datagram_rx, Arc::new(handler)).await });

        let client = server.client_connected(HostId::NONE).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), NetEvent::ClientJoined { host_id: client });

        let payload = PeerMessage::User(Bytes::from_static(b"hi")).to_bytes();
        rpc_in.send((client, ClientToServer::ReliableRelay { dests: vec![(HostId::SERVER, 0)], payload })).unwrap();
        assert_eq!(received_rx.recv().await, Some(ReceivedMessage { from: client, payload: Bytes::from_static(b"hi"), reliable: true }));

        server.client_disconnected(client).await;
        assert_eq!(events.recv().await.unwrap(), NetEvent::ClientLeft { host_id: client });

        drop(rpc_in);
        driver.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpc_from_unknown_client_is_ignored() {
        let (server, _rpc_out) = new_server();

        let (rpc_in, rpc_rx) = mpsc::unbounded_channel();
        let (_datagrams, datagram_rx) = mpsc::channel(16);
        let mut handler = MockReceivedMessageHandler::new();
        handler.expect_on_message()
            .with(eq(ReceivedMessage { from: HostId(42), payload: Bytes::from_static(b"x"), reliable: true }))
            .never();

        let s = server.clone();
        let driver = tokio::spawn(async move { s.run(rpc_rx, datagram_rx, Arc::new(handler)).await });

        let payload = PeerMessage::User(Bytes::from_static(b"x")).to_bytes();
        rpc_in.send((HostId(42), ClientToServer::ReliableRelay { dests: vec![(HostId::SERVER, 0)], payload })).unwrap();
        drop(rpc_in);
        driver.await.unwrap();

        assert!(server.with_core(|c| c.client_ids()).await.is_empty());
    }
}
