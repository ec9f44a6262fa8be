use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::client::disconnect::DisconnectProgress;
use crate::client::net_client::{ClientCore, ConnectionState};
use crate::config::NetConfig;
use crate::driver::ReceivedMessageHandler;
use crate::error::NetError;
use crate::events::{EventNotifier, NetEvent};
use crate::host_id::HostId;
use crate::messaging::rpc::{ServerLink, ServerToClient};
use crate::transport::udp_io::{InboundDatagram, UdpIo};

struct ClientState {
    core: ClientCore,
    disconnect_waiter: Option<oneshot::Sender<DisconnectProgress>>,
}

/// The client side coordinator as an async service. All API calls and the driver loop
///  serialize on the main lock; the loop must be running (see [NetClient::run]) for RPCs,
///  datagrams and timers to be processed.
#[derive(Clone)]
pub struct NetClient {
    config: Arc<NetConfig>,
    host_id: HostId,
    state: Arc<Mutex<ClientState>>,
    events: Arc<EventNotifier>,
}

impl NetClient {
    pub fn new(config: Arc<NetConfig>, host_id: HostId, link: Box<dyn ServerLink>, udp: Box<dyn UdpIo>) -> anyhow::Result<NetClient> {
        config.validate()?;

        let core = ClientCore::new(config.clone(), host_id, link, udp, Instant::now());
        Ok(NetClient {
            config,
            host_id,
            state: Arc::new(Mutex::new(ClientState {
                core,
                disconnect_waiter: None,
            })),
            events: Arc::new(EventNotifier::new()),
        })
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.events.subscribe()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.lock().await.core.state()
    }

    /// read access to the coordinator, e.g. for inspecting peers
    pub async fn with_core<R>(&self, f: impl FnOnce(&ClientCore) -> R) -> R {
        f(&self.state.lock().await.core)
    }

    pub async fn request_server_udp(&self) -> Result<(), NetError> {
        self.state.lock().await.core.request_server_udp()
    }

    pub async fn send_to_peer(&self, to: HostId, payload: Bytes, reliable: bool) -> Result<(), NetError> {
        self.state.lock().await.core.send_to_peer(Instant::now(), to, payload, reliable)
    }

    pub async fn send_to_group(&self, group: HostId, payload: Bytes, reliable: bool) -> Result<(), NetError> {
        self.state.lock().await.core.send_to_group(Instant::now(), group, payload, reliable)
    }

    /// Runs until the disconnect completes or the RPC channel from the server is closed.
    pub async fn run(
        &self,
        mut rpcs: mpsc::UnboundedReceiver<ServerToClient>,
        mut datagrams: mpsc::Receiver<InboundDatagram>,
        handler: Arc<dyn ReceivedMessageHandler>,
    ) {
        let mut ticks = interval(self.config.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("starting client driver for {:?}", self.host_id);

        loop {
            let mut finished = false;

            select! {
                _ = ticks.tick() => {
                    finished = self.on_tick().await;
                }
                rpc = rpcs.recv() => match rpc {
                    Some(rpc) => self.state.lock().await.core.on_rpc(Instant::now(), rpc),
                    None => {
                        info!("RPC channel from the server closed - stopping client driver for {:?}", self.host_id);
                        finished = true;
                    }
                },
                Some(datagram) = datagrams.recv() => {
                    self.state.lock().await.core.on_datagram(Instant::now(), datagram);
                }
            }

            self.dispatch(handler.as_ref()).await;
            if finished {
                break;
            }
        }
    }

    /// returns true once a disconnect is done
    async fn on_tick(&self) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.core.tick(now);

        if state.core.state() != ConnectionState::Disconnecting {
            return false;
        }
        let progress = state.core.poll_disconnect(now);
        if progress == DisconnectProgress::Pending {
            return false;
        }
        debug!("disconnect finished: {:?}", progress);
        if let Some(waiter) = state.disconnect_waiter.take() {
            let _ = waiter.send(progress);
        }
        true
    }

    async fn dispatch(&self, handler: &dyn ReceivedMessageHandler) {
        let (events, received) = {
            let mut state = self.state.lock().await;
            (state.core.drain_events(), state.core.take_received())
        };

        for event in events {
            self.events.send_event(event);
        }
        for msg in received {
            handler.on_message(msg).await;
        }
    }

    /// Starts the teardown and waits for the driver loop to complete it. Sockets that are still
    ///  busy when the disconnect timeout elapses are parked with the I/O layer.
    pub async fn disconnect(&self) -> anyhow::Result<DisconnectProgress> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.core.begin_disconnect(Instant::now())?;
            state.disconnect_waiter = Some(sender);
        }

        // the core bounds the socket wait itself, this catches a driver loop that is not running
        match timeout(self.config.default_timeout, receiver).await {
            Ok(Ok(progress)) => Ok(progress),
            Ok(Err(_)) => bail!("client driver for {:?} stopped before the disconnect completed", self.host_id),
            Err(_) => bail!("disconnect of {:?} did not complete within {:?}", self.host_id, self.config.default_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::driver::MockReceivedMessageHandler;
    use crate::messaging::rpc::ClientToServer;
    use crate::test_util::mesh::{client_private_ip, SimNetwork, SimUdpIo, SERVER_IP, SERVER_UDP_PORT};

    struct Fixture {
        net: Arc<StdMutex<SimNetwork>>,
        client: NetClient,
        rpc_in: mpsc::UnboundedSender<ServerToClient>,
        rpc_out: mpsc::UnboundedReceiver<ClientToServer>,
        driver: tokio::task::JoinHandle<()>,
        _datagrams: mpsc::Sender<InboundDatagram>,
    }

    impl Fixture {
        fn new() -> Fixture {
            let net = Arc::new(StdMutex::new(SimNetwork::new()));
            net.lock().unwrap().add_host(client_private_ip(1));

            let (link, rpc_out) = mpsc::unbounded_channel::<ClientToServer>();
            let client = NetClient::new(
                Arc::new(NetConfig::new()),
                HostId(10),
                Box::new(link),
                Box::new(SimUdpIo::new(net.clone(), client_private_ip(1))),
            ).unwrap();

            let (rpc_in, rpc_rx) = mpsc::unbounded_channel();
            let (datagrams, datagram_rx) = mpsc::channel(16);
            let handler = Arc::new(MockReceivedMessageHandler::new());

            let c = client.clone();
            let driver = tokio::spawn(async move { c.run(rpc_rx, datagram_rx, handler).await });

            Fixture { net, client, rpc_in, rpc_out, driver, _datagrams: datagrams }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_completes() {
        let f = Fixture::new();
        let mut events = f.client.subscribe();

        assert_eq!(f.client.disconnect().await.unwrap(), DisconnectProgress::Completed);
        assert_eq!(f.client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(events.recv().await.unwrap(), NetEvent::Disconnected);

        f.driver.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_disconnect_is_rejected() {
        let f = Fixture::new();
        f.client.disconnect().await.unwrap();

        let err = f.client.disconnect().await.unwrap_err();
        assert_eq!(err.downcast_ref::<NetError>(), Some(&NetError::WrongState { expected: "Connected", actual: "Disconnected" }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_parks_busy_socket() {
        let mut f = Fixture::new();

        f.client.request_server_udp().await.unwrap();
        assert_eq!(f.rpc_out.recv().await, Some(ClientToServer::RequestCreateUdpSocket));

        f.rpc_in.send(ServerToClient::RequestCreateUdpSocket {
            server_udp_addr: SocketAddr::new(SERVER_IP, SERVER_UDP_PORT),
            holepunch_tag: Uuid::new_v4(),
        }).unwrap();
        assert_eq!(f.rpc_out.recv().await, Some(ClientToServer::CreateUdpSocketAck { ok: true }));
        assert!(f.client.with_core(|c| c.server_udp_port()).await.is_some());

        f.net.lock().unwrap().set_hold_closes(true);
        let started = Instant::now();
        let progress = f.client.disconnect().await.unwrap();

        match progress {
            DisconnectProgress::TimedOut { busy_ports } => assert_eq!(busy_ports.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        assert!(Instant::now() - started >= Duration::from_secs(3));
        assert_eq!(f.net.lock().unwrap().num_parked(client_private_ip(1)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_without_driver_times_out() {
        let f = Fixture::new();
        drop(f.rpc_in);
        f.driver.await.unwrap();

        let started = Instant::now();
        let err = f.client.disconnect().await.unwrap_err();
        assert!(err.to_string().contains("did not complete"), "{}", err);
        assert!(Instant::now() - started >= NetConfig::new().default_timeout);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = NetConfig::new();
        config.tick_interval = Duration::ZERO;

        let net = Arc::new(StdMutex::new(SimNetwork::new()));
        net.lock().unwrap().add_host(client_private_ip(1));
        let (link, _rpc_out) = mpsc::unbounded_channel::<ClientToServer>();
        let result = NetClient::new(
            Arc::new(config),
            HostId(10),
            Box::new(link),
            Box::new(SimUdpIo::new(net, client_private_ip(1))),
        );
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_rpc_channel_stops_driver() {
        let f = Fixture::new();
        drop(f.rpc_in);
        f.driver.await.unwrap();

        assert_eq!(f.client.connection_state().await, ConnectionState::Connected);
    }
}
