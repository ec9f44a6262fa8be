use std::collections::VecDeque;

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::broadcast;
use tracing::trace;

use crate::host_id::HostId;

/// why a link was downgraded to a slower but more robust path
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FallbackReason {
    /// no direct UDP packet from the peer within the P2P fallback timeout
    P2PUdpTimeout = 1,
    /// the relay path measured faster than the direct path by the configured ratio
    RelayFasterThanDirect = 2,
    /// no UDP packet from the server within the UDP-to-TCP fallback timeout
    ServerUdpTimeout = 3,
    /// the peer told us it dropped the direct link
    RequestedByPeer = 4,
    /// the server told us to drop the direct link
    RequestedByServer = 5,
    /// the peer's external address changed, so hole-punched addresses are stale
    ExternalAddrChanged = 6,
}

/// Application-visible events. They are queued while the engine holds its lock and delivered
///  afterwards in order, so user code never runs concurrently with engine internals.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NetEvent {
    ServerUdpChanged {
        enabled: bool,
        reason: Option<FallbackReason>,
    },
    P2PMemberJoined {
        group: HostId,
        member: HostId,
        custom: Bytes,
    },
    P2PMemberLeft {
        group: HostId,
        member: HostId,
    },
    DirectP2PEstablished {
        peer: HostId,
    },
    RelayP2PEnabled {
        peer: HostId,
        reason: FallbackReason,
    },
    /// informational: the attempt hit its ceiling, the peer stays relayed
    HolepunchAbandoned {
        peer: HostId,
    },
    /// server side: all expected join acks arrived, or the waiter timed out with `missing_acks`
    P2PGroupJoinCompleted {
        group: HostId,
        member: HostId,
        missing_acks: Vec<HostId>,
    },
    ClientJoined {
        host_id: HostId,
    },
    ClientLeft {
        host_id: HostId,
    },
    Disconnected,
    Warning {
        message: String,
    },
}

/// Events raised while the main lock is held. The owner drains them after releasing the lock.
#[derive(Default, Debug)]
pub struct LocalEventQueue {
    events: VecDeque<NetEvent>,
}
impl LocalEventQueue {
    pub fn new() -> LocalEventQueue {
        LocalEventQueue::default()
    }

    pub fn push(&mut self, event: NetEvent) {
        trace!("event: {:?}", event);
        self.events.push_back(event);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(NetEvent::Warning { message: message.into() });
    }

    pub fn drain(&mut self) -> Vec<NetEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetEvent> {
        self.events.iter()
    }
}


pub struct EventNotifier {
    sender: broadcast::Sender<NetEvent>,
}
impl EventNotifier {
    pub fn new() -> EventNotifier {
        let (sender, _) = broadcast::channel(128);

        EventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: NetEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_preserves_order() {
        let mut queue = LocalEventQueue::new();
        queue.push(NetEvent::DirectP2PEstablished { peer: HostId(5) });
        queue.warn("w");
        queue.push(NetEvent::Disconnected);

        assert_eq!(queue.drain(), vec![
            NetEvent::DirectP2PEstablished { peer: HostId(5) },
            NetEvent::Warning { message: "w".to_string() },
            NetEvent::Disconnected,
        ]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fallback_reason_wire_value() {
        assert_eq!(u8::from(FallbackReason::RelayFasterThanDirect), 2);
        assert_eq!(FallbackReason::try_from(4u8).unwrap(), FallbackReason::RequestedByPeer);
        assert!(FallbackReason::try_from(0u8).is_err());
    }

    #[tokio::test]
    async fn test_notifier_delivers_to_subscribers() {
        let notifier = EventNotifier::new();
        let mut receiver = notifier.subscribe();
        notifier.send_event(NetEvent::Disconnected);
        assert_eq!(receiver.recv().await.unwrap(), NetEvent::Disconnected);
    }
}
