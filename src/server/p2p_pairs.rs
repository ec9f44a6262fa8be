use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use rustc_hash::FxHashMap;
use tracing::debug;
use uuid::Uuid;

use crate::host_id::HostId;

/// An unordered pair of clients, stored with the smaller id first
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PairKey(HostId, HostId);

impl PairKey {
    pub fn new(a: HostId, b: HostId) -> PairKey {
        if a <= b {
            PairKey(a, b)
        }
        else {
            PairKey(b, a)
        }
    }

    pub fn first(&self) -> HostId {
        self.0
    }

    pub fn second(&self) -> HostId {
        self.1
    }

    pub fn contains(&self, host: HostId) -> bool {
        self.0 == host || self.1 == host
    }

    /// the other end of the pair, seen from `host`
    pub fn other(&self, host: HostId) -> Option<HostId> {
        if self.0 == host {
            Some(self.1)
        }
        else if self.1 == host {
            Some(self.0)
        }
        else {
            None
        }
    }
}

/// Server-side state of the P2P connection between two clients sharing at least one group
#[derive(Debug)]
pub struct P2PPair {
    key: PairKey,
    /// number of groups the two share
    ref_count: u32,
    holepunch_tag: Uuid,
    session_key: Bytes,
    first_frame_to_second: u32,
    first_frame_to_first: u32,
    direct: bool,
    jit_triggered: bool,
    ping: Option<Duration>,
    /// (internal, external) of each side's per-peer socket, as seen by server hole punching
    observed: [Option<(SocketAddr, SocketAddr)>; 2],
}

impl P2PPair {
    fn new(key: PairKey) -> P2PPair {
        let mut rng = rand::thread_rng();
        let session_key = rng.gen::<[u8; 16]>();
        P2PPair {
            key,
            ref_count: 0,
            holepunch_tag: Uuid::new_v4(),
            session_key: Bytes::copy_from_slice(&session_key),
            first_frame_to_second: rng.gen_range(1..1 << 20),
            first_frame_to_first: rng.gen_range(1..1 << 20),
            direct: false,
            jit_triggered: false,
            ping: None,
            observed: [None, None],
        }
    }

    pub fn key(&self) -> PairKey {
        self.key
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn holepunch_tag(&self) -> Uuid {
        self.holepunch_tag
    }

    pub fn session_key(&self) -> &Bytes {
        &self.session_key
    }

    /// first reliable frame number of the stream from `from` to the other host
    pub fn first_frame_from(&self, from: HostId) -> u32 {
        if from == self.key.first() {
            self.first_frame_to_second
        }
        else {
            self.first_frame_to_first
        }
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }

    pub fn set_direct(&mut self) {
        self.direct = true;
        self.jit_triggered = false;
    }

    pub fn set_relayed(&mut self) {
        self.direct = false;
    }

    pub fn jit_triggered(&self) -> bool {
        self.jit_triggered
    }

    pub fn set_jit_triggered(&mut self) {
        self.jit_triggered = true;
    }

    pub fn ping(&self) -> Option<Duration> {
        self.ping
    }

    pub fn set_ping(&mut self, ping: Duration) {
        self.ping = Some(ping);
    }

    fn side(&self, host: HostId) -> usize {
        if host == self.key.first() { 0 } else { 1 }
    }

    pub fn observed_addrs(&self, host: HostId) -> Option<(SocketAddr, SocketAddr)> {
        self.observed[self.side(host)]
    }

    /// Stores the addresses the server observed for `host`'s per-peer socket. Returns `true` if
    ///  they are new, i.e. the other side needs to be told.
    pub fn set_observed_addrs(&mut self, host: HostId, internal_addr: SocketAddr, external_addr: SocketAddr) -> bool {
        let side = self.side(host);
        let changed = self.observed[side] != Some((internal_addr, external_addr));
        self.observed[side] = Some((internal_addr, external_addr));
        changed
    }

    /// A new connection epoch: a fresh tag invalidates all probes in flight, and everything
    ///  learned about the old mappings is forgotten.
    pub fn renew(&mut self) -> Uuid {
        self.holepunch_tag = Uuid::new_v4();
        self.set_relayed();
        self.jit_triggered = false;
        self.observed = [None, None];
        self.holepunch_tag
    }
}

#[derive(Default)]
pub struct P2PPairTable {
    pairs: FxHashMap<PairKey, P2PPair>,
}

impl P2PPairTable {
    pub fn new() -> P2PPairTable {
        P2PPairTable::default()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, a: HostId, b: HostId) -> Option<&P2PPair> {
        self.pairs.get(&PairKey::new(a, b))
    }

    pub fn get_mut(&mut self, a: HostId, b: HostId) -> Option<&mut P2PPair> {
        self.pairs.get_mut(&PairKey::new(a, b))
    }

    /// one more shared group, creating the pair on first use
    pub fn add_ref(&mut self, a: HostId, b: HostId) -> &mut P2PPair {
        let key = PairKey::new(a, b);
        let pair = self.pairs.entry(key)
            .or_insert_with(|| {
                debug!("new P2P pair {:?}", key);
                P2PPair::new(key)
            });
        pair.ref_count += 1;
        pair
    }

    /// one shared group less. Returns `true` if the pair was removed.
    pub fn release(&mut self, a: HostId, b: HostId) -> bool {
        let key = PairKey::new(a, b);
        let Some(pair) = self.pairs.get_mut(&key) else {
            return false;
        };
        pair.ref_count = pair.ref_count.saturating_sub(1);
        if pair.ref_count > 0 {
            return false;
        }
        debug!("removing P2P pair {:?}", key);
        self.pairs.remove(&key);
        true
    }

    pub fn pairs_of(&self, host: HostId) -> Vec<PairKey> {
        let mut result = self.pairs.keys()
            .filter(|k| k.contains(host))
            .copied()
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    pub fn remove_host(&mut self, host: HostId) -> Vec<PairKey> {
        let keys = self.pairs_of(host);
        for key in &keys {
            self.pairs.remove(key);
        }
        keys
    }
}
