use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::host_id::{next_fresh_id, HostId, HostIdFactory};

/// Lets the application choose ids, e.g. derived from a persistent account id. Requests for ids
///  inside the reserved range (including [HostId::NONE]) get an internally minted id instead;
///  requests for an id that is currently in use fail with [HostId::NONE].
pub struct AssignedHostIdFactory {
    reserved_last: HostId,
    counter: u32,
    in_use: FxHashSet<HostId>,
    issue_counts: FxHashMap<HostId, u32>,
}

impl AssignedHostIdFactory {
    pub fn new(reserved_last: HostId) -> AssignedHostIdFactory {
        AssignedHostIdFactory {
            reserved_last,
            counter: reserved_last.0,
            in_use: FxHashSet::default(),
            issue_counts: FxHashMap::default(),
        }
    }

    fn mint_fallback(&mut self) -> HostId {
        loop {
            let candidate = next_fresh_id(&mut self.counter, self.reserved_last);
            if candidate.is_none() || !self.in_use.contains(&candidate) {
                return candidate;
            }
        }
    }
}

impl HostIdFactory for AssignedHostIdFactory {
    fn create(&mut self, _now: Instant, requested: HostId) -> HostId {
        let id = if requested <= self.reserved_last {
            let id = self.mint_fallback();
            debug!("requested {:?} is reserved - issuing {:?} instead", requested, id);
            id
        }
        else if self.in_use.contains(&requested) {
            warn!("requested {:?} is already in use", requested);
            return HostId::NONE;
        }
        else {
            requested
        };

        if id.is_none() {
            return id;
        }
        self.in_use.insert(id);
        *self.issue_counts.entry(id).or_default() += 1;
        id
    }

    fn drop_id(&mut self, _now: Instant, id: HostId) {
        if !self.in_use.remove(&id) {
            debug!("dropping {:?} which is not in use - ignoring", id);
        }
    }

    fn recycle_count(&self, id: HostId) -> u32 {
        self.issue_counts.get(&id)
            .map(|n| n.saturating_sub(1))
            .unwrap_or(0)
    }
}
