use std::collections::VecDeque;
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::host_id::{next_fresh_id, HostId, HostIdFactory};

/// Reuses dropped ids, but only after they have 'cooled down' for `issue_valid_time`, so that
///  late messages addressed to a departed host are not misdelivered to its successor.
///
/// NB: only the oldest dropped id is considered. If it is still cooling down, a fresh id is
///  minted even if a younger entry would be eligible - there is no younger eligible entry
///  anyway as long as drop timestamps are monotonic.
pub struct RecycleHostIdFactory {
    reserved_last: HostId,
    issue_valid_time: Duration,
    counter: u32,
    in_use: FxHashSet<HostId>,
    drop_queue: VecDeque<HostId>,
    dropped_at: FxHashMap<HostId, Instant>,
    recycle_counts: FxHashMap<HostId, u32>,
}

impl RecycleHostIdFactory {
    pub fn new(reserved_last: HostId, issue_valid_time: Duration) -> RecycleHostIdFactory {
        RecycleHostIdFactory {
            reserved_last,
            issue_valid_time,
            counter: reserved_last.0,
            in_use: FxHashSet::default(),
            drop_queue: VecDeque::new(),
            dropped_at: FxHashMap::default(),
            recycle_counts: FxHashMap::default(),
        }
    }

    fn try_recycle(&mut self, now: Instant) -> Option<HostId> {
        let &oldest = self.drop_queue.front()?;

        let dropped_at = match self.dropped_at.get(&oldest) {
            Some(t) => *t,
            None => {
                error!("drop queue entry {:?} has no drop timestamp - discarding it", oldest);
                self.drop_queue.pop_front();
                return None;
            }
        };

        if now.saturating_duration_since(dropped_at) <= self.issue_valid_time {
            return None;
        }

        self.drop_queue.pop_front();
        self.dropped_at.remove(&oldest);
        *self.recycle_counts.entry(oldest).or_default() += 1;
        Some(oldest)
    }

    fn mint_fresh(&mut self) -> HostId {
        loop {
            let candidate = next_fresh_id(&mut self.counter, self.reserved_last);
            if candidate.is_none() || (!self.in_use.contains(&candidate) && !self.dropped_at.contains_key(&candidate)) {
                return candidate;
            }
        }
    }
}

impl HostIdFactory for RecycleHostIdFactory {
    fn create(&mut self, now: Instant, _requested: HostId) -> HostId {
        let id = match self.try_recycle(now) {
            Some(id) => {
                debug!("recycling {:?}", id);
                id
            }
            None => self.mint_fresh(),
        };
        if !id.is_none() {
            self.in_use.insert(id);
        }
        id
    }

    fn drop_id(&mut self, now: Instant, id: HostId) {
        if self.dropped_at.contains_key(&id) {
            debug!("{:?} is already pending recycling - ignoring second drop", id);
            return;
        }
        if !self.in_use.remove(&id) {
            warn!("dropping {:?} which was not issued - ignoring", id);
            return;
        }

        self.dropped_at.insert(id, now);
        self.drop_queue.push_back(id);
    }

    fn recycle_count(&self, id: HostId) -> u32 {
        self.recycle_counts.get(&id).copied().unwrap_or(0)
    }
}
