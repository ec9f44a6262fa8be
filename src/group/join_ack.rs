use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::host_id::HostId;

/// Outcome of one member's join: either all expected acks arrived, or the waiter timed out and
///  `missing_acks` lists the members that did not answer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JoinCompletion {
    pub group: HostId,
    pub member: HostId,
    pub missing_acks: Vec<HostId>,
}

struct JoinAckWaiter {
    event_id: u32,
    /// (acking host, member the ack is about)
    expected: FxHashSet<(HostId, HostId)>,
    started_at: Instant,
}

/// Server-side waiters for the acks of a (group, new member) join. A waiter is bounded in time:
///  expiry completes the join with partial results rather than failing it.
#[derive(Default)]
pub struct JoinAckTable {
    waiters: FxHashMap<(HostId, HostId), JoinAckWaiter>,
}

impl JoinAckTable {
    pub fn new() -> JoinAckTable {
        JoinAckTable::default()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn is_waiting(&self, group: HostId, member: HostId) -> bool {
        self.waiters.contains_key(&(group, member))
    }

    /// Registers a waiter. If nothing is expected, the join is complete right away. A previous
    ///  waiter for the same join is replaced.
    pub fn start(&mut self, group: HostId, member: HostId, event_id: u32, expected: impl IntoIterator<Item = (HostId, HostId)>, now: Instant) -> Option<JoinCompletion> {
        let expected = expected.into_iter().collect::<FxHashSet<_>>();
        if expected.is_empty() {
            return Some(JoinCompletion { group, member, missing_acks: vec![] });
        }

        debug!("waiting for {} join acks for {:?} in group {:?}", expected.len(), member, group);
        if self.waiters.insert((group, member), JoinAckWaiter { event_id, expected, started_at: now }).is_some() {
            debug!("replacing pending join ack waiter for {:?} in group {:?}", member, group);
        }
        None
    }

    /// An ack from `acker` about `added_member`. Acks are matched to the waiter of whichever
    ///  join carried `event_id`.
    pub fn on_ack(&mut self, acker: HostId, group: HostId, added_member: HostId, event_id: u32) -> Option<JoinCompletion> {
        let key = self.waiters.iter()
            .find(|((g, _), w)| *g == group && w.event_id == event_id && w.expected.contains(&(acker, added_member)))
            .map(|(key, _)| *key);

        let Some(key) = key else {
            debug!("unexpected join ack from {:?} for {:?} in group {:?} - ignoring", acker, added_member, group);
            return None;
        };
        self.ack(key, |(a, m)| *a == acker && *m == added_member)
    }

    fn ack(&mut self, key: (HostId, HostId), pred: impl Fn(&(HostId, HostId)) -> bool) -> Option<JoinCompletion> {
        let waiter = self.waiters.get_mut(&key)?;
        waiter.expected.retain(|e| !pred(e));
        if !waiter.expected.is_empty() {
            return None;
        }
        self.waiters.remove(&key);
        debug!("all join acks for {:?} in group {:?} arrived", key.1, key.0);
        Some(JoinCompletion { group: key.0, member: key.1, missing_acks: vec![] })
    }

    /// Completes waiters older than `timeout` with whatever acks are missing.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<JoinCompletion> {
        let mut expired = self.waiters.iter()
            .filter(|(_, w)| now.saturating_duration_since(w.started_at) > timeout)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        expired.sort();

        let mut result = Vec::new();
        for key in expired {
            if let Some(waiter) = self.waiters.remove(&key) {
                let mut missing_acks = waiter.expected.iter()
                    .map(|(acker, _)| *acker)
                    .collect::<Vec<_>>();
                missing_acks.sort();
                missing_acks.dedup();
                info!("join of {:?} to group {:?} timed out, missing acks from {:?}", key.1, key.0, missing_acks);
                result.push(JoinCompletion { group: key.0, member: key.1, missing_acks });
            }
        }
        result
    }

    /// A member left its group or disconnected: its own join is no longer tracked, and nobody
    ///  waits for acks from it or about it.
    pub fn remove_member(&mut self, group: Option<HostId>, member: HostId) -> Vec<JoinCompletion> {
        self.waiters.retain(|(g, m), _| !(*m == member && group.map(|group| group == *g).unwrap_or(true)));

        let affected = self.waiters.keys()
            .filter(|(g, _)| group.map(|group| group == *g).unwrap_or(true))
            .copied()
            .collect::<Vec<_>>();

        let mut result = Vec::new();
        for key in affected {
            if let Some(completion) = self.ack(key, |(a, m)| *a == member || *m == member) {
                result.push(completion);
            }
        }
        result.sort_by_key(|c| (c.group, c.member));
        result
    }

    pub fn remove_group(&mut self, group: HostId) {
        self.waiters.retain(|(g, _), _| *g != group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: HostId = HostId(50);

    #[test]
    fn test_completes_when_all_acks_arrived() {
        let now = Instant::now();
        let mut table = JoinAckTable::new();
        assert_eq!(table.start(G, HostId(11), 1, [(HostId(10), HostId(11)), (HostId(11), HostId(10)), (HostId(11), HostId(11))], now), None);

        assert_eq!(table.on_ack(HostId(10), G, HostId(11), 1), None);
        // duplicate and wrong event id are ignored
        assert_eq!(table.on_ack(HostId(10), G, HostId(11), 1), None);
        assert_eq!(table.on_ack(HostId(11), G, HostId(10), 2), None);
        assert_eq!(table.on_ack(HostId(11), G, HostId(10), 1), None);

        assert_eq!(table.on_ack(HostId(11), G, HostId(11), 1), Some(JoinCompletion { group: G, member: HostId(11), missing_acks: vec![] }));
        assert!(table.is_empty());
    }

    #[test]
    fn test_nothing_expected() {
        let mut table = JoinAckTable::new();
        assert_eq!(table.start(G, HostId(11), 1, [], Instant::now()), Some(JoinCompletion { group: G, member: HostId(11), missing_acks: vec![] }));
        assert!(!table.is_waiting(G, HostId(11)));
    }

    #[test]
    fn test_expiry_reports_missing_acks() {
        let now = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut table = JoinAckTable::new();
        table.start(G, HostId(12), 1, [(HostId(10), HostId(12)), (HostId(11), HostId(12)), (HostId(12), HostId(10)), (HostId(12), HostId(11))], now);
        table.on_ack(HostId(11), G, HostId(12), 1);
        table.on_ack(HostId(12), G, HostId(10), 1);

        assert!(table.expire(now + timeout, timeout).is_empty());
        assert_eq!(table.expire(now + timeout + Duration::from_millis(1), timeout), vec![
            JoinCompletion { group: G, member: HostId(12), missing_acks: vec![HostId(10), HostId(12)] },
        ]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_removed_member_no_longer_blocks_completion() {
        let now = Instant::now();
        let mut table = JoinAckTable::new();
        table.start(G, HostId(12), 1, [(HostId(10), HostId(12)), (HostId(12), HostId(10))], now);
        table.start(G, HostId(10), 2, [(HostId(10), HostId(10))], now);

        assert_eq!(table.remove_member(None, HostId(10)), vec![
            JoinCompletion { group: G, member: HostId(12), missing_acks: vec![] },
        ]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_group() {
        let mut table = JoinAckTable::new();
        table.start(G, HostId(12), 1, [(HostId(10), HostId(12))], Instant::now());
        table.remove_group(G);
        assert!(table.is_empty());
    }
}
