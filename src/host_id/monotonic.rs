use tokio::time::Instant;
use tracing::trace;

use crate::host_id::{next_fresh_id, HostId, HostIdFactory};

/// Hands out ever-increasing ids and never reuses a dropped one. Collisions are only possible
///  after wrapping around the full 32 bit range.
pub struct MonotonicHostIdFactory {
    reserved_last: HostId,
    counter: u32,
}
impl MonotonicHostIdFactory {
    pub fn new(reserved_last: HostId) -> MonotonicHostIdFactory {
        MonotonicHostIdFactory {
            reserved_last,
            counter: reserved_last.0,
        }
    }
}

impl HostIdFactory for MonotonicHostIdFactory {
    fn create(&mut self, _now: Instant, _requested: HostId) -> HostId {
        let id = next_fresh_id(&mut self.counter, self.reserved_last);
        trace!("issued {:?}", id);
        id
    }

    fn drop_id(&mut self, _now: Instant, _id: HostId) {
    }

    fn recycle_count(&self, _id: HostId) -> u32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_no_reuse() {
        let now = Instant::now();
        let mut factory = MonotonicHostIdFactory::new(HostId(100));

        assert_eq!(factory.create(now, HostId::NONE), HostId(101));
        assert_eq!(factory.create(now, HostId::NONE), HostId(102));
        factory.drop_id(now, HostId(102));
        assert_eq!(factory.create(now, HostId::NONE), HostId(103));
        assert_eq!(factory.recycle_count(HostId(102)), 0);
    }

    #[test]
    fn test_monotonic_ignores_requested_id() {
        let now = Instant::now();
        let mut factory = MonotonicHostIdFactory::new(HostId::LAST);
        assert_eq!(factory.create(now, HostId(5000)), HostId(3));
    }

    #[test]
    fn test_monotonic_wraps_past_reserved_range() {
        let now = Instant::now();
        let mut factory = MonotonicHostIdFactory::new(HostId(100));
        factory.counter = u32::MAX - 1;

        assert_eq!(factory.create(now, HostId::NONE), HostId(u32::MAX));
        assert_eq!(factory.create(now, HostId::NONE), HostId(101));
    }
}
