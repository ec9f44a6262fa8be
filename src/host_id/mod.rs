use std::fmt::{Debug, Display, Formatter};

use tokio::time::Instant;

use crate::config::{HostIdPolicy, NetConfig};

pub mod assigned;
pub mod monotonic;
pub mod recycle;

pub use assigned::AssignedHostIdFactory;
pub use monotonic::MonotonicHostIdFactory;
pub use recycle::RecycleHostIdFactory;


/// A small integer naming one connected endpoint (client, server or P2P group) for the lifetime
///  of a server instance.
///
/// Values up to and including the factory's reserved boundary are never issued dynamically.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct HostId(pub u32);

impl HostId {
    /// invalid / unassigned
    pub const NONE: HostId = HostId(0);
    /// well-known id of the server endpoint
    pub const SERVER: HostId = HostId(1);
    /// default upper end of the reserved low range
    pub const LAST: HostId = HostId(2);

    pub fn is_none(&self) -> bool {
        *self == HostId::NONE
    }
}

impl Debug for HostId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            HostId::NONE => write!(f, "HostId(none)"),
            HostId::SERVER => write!(f, "HostId(server)"),
            HostId(n) => write!(f, "HostId({})", n),
        }
    }
}

impl Display for HostId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl From<u32> for HostId {
    fn from(value: u32) -> Self {
        HostId(value)
    }
}


/// Issues and releases [HostId]s. Implementations guarantee that no two ids handed out by
///  [HostIdFactory::create] and not yet passed to [HostIdFactory::drop_id] are equal.
///
/// Failure to issue a requested id is signalled by returning [HostId::NONE] rather than an
///  error: callers are real-time loops that treat it as 'try again / reject the connection'.
pub trait HostIdFactory: Send + Sync + 'static {
    /// `requested` is only honored by policies that support externally assigned ids; pass
    ///  [HostId::NONE] otherwise.
    fn create(&mut self, now: Instant, requested: HostId) -> HostId;

    fn drop_id(&mut self, now: Instant, id: HostId);

    /// number of times `id` was re-issued after having been dropped - diagnostics only
    fn recycle_count(&self, id: HostId) -> u32;
}

pub fn new_host_id_factory(config: &NetConfig) -> Box<dyn HostIdFactory> {
    let last = config.host_id_reserved_last;
    match config.host_id_policy {
        HostIdPolicy::Monotonic => Box::new(MonotonicHostIdFactory::new(last)),
        HostIdPolicy::RecycleWithCooldown { issue_valid_time } => Box::new(RecycleHostIdFactory::new(last, issue_valid_time)),
        HostIdPolicy::Assigned => Box::new(AssignedHostIdFactory::new(last)),
    }
}

/// shared by all policies: advance a fresh-id counter past the reserved range, wrapping around
///  at `u32::MAX`. Returns [HostId::NONE] if the reserved range leaves no id.
pub(crate) fn next_fresh_id(counter: &mut u32, reserved_last: HostId) -> HostId {
    *counter = counter.wrapping_add(1);
    if *counter <= reserved_last.0 {
        match reserved_last.0.checked_add(1) {
            Some(first) => *counter = first,
            None => return HostId::NONE,
        }
    }
    HostId(*counter)
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::none(HostId::NONE, "HostId(none)")]
    #[case::server(HostId::SERVER, "HostId(server)")]
    #[case::regular(HostId(4711), "HostId(4711)")]
    fn test_host_id_debug(#[case] id: HostId, #[case] expected: &str) {
        assert_eq!(format!("{:?}", id), expected);
    }

    #[rstest]
    #[case::start(0, 100, 101)]
    #[case::regular(101, 100, 102)]
    #[case::wrap(u32::MAX, 100, 101)]
    fn test_next_fresh_id(#[case] mut counter: u32, #[case] last: u32, #[case] expected: u32) {
        assert_eq!(next_fresh_id(&mut counter, HostId(last)), HostId(expected));
        assert_eq!(counter, expected);
    }

    #[rstest]
    #[case::monotonic(HostIdPolicy::Monotonic)]
    #[case::recycle(HostIdPolicy::RecycleWithCooldown { issue_valid_time: Duration::from_secs(5) })]
    #[case::assigned(HostIdPolicy::Assigned)]
    fn test_fully_reserved_range_issues_nothing(#[case] policy: HostIdPolicy) {
        let mut counter = u32::MAX;
        assert_eq!(next_fresh_id(&mut counter, HostId(u32::MAX)), HostId::NONE);

        let mut config = NetConfig::new();
        config.host_id_reserved_last = HostId(u32::MAX);
        config.host_id_policy = policy;
        let mut factory = new_host_id_factory(&config);
        let now = Instant::now();
        assert_eq!(factory.create(now, HostId::NONE), HostId::NONE);
        assert_eq!(factory.create(now, HostId::NONE), HostId::NONE);
    }

    #[test]
    fn test_factory_from_config() {
        let mut config = NetConfig::new();
        config.host_id_reserved_last = HostId(100);
        config.host_id_policy = HostIdPolicy::RecycleWithCooldown { issue_valid_time: Duration::from_secs(5) };

        let mut factory = new_host_id_factory(&config);
        let now = Instant::now();
        let id = factory.create(now, HostId::NONE);
        assert_eq!(id, HostId(101));
        factory.drop_id(now, id);
        assert_eq!(factory.create(now + Duration::from_secs(6), HostId::NONE), HostId(101));
        assert_eq!(factory.recycle_count(id), 1);
    }
}
