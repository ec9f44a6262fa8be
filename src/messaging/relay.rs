use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use rustc_hash::FxHashSet;

use crate::host_id::HostId;
use crate::util::buf::{put_host_id, try_get_host_id};

/// Limits decoding effort for relay lists from untrusted datagrams
const MAX_RELAY_LIST_ENTRIES: usize = 1024;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GroupRelay {
    pub group: HostId,
    pub excluded: Vec<HostId>,
}

/// A compressed destination list for server-relayed unreliable messages: a set of groups, each
///  with members to exclude (typically the ones the sender already reached directly), plus
///  individually listed peers.
///
/// The server expands the list and sends the payload to each resulting host at most once.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct RelayList {
    pub groups: Vec<GroupRelay>,
    pub peers: Vec<HostId>,
}

impl RelayList {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.peers.is_empty()
    }

    /// Builds a relay list that covers exactly `targets`. A group is used as a shorthand if it
    ///  covers more targets than it needs exclusions; remaining targets are listed individually.
    pub fn compress<'a>(targets: &FxHashSet<HostId>, candidate_groups: impl IntoIterator<Item = (HostId, &'a [HostId])>) -> RelayList {
        let mut uncovered = targets.clone();
        let mut groups = Vec::new();

        for (group, members) in candidate_groups {
            let covered = members.iter()
                .filter(|m| uncovered.contains(m))
                .count();
            let excluded = members.iter()
                .filter(|m| !targets.contains(m))
                .copied()
                .collect::<Vec<_>>();

            // a member that is a target but already covered by a previous group must be
            //  excluded as well, or it would receive the payload twice
            let already_covered = members.iter()
                .filter(|m| targets.contains(m) && !uncovered.contains(m))
                .count();

            if covered > excluded.len() + already_covered {
                let mut excluded = excluded;
                excluded.extend(members.iter().filter(|m| targets.contains(m) && !uncovered.contains(m)));
                excluded.sort();

                for m in members {
                    uncovered.remove(m);
                }
                groups.push(GroupRelay { group, excluded });
            }
        }

        let mut peers = uncovered.into_iter().collect::<Vec<_>>();
        peers.sort();
        RelayList { groups, peers }
    }

    /// Resolves the list to individual hosts, excluding `sender`. `group_members` returns
    ///  `None` for groups that do not exist (any more), which are skipped.
    pub fn expand<'a>(&self, sender: HostId, group_members: impl Fn(HostId) -> Option<&'a [HostId]>) -> Vec<HostId> {
        let mut result = FxHashSet::default();

        for g in &self.groups {
            if let Some(members) = group_members(g.group) {
                for m in members {
                    if !g.excluded.contains(m) {
                        result.insert(*m);
                    }
                }
            }
        }
        result.extend(self.peers.iter().copied());
        result.remove(&sender);
        result.remove(&HostId::NONE);

        let mut result = result.into_iter().collect::<Vec<_>>();
        result.sort();
        result
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_usize_varint(self.groups.len());
        for g in &self.groups {
            put_host_id(buf, g.group);
            buf.put_usize_varint(g.excluded.len());
            for &e in &g.excluded {
                put_host_id(buf, e);
            }
        }
        buf.put_usize_varint(self.peers.len());
        for &p in &self.peers {
            put_host_id(buf, p);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<RelayList> {
        let num_groups = buf.try_get_usize_varint()?;
        if num_groups > MAX_RELAY_LIST_ENTRIES {
            bail!("relay list with {} groups", num_groups);
        }
        let mut groups = Vec::with_capacity(num_groups);
        for _ in 0..num_groups {
            let group = try_get_host_id(buf)?;
            let num_excluded = buf.try_get_usize_varint()?;
            if num_excluded > MAX_RELAY_LIST_ENTRIES {
                bail!("relay list with {} exclusions", num_excluded);
            }
            let mut excluded = Vec::with_capacity(num_excluded);
            for _ in 0..num_excluded {
                excluded.push(try_get_host_id(buf)?);
            }
            groups.push(GroupRelay { group, excluded });
        }

        let num_peers = buf.try_get_usize_varint()?;
        if num_peers > MAX_RELAY_LIST_ENTRIES {
            bail!("relay list with {} peers", num_peers);
        }
        let mut peers = Vec::with_capacity(num_peers);
        for _ in 0..num_peers {
            peers.push(try_get_host_id(buf)?);
        }

        Ok(RelayList { groups, peers })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn ids(raw: &[u32]) -> Vec<HostId> {
        raw.iter().map(|&n| HostId(n)).collect()
    }

    fn set(raw: &[u32]) -> FxHashSet<HostId> {
        raw.iter().map(|&n| HostId(n)).collect()
    }

    #[rstest]
    #[case::whole_group(&[11, 12, 13, 14], &[10, 11, 12, 13, 14], vec![GroupRelay { group: HostId(50), excluded: ids(&[10]) }], vec![])]
    #[case::some_direct(&[13, 14, 15], &[10, 11, 12, 13, 14, 15], vec![], ids(&[13, 14, 15]))]
    #[case::mostly_relayed(&[12, 13, 14, 15], &[10, 11, 12, 13, 14, 15], vec![GroupRelay { group: HostId(50), excluded: ids(&[10, 11]) }], vec![])]
    #[case::outside_group(&[11, 12, 13, 99], &[10, 11, 12, 13], vec![GroupRelay { group: HostId(50), excluded: ids(&[10]) }], ids(&[99]))]
    fn test_compress(#[case] targets: &[u32], #[case] members: &[u32], #[case] expected_groups: Vec<GroupRelay>, #[case] expected_peers: Vec<HostId>) {
        let members = ids(members);
        let list = RelayList::compress(&set(targets), [(HostId(50), members.as_slice())]);
        assert_eq!(list.groups, expected_groups);
        assert_eq!(list.peers, expected_peers);
    }

    #[test]
    fn test_compress_then_expand_reaches_every_target_once() {
        let g1 = ids(&[10, 11, 12, 13]);
        let g2 = ids(&[10, 12, 13, 14, 15]);
        let targets = set(&[11, 12, 13, 14, 15]);

        let list = RelayList::compress(&targets, [(HostId(50), g1.as_slice()), (HostId(51), g2.as_slice())]);

        let expanded = list.expand(HostId(10), |g| match g {
            HostId(50) => Some(g1.as_slice()),
            HostId(51) => Some(g2.as_slice()),
            _ => None,
        });
        assert_eq!(expanded, ids(&[11, 12, 13, 14, 15]));
    }

    #[test]
    fn test_expand_skips_sender_and_unknown_groups() {
        let list = RelayList {
            groups: vec![
                GroupRelay { group: HostId(50), excluded: ids(&[12]) },
                GroupRelay { group: HostId(77), excluded: vec![] },
            ],
            peers: ids(&[11, 20]),
        };
        let members = ids(&[10, 11, 12]);
        let expanded = list.expand(HostId(10), |g| if g == HostId(50) { Some(members.as_slice()) } else { None });
        assert_eq!(expanded, ids(&[11, 20]));
    }

    #[test]
    fn test_deser_rejects_huge_counts() {
        let mut buf = bytes::BytesMut::new();
        buf.put_usize_varint(1_000_000);
        assert!(RelayList::deser(&mut buf.freeze()).is_err());
    }
}
