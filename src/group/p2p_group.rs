use std::collections::BTreeMap;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::host_id::HostId;

/// What a group member entry resolves to when sending
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MemberKind {
    Local,
    Server,
    Peer,
}

#[derive(Debug, Clone)]
pub struct P2PGroup {
    id: HostId,
    custom: Bytes,
    members: BTreeMap<HostId, MemberKind>,
    /// sorted member ids, kept in sync with `members` for cheap slice access during relay
    ///  list expansion
    member_ids: Vec<HostId>,
}

impl P2PGroup {
    pub fn new(id: HostId, custom: Bytes) -> P2PGroup {
        P2PGroup {
            id,
            custom,
            members: BTreeMap::default(),
            member_ids: Vec::new(),
        }
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn custom(&self) -> &Bytes {
        &self.custom
    }

    pub fn contains(&self, member: HostId) -> bool {
        self.members.contains_key(&member)
    }

    pub fn kind_of(&self, member: HostId) -> Option<MemberKind> {
        self.members.get(&member).copied()
    }

    pub fn members(&self) -> impl Iterator<Item = (HostId, MemberKind)> + '_ {
        self.members.iter().map(|(id, kind)| (*id, *kind))
    }

    pub fn member_ids(&self) -> &[HostId] {
        &self.member_ids
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn add(&mut self, member: HostId, kind: MemberKind) -> bool {
        if self.members.insert(member, kind).is_some() {
            return false;
        }
        self.member_ids = self.members.keys().copied().collect();
        true
    }

    fn remove(&mut self, member: HostId) -> bool {
        if self.members.remove(&member).is_none() {
            return false;
        }
        self.member_ids = self.members.keys().copied().collect();
        true
    }
}

/// All P2P groups known locally. On the server this is authoritative; on a client it mirrors
///  join / leave notifications in the order they arrive.
#[derive(Default, Debug)]
pub struct GroupTable {
    groups: FxHashMap<HostId, P2PGroup>,
}

impl GroupTable {
    pub fn new() -> GroupTable {
        GroupTable::default()
    }

    pub fn get(&self, group: HostId) -> Option<&P2PGroup> {
        self.groups.get(&group)
    }

    pub fn contains(&self, group: HostId) -> bool {
        self.groups.contains_key(&group)
    }

    pub fn iter(&self) -> impl Iterator<Item = &P2PGroup> {
        self.groups.values()
    }

    pub fn create(&mut self, group: HostId, custom: Bytes) -> &mut P2PGroup {
        self.groups.entry(group)
            .or_insert_with(|| P2PGroup::new(group, custom))
    }

    /// Adds a member, creating the group if necessary. Returns `false` if it was a member already.
    pub fn add_member(&mut self, group: HostId, member: HostId, kind: MemberKind) -> bool {
        let added = self.create(group, Bytes::new())
            .add(member, kind);
        if added {
            debug!("{:?} joined group {:?}", member, group);
        }
        added
    }

    /// Removes a member; a client-side group without members disappears.
    pub fn remove_member(&mut self, group: HostId, member: HostId) -> bool {
        let Some(g) = self.groups.get_mut(&group) else {
            return false;
        };
        let removed = g.remove(member);
        if removed {
            debug!("{:?} left group {:?}", member, group);
        }
        removed
    }

    pub fn remove_group(&mut self, group: HostId) -> Option<P2PGroup> {
        self.groups.remove(&group)
    }

    pub fn remove_empty(&mut self, group: HostId) {
        if self.groups.get(&group).map(|g| g.is_empty()).unwrap_or(false) {
            self.groups.remove(&group);
        }
    }

    /// groups containing `member`, sorted
    pub fn groups_of(&self, member: HostId) -> Vec<HostId> {
        let mut result = self.groups.values()
            .filter(|g| g.contains(member))
            .map(|g| g.id)
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    pub fn shares_any_group(&self, a: HostId, b: HostId) -> bool {
        self.groups.values()
            .any(|g| g.contains(a) && g.contains(b))
    }

    pub fn member_ids(&self, group: HostId) -> Option<&[HostId]> {
        self.groups.get(&group).map(|g| g.member_ids())
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}
