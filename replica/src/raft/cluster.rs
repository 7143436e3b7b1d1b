//! Cluster membership
//!
//! Membership is a value: every change produces a new `Membership` which is
//! written to the log as a CONFIG entry and takes effect once applied.

use std::collections::BTreeMap;

use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

/// Unique id of a cluster member.
pub type MemberId = u64;

/// Whether a member votes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberRole {
    /// Replicates and votes.
    Active,
    /// Replicates only.
    #[default]
    Passive,
}

/// A cluster member.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Getters, CopyGetters,
)]
pub struct Member {
    #[getset(get_copy = "pub")]
    id: MemberId,
    #[getset(get = "pub")]
    address: String,
    #[getset(get_copy = "pub")]
    role: MemberRole,
}

impl Member {
    pub fn new(id: MemberId, address: impl Into<String>, role: MemberRole) -> Self {
        Member {
            id,
            address: address.into(),
            role,
        }
    }

    pub fn active(id: MemberId, address: impl Into<String>) -> Self {
        Self::new(id, address, MemberRole::Active)
    }

    pub fn passive(id: MemberId, address: impl Into<String>) -> Self {
        Self::new(id, address, MemberRole::Passive)
    }

    pub fn is_active(&self) -> bool {
        self.role == MemberRole::Active
    }
}

/// The set of members known to the cluster, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Membership {
    members: BTreeMap<MemberId, Member>,
}

impl Membership {
    pub fn new(members: impl IntoIterator<Item = Member>) -> Self {
        Membership {
            members: members.into_iter().map(|m| (m.id(), m)).collect(),
        }
    }

    pub fn get(&self, id: MemberId) -> Option<&Member> {
        self.members.get(&id)
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn is_active(&self, id: MemberId) -> bool {
        self.get(id).map(Member::is_active).unwrap_or(false)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Voting members.
    pub fn active(&self) -> impl Iterator<Item = &Member> {
        self.members.values().filter(|m| m.is_active())
    }

    /// Replicating, non-voting members.
    pub fn passive(&self) -> impl Iterator<Item = &Member> {
        self.members.values().filter(|m| !m.is_active())
    }

    pub fn active_ids(&self) -> Vec<MemberId> {
        self.active().map(Member::id).collect()
    }

    /// Number of votes that makes a strict majority of the active members.
    pub fn quorum(&self) -> usize {
        self.active().count() / 2 + 1
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Adds `member` as a passive member.
    pub fn join(&self, member: &Member) -> Membership {
        let mut next = self.clone();
        let member = Member::passive(member.id(), member.address().clone());
        next.members.insert(member.id(), member);
        next
    }

    /// Marks `id` active. Returns `None` if `id` is not a member.
    pub fn promote(&self, id: MemberId) -> Option<Membership> {
        let mut next = self.clone();
        let member = next.members.get_mut(&id)?;
        member.role = MemberRole::Active;
        Some(next)
    }

    pub fn leave(&self, id: MemberId) -> Membership {
        let mut next = self.clone();
        next.members.remove(&id);
        next
    }

    pub fn to_vec(&self) -> Vec<Member> {
        self.members.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three() -> Membership {
        Membership::new(vec![
            Member::active(1, "n1"),
            Member::active(2, "n2"),
            Member::active(3, "n3"),
        ])
    }

    #[test]
    fn test_quorum() {
        assert_eq!(three().quorum(), 2);
        assert_eq!(Membership::new(vec![Member::active(1, "n1")]).quorum(), 1);
        let five = Membership::new((1..=5).map(|i| Member::active(i, format!("n{}", i))));
        assert_eq!(five.quorum(), 3);
    }

    #[test]
    fn test_passive_members_do_not_count() {
        let m = three().join(&Member::active(4, "n4"));
        assert_eq!(m.quorum(), 2);
        assert!(!m.is_active(4));
        assert_eq!(m.passive().count(), 1);
    }

    #[test]
    fn test_promote_and_leave() {
        let m = three().join(&Member::passive(4, "n4"));
        let m = m.promote(4).unwrap();
        assert!(m.is_active(4));
        assert_eq!(m.quorum(), 3);

        let m = m.leave(1);
        assert!(!m.contains(1));
        assert_eq!(m.active_ids(), vec![2, 3, 4]);
        assert!(m.promote(9).is_none());
    }
}
