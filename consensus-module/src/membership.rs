//! `ClusterMember` and the member table (spec.md §3, §4.1).

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::quorum;
use crate::LogPosition;
use crate::NodeId;

/// Endpoints a member advertises for each of its roles (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEndpoints {
    pub consensus: String,
    pub log: String,
    pub ingress: String,
    pub catchup: String,
    pub archive: String,
}

/// Per-follower replication bookkeeping kept by the leader, plus the
/// identity fields shared by every member (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: NodeId,
    pub endpoints: MemberEndpoints,

    /// Furthest position this member is known to have durably appended.
    pub log_position: LogPosition,

    /// Clock reading (ns) of the last `AppendPosition` received from this
    /// member; used for leader-side failure detection.
    pub time_of_last_append_position_ns: u64,

    /// Set while this member is replaying the leader's archive during
    /// catch-up.
    pub catchup_replay_session_id: Option<i64>,

    pub is_leader: bool,

    /// Set once a `MembershipChange{QUIT}` for this member has been
    /// appended; the member is dropped once commit position passes it
    /// (spec.md §3 Lifecycle).
    pub removal_position: Option<LogPosition>,
}

impl ClusterMember {
    pub fn new(id: NodeId, endpoints: MemberEndpoints) -> Self {
        Self {
            id,
            endpoints,
            log_position: 0,
            time_of_last_append_position_ns: 0,
            catchup_replay_session_id: None,
            is_leader: false,
            removal_position: None,
        }
    }
}

/// The set of cluster members, partitioned into `active` and `passive`
/// (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct ClusterMemberTable {
    active: BTreeMap<NodeId, ClusterMember>,
    passive: BTreeMap<NodeId, ClusterMember>,
}

impl ClusterMemberTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_active(&mut self, member: ClusterMember) {
        self.active.insert(member.id, member);
    }

    pub fn add_passive(&mut self, member: ClusterMember) {
        self.passive.insert(member.id, member);
    }

    pub fn active(&self) -> impl Iterator<Item = &ClusterMember> {
        self.active.values()
    }

    pub fn active_mut(&mut self) -> impl Iterator<Item = &mut ClusterMember> {
        self.active.values_mut()
    }

    pub fn passive(&self) -> impl Iterator<Item = &ClusterMember> {
        self.passive.values()
    }

    pub fn get(&self, id: NodeId) -> Option<&ClusterMember> {
        self.active.get(&id).or_else(|| self.passive.get(&id))
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut ClusterMember> {
        match self.active.get_mut(&id) {
            Some(m) => Some(m),
            None => self.passive.get_mut(&id),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Promote a passive member that just committed `MembershipChange{JOIN}`
    /// into the active set.
    pub fn promote_to_active(&mut self, id: NodeId) {
        if let Some(m) = self.passive.remove(&id) {
            self.active.insert(id, m);
        }
    }

    /// Remove a member whose `MembershipChange{QUIT}` committed, once the
    /// commit index has passed its `removal_position` (spec.md §3).
    pub fn remove_if_past_commit(&mut self, commit_position: LogPosition) -> Vec<NodeId> {
        let mut removed = Vec::new();
        self.active.retain(|id, m| {
            let keep = match m.removal_position {
                Some(p) if commit_position >= p => false,
                _ => true,
            };
            if !keep {
                removed.push(*id);
            }
            keep
        });
        removed
    }

    /// `⌊N/2⌋+1` of active members (spec.md §3).
    pub fn quorum_threshold(&self) -> usize {
        quorum::threshold(self.active.len())
    }

    /// Number of active members whose `AppendPosition` was seen within
    /// `heartbeat_timeout_ns` of `now_ns` (spec.md §4.1 failure detection).
    pub fn responsive_follower_count(&self, now_ns: u64, heartbeat_timeout_ns: u64) -> usize {
        self.active
            .values()
            .filter(|m| now_ns.saturating_sub(m.time_of_last_append_position_ns) <= heartbeat_timeout_ns)
            .count()
    }

    /// The position such that a quorum of active members has appended at
    /// least that far (spec.md §4.1, `commitPosition = min(quorumPosition(active),
    /// localAppendPosition)`).
    pub fn quorum_position(&self, leader_id: NodeId, leader_position: LogPosition) -> LogPosition {
        let positions = self
            .active
            .values()
            .map(|m| if m.id == leader_id { leader_position } else { m.log_position })
            .collect::<Vec<_>>();
        quorum::quorum_position(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(tag: &str) -> MemberEndpoints {
        MemberEndpoints {
            consensus: format!("consensus-{tag}"),
            log: format!("log-{tag}"),
            ingress: format!("ingress-{tag}"),
            catchup: format!("catchup-{tag}"),
            archive: format!("archive-{tag}"),
        }
    }

    #[test]
    fn quorum_threshold_tracks_active_membership() {
        let mut table = ClusterMemberTable::new();
        for id in 0..3 {
            table.add_active(ClusterMember::new(id, endpoints(&id.to_string())));
        }
        assert_eq!(table.quorum_threshold(), 2);
    }

    #[test]
    fn members_removed_only_after_commit_passes_removal_position() {
        let mut table = ClusterMemberTable::new();
        table.add_active(ClusterMember::new(1, endpoints("1")));
        table.get_mut(1).unwrap().removal_position = Some(100);

        assert!(table.remove_if_past_commit(50).is_empty());
        assert!(table.get(1).is_some());

        let removed = table.remove_if_past_commit(100);
        assert_eq!(removed, vec![1]);
        assert!(table.get(1).is_none());
    }

    #[test]
    fn quorum_position_counts_leader_as_its_own_local_position() {
        let mut table = ClusterMemberTable::new();
        table.add_active(ClusterMember::new(1, endpoints("1")));
        table.add_active(ClusterMember::new(2, endpoints("2")));
        table.add_active(ClusterMember::new(3, endpoints("3")));
        table.get_mut(2).unwrap().log_position = 50;
        table.get_mut(3).unwrap().log_position = 80;

        // Leader is member 1, whose local position (100) is passed in, not its stale table entry (0).
        assert_eq!(table.quorum_position(1, 100), 80);
    }
}
