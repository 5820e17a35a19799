//! Deterministic leader election: the online, non-standby member with the
//! smallest node-id leads. Node-id is the sole tiebreaker.

use std::collections::HashSet;

use serde::Serialize;

use super::MemberInfo;

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ElectionResult {
    pub leader_id: u32,
    pub leader_name: String,
    pub is_local_leader: bool,
    pub online_members: Vec<MemberInfo>,
    pub quorate: bool,
}

/// Pure election function. Returns `None` when quorum is required but
/// absent, or when no online non-standby member exists.
pub fn elect(
    members: &[MemberInfo],
    local_node_id: u32,
    standby: &HashSet<String>,
    require_quorum: bool,
    quorate: bool,
) -> Option<ElectionResult> {
    if require_quorum && !quorate {
        return None;
    }
    let mut eligible: Vec<MemberInfo> = members
        .iter()
        .filter(|m| m.online && !standby.contains(&m.name))
        .cloned()
        .collect();
    if eligible.is_empty() {
        return None;
    }
    eligible.sort_by_key(|m| m.node_id);
    let leader = eligible[0].clone();
    Some(ElectionResult {
        leader_id: leader.node_id,
        is_local_leader: leader.node_id == local_node_id,
        leader_name: leader.name,
        online_members: eligible,
        quorate,
    })
}

/// Memoises the last election outcome and reports only the edges.
#[derive(Default)]
pub struct ElectionTracker {
    last: Option<(bool, String)>,
}

/// Emitted when leadership moves, locally or remotely.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderChange {
    pub is_local: bool,
    pub leader_name: Option<String>,
}

impl ElectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the latest election outcome; returns a change event exactly
    /// when `is_local` or the leader name differs from the previous one.
    pub fn observe(&mut self, result: Option<&ElectionResult>) -> Option<LeaderChange> {
        let current = result.map(|r| (r.is_local_leader, r.leader_name.clone()));
        if current == self.last {
            return None;
        }
        self.last = current.clone();
        Some(match current {
            Some((is_local, name)) => LeaderChange {
                is_local,
                leader_name: Some(name),
            },
            None => LeaderChange {
                is_local: false,
                leader_name: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(node_id: u32, name: &str, online: bool) -> MemberInfo {
        MemberInfo {
            node_id,
            name: name.to_string(),
            overlay_ip: format!("10.99.0.{node_id}"),
            online,
        }
    }

    fn no_standby() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn smallest_node_id_wins() {
        let members = vec![
            member(3, "ns3", true),
            member(1, "ns1", true),
            member(2, "ns2", true),
        ];
        let result = elect(&members, 2, &no_standby(), true, true).unwrap();
        assert_eq!(result.leader_id, 1);
        assert_eq!(result.leader_name, "ns1");
        assert!(!result.is_local_leader);
        assert_eq!(
            result.online_members.iter().map(|m| m.node_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn offline_members_are_skipped() {
        let members = vec![member(1, "ns1", false), member(2, "ns2", true)];
        let result = elect(&members, 2, &no_standby(), true, true).unwrap();
        assert_eq!(result.leader_name, "ns2");
        assert!(result.is_local_leader);
    }

    #[test]
    fn standby_blocks_leadership() {
        let members = vec![member(1, "ns1", true), member(2, "ns2", true)];
        let standby: HashSet<String> = ["ns1".to_string()].into_iter().collect();
        let result = elect(&members, 1, &standby, true, true).unwrap();
        assert_eq!(result.leader_name, "ns2");
        assert!(!result.is_local_leader);
    }

    #[test]
    fn no_quorum_means_no_leader() {
        let members = vec![member(1, "ns1", true)];
        assert!(elect(&members, 1, &no_standby(), true, false).is_none());
        // ... unless quorum is not required.
        assert!(elect(&members, 1, &no_standby(), false, false).is_some());
    }

    #[test]
    fn empty_eligible_set_means_no_leader() {
        let members = vec![member(1, "ns1", false), member(2, "ns2", false)];
        assert!(elect(&members, 1, &no_standby(), true, true).is_none());
    }

    #[test]
    fn tracker_emits_only_edges() {
        let members = vec![member(1, "ns1", true), member(2, "ns2", true)];
        let mut tracker = ElectionTracker::new();

        let first = elect(&members, 1, &no_standby(), true, true);
        let change = tracker.observe(first.as_ref()).unwrap();
        assert!(change.is_local);
        assert_eq!(change.leader_name.as_deref(), Some("ns1"));

        // Same outcome: no event.
        assert!(tracker.observe(first.as_ref()).is_none());

        // ns1 goes away: leadership moves.
        let members = vec![member(1, "ns1", false), member(2, "ns2", true)];
        let second = elect(&members, 1, &no_standby(), true, true);
        let change = tracker.observe(second.as_ref()).unwrap();
        assert!(!change.is_local);
        assert_eq!(change.leader_name.as_deref(), Some("ns2"));

        // Election collapses entirely.
        let change = tracker.observe(None).unwrap();
        assert_eq!(change.leader_name, None);
    }
}
