//! Membership and quorum observation, plus leader election.

pub mod corosync;
pub mod election;
pub mod observer;

use serde::{Deserialize, Serialize};

/// One cluster member as seen on an observation tick. Members that are
/// configured but not currently seen by the group-comms layer appear with
/// `online = false`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub node_id: u32,
    pub name: String,
    pub overlay_ip: String,
    pub online: bool,
}

/// Immutable value emitted once per observation tick.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub quorate: bool,
    pub expected_votes: u32,
    pub total_votes: u32,
    pub members: Vec<MemberInfo>,
}

impl ClusterSnapshot {
    pub fn member(&self, name: &str) -> Option<&MemberInfo> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn online_names(&self) -> impl Iterator<Item = &str> {
        self.members
            .iter()
            .filter(|m| m.online)
            .map(|m| m.name.as_str())
    }

    /// A copy of this snapshot with every member except `local` marked
    /// offline and quorum cleared. Used when the membership probe fails.
    pub fn degraded(&self, local: &str) -> ClusterSnapshot {
        ClusterSnapshot {
            quorate: false,
            expected_votes: self.expected_votes,
            total_votes: 0,
            members: self
                .members
                .iter()
                .map(|m| MemberInfo {
                    online: m.name == local && m.online,
                    ..m.clone()
                })
                .collect(),
        }
    }
}
