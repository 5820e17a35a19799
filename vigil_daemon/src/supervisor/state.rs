//! The node state machine and the runtime state owned exclusively by the
//! supervisor task.

use std::collections::HashMap;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Where the node is in its lifecycle. Transitions are logged at info.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NodePhase {
    Initializing,
    WaitingQuorum,
    Follower,
    Leader,
    Standby,
    Stopping,
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            NodePhase::Initializing => "initializing",
            NodePhase::WaitingQuorum => "waiting-quorum",
            NodePhase::Follower => "follower",
            NodePhase::Leader => "leader",
            NodePhase::Standby => "standby",
            NodePhase::Stopping => "stopping",
        };
        write!(f, "{text}")
    }
}

/// A fence timer that can still be cancelled.
pub struct PendingFence {
    pub timer: JoinHandle<()>,
    pub reason: String,
    pub scheduled_at: Instant,
}

/// Mutated only from the supervisor loop.
pub struct NodeRuntime {
    pub phase: NodePhase,
    pub is_leader: bool,
    pub in_standby: bool,
    pub grace_until: Instant,
    /// Consecutive polls in which no VIP was observed anywhere while the
    /// election would make this node leader.
    pub polls_without_vip: u32,
    /// Consecutive polls each absent peer has been seen offline.
    pub dead_node_polls: HashMap<String, u32>,
    pub pending_fences: HashMap<String, PendingFence>,
    /// Set while a promotion is debouncing (`failoverDelayMs`).
    pub promote_at: Option<Instant>,
    /// Set after a `failover` command; suppresses local leadership until
    /// another node takes over or the hold expires.
    pub failover_hold_until: Option<Instant>,
}

impl NodeRuntime {
    pub fn new(grace_until: Instant) -> Self {
        Self {
            phase: NodePhase::Initializing,
            is_leader: false,
            in_standby: false,
            grace_until,
            polls_without_vip: 0,
            dead_node_polls: HashMap::new(),
            pending_fences: HashMap::new(),
            promote_at: None,
            failover_hold_until: None,
        }
    }

    pub fn in_startup_grace(&self) -> bool {
        Instant::now() < self.grace_until
    }

    pub fn in_failover_hold(&self) -> bool {
        self.failover_hold_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    /// Cancel one pending fence timer, if present.
    pub fn cancel_fence(&mut self, name: &str) -> bool {
        match self.pending_fences.remove(name) {
            Some(pending) => {
                pending.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending fence timer (graceful stop).
    pub fn cancel_all_fences(&mut self) -> Vec<String> {
        let names: Vec<String> = self.pending_fences.keys().cloned().collect();
        for (_, pending) in self.pending_fences.drain() {
            pending.timer.abort();
        }
        names
    }
}
