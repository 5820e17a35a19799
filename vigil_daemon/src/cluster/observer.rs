//! Periodic membership/quorum sampling with edge detection.
//!
//! Snapshots are published latest-wins through a watch channel so a slow
//! supervisor tick never queues stale polls behind fresh ones; the rare
//! edge events go through an unbounded channel and keep observation order
//! per node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ClusterSnapshot;
use super::corosync::MembershipSource;

/// Edge events derived from consecutive snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObserverEvent {
    NodeStateChange {
        name: String,
        online: bool,
        previous_online: bool,
    },
    QuorumChange {
        quorate: bool,
    },
}

pub struct ClusterObserver {
    source: Arc<dyn MembershipSource>,
    local_name: String,
    task: Option<JoinHandle<()>>,
    snapshot_tx: watch::Sender<Option<ClusterSnapshot>>,
    event_tx: mpsc::UnboundedSender<ObserverEvent>,
}

pub struct ObserverChannels {
    pub snapshots: watch::Receiver<Option<ClusterSnapshot>>,
    pub events: mpsc::UnboundedReceiver<ObserverEvent>,
}

impl ClusterObserver {
    pub fn new(source: Arc<dyn MembershipSource>, local_name: String) -> (Self, ObserverChannels) {
        let (snapshot_tx, snapshots) = watch::channel(None);
        let (event_tx, events) = mpsc::unbounded_channel();
        (
            Self {
                source,
                local_name,
                task: None,
                snapshot_tx,
                event_tx,
            },
            ObserverChannels { snapshots, events },
        )
    }

    /// Begin sampling at `interval`. Idempotent; a second call is a no-op.
    pub fn start(&mut self, interval: Duration) {
        if self.task.is_some() {
            return;
        }
        let source = Arc::clone(&self.source);
        let local_name = self.local_name.clone();
        let snapshot_tx = self.snapshot_tx.clone();
        let event_tx = self.event_tx.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut previous: Option<ClusterSnapshot> = None;
            loop {
                ticker.tick().await;
                let snapshot = match source.sample().await {
                    Ok(snapshot) => snapshot,
                    Err(error) => {
                        warn!(%error, "membership probe failed, treating peers as offline");
                        match &previous {
                            Some(prev) => prev.degraded(&local_name),
                            None => ClusterSnapshot {
                                quorate: false,
                                expected_votes: 0,
                                total_votes: 0,
                                members: Vec::new(),
                            },
                        }
                    }
                };
                for event in diff(previous.as_ref(), &snapshot) {
                    if event_tx.send(event).is_err() {
                        return;
                    }
                }
                previous = Some(snapshot.clone());
                if snapshot_tx.send(Some(snapshot)).is_err() {
                    return;
                }
            }
        }));
        debug!("cluster observer started");
    }

    /// Stop sampling. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("cluster observer stopped");
        }
    }
}

impl Drop for ClusterObserver {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Edge events between two consecutive snapshots. Nodes appearing for the
/// first time count as transitions from `online = false`; no event is ever
/// produced with `previous_online == online`.
fn diff(previous: Option<&ClusterSnapshot>, current: &ClusterSnapshot) -> Vec<ObserverEvent> {
    let mut events = Vec::new();
    let previous_online: HashMap<&str, bool> = previous
        .map(|p| {
            p.members
                .iter()
                .map(|m| (m.name.as_str(), m.online))
                .collect()
        })
        .unwrap_or_default();

    for member in &current.members {
        let was = previous_online
            .get(member.name.as_str())
            .copied()
            .unwrap_or(false);
        if was != member.online {
            events.push(ObserverEvent::NodeStateChange {
                name: member.name.clone(),
                online: member.online,
                previous_online: was,
            });
        }
    }

    let was_quorate = previous.map(|p| p.quorate);
    if was_quorate != Some(current.quorate) {
        events.push(ObserverEvent::QuorumChange {
            quorate: current.quorate,
        });
    }
    events
}
