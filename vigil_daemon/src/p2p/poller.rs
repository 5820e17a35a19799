//! Polls `/state` on every online peer and reports standby/leadership
//! flips and reachability loss to the supervisor.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use vigil_protocol::p2p::PeerState;

use super::PlaneEvent;
use super::client;
use super::http::Request;
use super::server::PlaneContext;
use crate::cluster::ClusterSnapshot;

pub struct PeerPoller {
    task: Option<JoinHandle<()>>,
}

impl PeerPoller {
    pub fn start(
        ctx: Arc<PlaneContext>,
        mut snapshots: watch::Receiver<Option<ClusterSnapshot>>,
        poll_interval: Duration,
        events: mpsc::UnboundedSender<PlaneEvent>,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // `None` marks a peer we failed to reach on the last poll.
            let mut known: HashMap<String, Option<PeerState>> = HashMap::new();
            loop {
                ticker.tick().await;
                let members: Vec<(String, String)> = match snapshots.borrow_and_update().as_ref() {
                    Some(snapshot) => snapshot
                        .members
                        .iter()
                        .filter(|m| m.online && m.name != ctx.local_name)
                        .map(|m| (m.name.clone(), m.overlay_ip.clone()))
                        .collect(),
                    None => continue,
                };
                known.retain(|name, _| members.iter().any(|(n, _)| n == name));

                for (name, overlay_ip) in members {
                    let Ok(ip) = overlay_ip.parse::<IpAddr>() else {
                        continue;
                    };
                    let addr = SocketAddr::new(ip, ctx.p2p_port);
                    let fetched =
                        client::fetch(addr, Request::get("/state"), ctx.request_timeout).await;
                    match fetched.ok().filter(|r| r.is_success()).and_then(|r| r.json_body::<PeerState>().ok()) {
                        Some(state) => {
                            let previous = known.insert(name.clone(), Some(state.clone()));
                            ctx.peer_states
                                .lock()
                                .unwrap()
                                .insert(name.clone(), state.clone());
                            let flipped = match previous {
                                Some(Some(prev)) => {
                                    prev.standby != state.standby
                                        || prev.is_leader != state.is_leader
                                }
                                // First contact and regained contact both count.
                                _ => true,
                            };
                            if flipped
                                && events
                                    .send(PlaneEvent::PeerFlipped { name, state })
                                    .is_err()
                            {
                                return;
                            }
                        }
                        None => {
                            let was_reachable =
                                matches!(known.insert(name.clone(), None), Some(Some(_)));
                            ctx.peer_states.lock().unwrap().remove(&name);
                            if was_reachable {
                                debug!(peer = %name, "peer stopped answering /state");
                                if events.send(PlaneEvent::PeerUnreachable { name }).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });
        Self { task: Some(task) }
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PeerPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
