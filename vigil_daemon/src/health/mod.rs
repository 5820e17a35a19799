//! Health probing with hysteresis.
//!
//! Services with a health spec are probed only while this node leads;
//! standalone health checks run on every node. Each target is an
//! independent periodic task; transitions are emitted exactly once per
//! edge after the configured number of consecutive results.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::command::CommandRunner;
use crate::config::{HealthCheckConfig, ProbeConfig, ProbeTarget, ServiceConfig};
use crate::p2p::client;
use crate::resources::SystemdManager;
use crate::unix_millis;

/// Wire/status view of one monitored target.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HealthState {
    pub healthy: bool,
    pub last_check: Option<u64>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            healthy: true,
            last_check: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
        }
    }
}

/// Emitted on every healthy/unhealthy edge.
#[derive(Clone, Debug)]
pub struct HealthEvent {
    pub name: String,
    pub healthy: bool,
    pub state: HealthState,
    /// Set when the target is a managed service (enables restart recovery).
    pub service: bool,
}

/// The hysteresis counter machine, separated from the probing so the
/// threshold behaviour is testable on its own.
#[derive(Clone, Debug)]
pub struct Hysteresis {
    healthy: bool,
    failures: u32,
    successes: u32,
    failures_before_unhealthy: u32,
    successes_before_healthy: u32,
}

impl Hysteresis {
    pub fn new(failures_before_unhealthy: u32, successes_before_healthy: u32) -> Self {
        Self {
            healthy: true,
            failures: 0,
            successes: 0,
            failures_before_unhealthy: failures_before_unhealthy.max(1),
            successes_before_healthy: successes_before_healthy.max(1),
        }
    }

    pub fn healthy(&self) -> bool {
        self.healthy
    }

    pub fn counters(&self) -> (u32, u32) {
        (self.failures, self.successes)
    }

    /// Record one probe outcome; returns the new health exactly when the
    /// state flipped.
    pub fn record(&mut self, success: bool) -> Option<bool> {
        if success {
            self.failures = 0;
            self.successes += 1;
            if !self.healthy && self.successes >= self.successes_before_healthy {
                self.healthy = true;
                return Some(true);
            }
        } else {
            self.successes = 0;
            self.failures += 1;
            if self.healthy && self.failures >= self.failures_before_unhealthy {
                self.healthy = false;
                return Some(false);
            }
        }
        None
    }
}

struct Target {
    name: String,
    probe: ProbeConfig,
    service: bool,
}

pub struct HealthMonitor {
    service_targets: Vec<Arc<Target>>,
    standalone_targets: Vec<Arc<Target>>,
    states: Arc<Mutex<HashMap<String, HealthState>>>,
    systemd: Arc<SystemdManager>,
    event_tx: mpsc::UnboundedSender<HealthEvent>,
    standalone_tasks: Vec<JoinHandle<()>>,
    service_tasks: Vec<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(
        services: &[ServiceConfig],
        health_checks: &[HealthCheckConfig],
        runner: Arc<dyn CommandRunner>,
    ) -> (Self, mpsc::UnboundedReceiver<HealthEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let service_targets = services
            .iter()
            .filter_map(|s| {
                s.healthcheck.as_ref().map(|probe| {
                    Arc::new(Target {
                        name: s.name.clone(),
                        probe: probe.clone(),
                        service: true,
                    })
                })
            })
            .collect();
        let standalone_targets = health_checks
            .iter()
            .map(|c| {
                Arc::new(Target {
                    name: c.name.clone(),
                    probe: c.probe.clone(),
                    service: false,
                })
            })
            .collect();
        let monitor = Self {
            service_targets,
            standalone_targets,
            states: Arc::new(Mutex::new(HashMap::new())),
            systemd: Arc::new(SystemdManager::new(runner)),
            event_tx,
            standalone_tasks: Vec::new(),
            service_tasks: Vec::new(),
        };
        (monitor, event_rx)
    }

    /// Start the standalone checks (they run on every node). Idempotent.
    pub fn start(&mut self) {
        if !self.standalone_tasks.is_empty() {
            return;
        }
        let targets = self.standalone_targets.clone();
        self.standalone_tasks = self.spawn_targets(&targets);
    }

    /// Start or stop the leader-only service probes.
    pub fn set_leader(&mut self, leader: bool) {
        if leader && self.service_tasks.is_empty() {
            let targets = self.service_targets.clone();
            self.service_tasks = self.spawn_targets(&targets);
        } else if !leader && !self.service_tasks.is_empty() {
            for task in self.service_tasks.drain(..) {
                task.abort();
            }
            // Forget service results from this leadership stint so a later
            // promotion starts clean.
            let mut states = self.states.lock().unwrap();
            for target in &self.service_targets {
                states.remove(&target.name);
            }
            debug!("service health probes stopped");
        }
    }

    pub fn stop(&mut self) {
        self.set_leader(false);
        for task in self.standalone_tasks.drain(..) {
            task.abort();
        }
    }

    pub fn snapshot(&self) -> HashMap<String, HealthState> {
        self.states.lock().unwrap().clone()
    }

    fn spawn_targets(&self, targets: &[Arc<Target>]) -> Vec<JoinHandle<()>> {
        targets
            .iter()
            .map(|target| {
                let target = Arc::clone(target);
                let states = Arc::clone(&self.states);
                let systemd = Arc::clone(&self.systemd);
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let mut hysteresis = Hysteresis::new(
                        target.probe.failures_before_unhealthy,
                        target.probe.successes_before_healthy,
                    );
                    states
                        .lock()
                        .unwrap()
                        .insert(target.name.clone(), HealthState::default());
                    let mut ticker = tokio::time::interval(target.probe.interval());
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        let outcome =
                            run_probe(&target.probe.target, target.probe.probe_timeout(), &systemd)
                                .await;
                        let flipped = hysteresis.record(outcome.is_ok());
                        let state = {
                            let (failures, successes) = hysteresis.counters();
                            let state = HealthState {
                                healthy: hysteresis.healthy(),
                                last_check: Some(unix_millis()),
                                consecutive_failures: failures,
                                consecutive_successes: successes,
                                last_error: outcome.err(),
                            };
                            states
                                .lock()
                                .unwrap()
                                .insert(target.name.clone(), state.clone());
                            state
                        };
                        if let Some(healthy) = flipped {
                            if !healthy {
                                warn!(target = %target.name, error = ?state.last_error, "target became unhealthy");
                            } else {
                                debug!(target = %target.name, "target recovered");
                            }
                            if event_tx
                                .send(HealthEvent {
                                    name: target.name.clone(),
                                    healthy,
                                    state,
                                    service: target.service,
                                })
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_probe(
    target: &ProbeTarget,
    timeout: Duration,
    systemd: &SystemdManager,
) -> Result<(), String> {
    match target {
        ProbeTarget::Http { url } => match client::fetch_url(url, timeout).await {
            Ok(response) if response.is_success() => Ok(()),
            Ok(response) => Err(format!("HTTP {}", response.status)),
            Err(error) => Err(error.to_string()),
        },
        ProbeTarget::Tcp { host, port } => {
            let connect = tokio::net::TcpStream::connect((host.as_str(), *port));
            match tokio::time::timeout(timeout, connect).await {
                Ok(Ok(_stream)) => Ok(()),
                Ok(Err(error)) => Err(error.to_string()),
                Err(_) => Err(format!("connect to {host}:{port} timed out")),
            }
        }
        ProbeTarget::Systemd { unit } => match systemd.is_active(unit).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(format!("{unit} is not active")),
            Err(error) => Err(error.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::FakeRunner;

    #[test]
    fn hysteresis_transitions_exactly_at_thresholds() {
        let mut h = Hysteresis::new(3, 2);
        assert!(h.healthy());

        // One or two failures do not flap.
        assert_eq!(h.record(false), None);
        assert_eq!(h.record(false), None);
        assert!(h.healthy());
        // Third consecutive failure flips, once.
        assert_eq!(h.record(false), Some(false));
        assert_eq!(h.record(false), None);

        // One success is not enough to recover.
        assert_eq!(h.record(true), None);
        assert_eq!(h.record(true), Some(true));
        assert!(h.healthy());

        // A success resets the failure streak.
        assert_eq!(h.record(false), None);
        assert_eq!(h.record(false), None);
        assert_eq!(h.record(true), None);
        assert_eq!(h.record(false), None);
        assert_eq!(h.record(false), None);
        assert!(h.healthy());
    }

    #[test]
    fn single_failure_after_healthy_does_not_flap() {
        let mut h = Hysteresis::new(1, 1);
        assert_eq!(h.record(false), Some(false));
        assert_eq!(h.record(true), Some(true));
        // Threshold of one still emits one edge per flip, not per probe.
        assert_eq!(h.record(true), None);
    }

    fn probe(interval_ms: u64, target: ProbeTarget) -> ProbeConfig {
        ProbeConfig {
            target,
            interval: None,
            interval_ms: Some(interval_ms),
            timeout: None,
            timeout_ms: Some(250),
            failures_before_unhealthy: 2,
            successes_before_healthy: 1,
        }
    }

    #[tokio::test]
    async fn tcp_target_goes_unhealthy_when_listener_dies() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let checks = vec![HealthCheckConfig {
            name: "gw".to_string(),
            probe: probe(
                20,
                ProbeTarget::Tcp {
                    host: "127.0.0.1".to_string(),
                    port,
                },
            ),
        }];
        let runner = Arc::new(FakeRunner::new());
        let (mut monitor, mut events) = HealthMonitor::new(&[], &checks, runner);
        monitor.start();

        // Healthy while the listener accepts, then drop it: two failed
        // probes flip the target.
        tokio::time::sleep(Duration::from_millis(60)).await;
        drop(listener);
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("edge within deadline")
            .unwrap();
        assert_eq!(event.name, "gw");
        assert!(!event.healthy);
        assert!(!event.service);
        assert!(!monitor.snapshot()["gw"].healthy);
        monitor.stop();
    }

    #[tokio::test]
    async fn service_probes_only_run_for_the_leader() {
        let services = vec![ServiceConfig {
            name: "web".to_string(),
            unit: "nginx.service".to_string(),
            healthcheck: Some(probe(
                20,
                ProbeTarget::Tcp {
                    host: "127.0.0.1".to_string(),
                    port: 1, // closed port: fails fast
                },
            )),
        }];
        let runner = Arc::new(FakeRunner::new());
        let (mut monitor, mut events) = HealthMonitor::new(&services, &[], runner);
        monitor.start();

        // Follower: no probes, no events.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(events.try_recv().is_err());
        assert!(monitor.snapshot().is_empty());

        monitor.set_leader(true);
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("edge within deadline")
            .unwrap();
        assert!(event.service);
        assert!(!event.healthy);

        monitor.set_leader(false);
        assert!(monitor.snapshot().is_empty());
        monitor.stop();
    }
}
