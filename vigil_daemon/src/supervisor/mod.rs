//! The supervisory loop: owns the node state machine, consumes events
//! from the observer, health monitor, plane and control socket, and is
//! the only place runtime state is mutated.

pub mod pidfile;
pub mod state;

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use vigil_protocol::control::{ControlRequest, ControlResponse, FenceInitiator};

use crate::cluster::ClusterSnapshot;
use crate::cluster::corosync::{Corosync, MembershipSource};
use crate::cluster::election::{ElectionTracker, elect};
use crate::cluster::observer::{ClusterObserver, ObserverEvent};
use crate::command::CommandRunner;
use crate::config::Config;
use crate::control::{CommandReceiver, ControlServer};
use crate::fence::{FenceCoordinator, FenceHistory, GateContext};
use crate::health::{HealthEvent, HealthMonitor};
use crate::mesh::MeshManager;
use crate::p2p::allowlist::AllowList;
use crate::p2p::knock::KnockListener;
use crate::p2p::poller::PeerPoller;
use crate::p2p::server::{PlaneContext, PlaneServer};
use crate::p2p::statefile::NodeStateFile;
use crate::p2p::{LocalState, PlaneEvent};
use crate::resources::{ResourceActivator, SystemdManager, VipManager};
use pidfile::PidFile;
use state::{NodePhase, NodeRuntime, PendingFence};

/// Consecutive ticks a peer must be seen offline before the backup fence
/// path schedules it (covers peers that died before we started).
const DEAD_POLLS_BEFORE_FENCE: u32 = 2;
/// Consecutive ticks without any VIP observed anywhere before a follower
/// the election favours seizes leadership.
const POLLS_BEFORE_SEIZURE: u32 = 3;

pub struct Supervisor {
    config: Config,
    config_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    runtime: NodeRuntime,
    local_node_id: Option<u32>,
    last_snapshot: Option<ClusterSnapshot>,
    tracker: ElectionTracker,

    observer: ClusterObserver,
    snapshots: watch::Receiver<Option<ClusterSnapshot>>,
    observer_events: mpsc::UnboundedReceiver<ObserverEvent>,

    health: HealthMonitor,
    health_events: mpsc::UnboundedReceiver<HealthEvent>,

    activator: Arc<ResourceActivator>,
    vip_manager: Arc<VipManager>,
    systemd: Arc<SystemdManager>,

    fence: Arc<FenceCoordinator>,
    fence_due_tx: mpsc::UnboundedSender<String>,
    fence_due_rx: mpsc::UnboundedReceiver<String>,

    plane_ctx: Arc<PlaneContext>,
    plane_events: mpsc::UnboundedReceiver<PlaneEvent>,
    plane_server: PlaneServer,
    poller: PeerPoller,
    knock: KnockListener,

    control: ControlServer,
    commands: CommandReceiver,

    local_state_tx: watch::Sender<LocalState>,
    state_file: Arc<NodeStateFile>,
    _pid_file: PidFile,
}

impl Supervisor {
    /// Construct and wire every subsystem. Fails fast on environment
    /// problems (corosync down, ports taken, live pid file).
    pub async fn build(
        config: Config,
        config_path: PathBuf,
        runner: Arc<dyn CommandRunner>,
    ) -> anyhow::Result<Self> {
        let pid_file = PidFile::acquire(config.paths.pid_file.clone())
            .context("acquiring pid file")?;

        let corosync = Arc::new(Corosync::new(
            Arc::clone(&runner),
            config.paths.corosync_conf.clone(),
        ));
        if !corosync.is_running().await {
            anyhow::bail!("corosync is not answering; is the cluster stack up?");
        }

        let mesh = Arc::new(MeshManager::new(
            Arc::clone(&runner),
            config.mesh.interface.clone(),
            config.mesh.config_path(),
        ));

        let (mut observer, channels) = ClusterObserver::new(
            Arc::clone(&corosync) as Arc<dyn MembershipSource>,
            config.node.name.clone(),
        );
        observer.start(config.poll_interval());

        let vip_manager = Arc::new(VipManager::new(Arc::clone(&runner)));
        let systemd = Arc::new(SystemdManager::new(Arc::clone(&runner)));
        let activator = Arc::new(ResourceActivator::new(
            config.resolved_vips(),
            config.services.clone(),
            &config.constraints,
            Arc::clone(&vip_manager),
            Arc::clone(&systemd),
        ));

        let (mut health, health_events) =
            HealthMonitor::new(&config.services, &config.health_checks, Arc::clone(&runner));
        health.start();

        let fence = Arc::new(FenceCoordinator::from_config(
            config.stonith.clone(),
            FenceHistory::load(config.paths.fence_history.clone()),
        ));
        fence.init().await;

        let local_overlay_ip = config
            .mesh
            .address
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let state_file = Arc::new(NodeStateFile::open(
            config.paths.node_state.clone(),
            &config.cluster.name,
            &config.node.name,
            &local_overlay_ip,
        ));

        let (local_state_tx, local_state_rx) = watch::channel(LocalState::default());
        let allowlist = Arc::new(AllowList::new());
        let plane_ctx = Arc::new(PlaneContext {
            local_name: config.node.name.clone(),
            cluster_name: config.cluster.name.clone(),
            auth_key: config.p2p.auth_key.clone(),
            p2p_port: config.p2p.port,
            request_timeout: Duration::from_millis(config.p2p.request_timeout_ms),
            allowlist: Arc::clone(&allowlist),
            local_state: local_state_rx,
            mesh: Arc::clone(&mesh),
            corosync: Arc::clone(&corosync),
            state_file: Arc::clone(&state_file),
            peer_states: Default::default(),
        });

        // The plane belongs on the overlay; without a configured overlay
        // address it stays on loopback rather than a public interface.
        let bind_ip: IpAddr = config
            .p2p
            .bind_ip
            .clone()
            .or_else(|| config.mesh.address.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
            .parse()
            .context("p2p bind address")?;
        let plane_server = PlaneServer::bind(bind_ip, config.p2p.port, Arc::clone(&plane_ctx))
            .await
            .context("binding p2p plane")?;
        let knock = KnockListener::bind(
            config.p2p.knock_port,
            config.p2p.auth_key.clone(),
            Arc::clone(&allowlist),
        )
        .await
        .context("binding knock listener")?;

        let (plane_event_tx, plane_events) = mpsc::unbounded_channel();
        let poller = PeerPoller::start(
            Arc::clone(&plane_ctx),
            channels.snapshots.clone(),
            Duration::from_millis(config.p2p.poll_interval_ms),
            plane_event_tx,
        );

        let (command_tx, commands) = mpsc::channel(16);
        let control = ControlServer::bind(config.paths.control_socket.clone(), command_tx)
            .context("binding control socket")?;

        let grace_until =
            Instant::now() + Duration::from_secs(config.stonith.startup_grace_period_secs);
        let (fence_due_tx, fence_due_rx) = mpsc::unbounded_channel();

        Ok(Self {
            runtime: NodeRuntime::new(grace_until),
            local_node_id: None,
            last_snapshot: None,
            tracker: ElectionTracker::new(),
            observer,
            snapshots: channels.snapshots,
            observer_events: channels.events,
            health,
            health_events,
            activator,
            vip_manager,
            systemd,
            fence,
            fence_due_tx,
            fence_due_rx,
            plane_ctx,
            plane_events,
            plane_server,
            poller,
            knock,
            control,
            commands,
            local_state_tx,
            state_file,
            _pid_file: pid_file,
            config,
            config_path,
            runner,
        })
    }

    /// Run until a stop signal arrives, then shut down cleanly.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        let mut sigusr2 = signal(SignalKind::user_defined2())?;

        self.runtime.phase = if self.config.cluster.quorum_required {
            NodePhase::WaitingQuorum
        } else {
            NodePhase::Follower
        };
        info!(phase = %self.runtime.phase, node = %self.config.node.name, "daemon started");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received");
                    break;
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading configuration");
                    match self.reload() {
                        Ok(message) => info!("{message}"),
                        Err(error) => error!(%error, "reload failed, previous configuration retained"),
                    }
                }
                _ = sigusr1.recv() => {
                    info!("SIGUSR1 received, entering standby");
                    self.set_standby(true).await;
                }
                _ = sigusr2.recv() => {
                    info!("SIGUSR2 received, leaving standby");
                    self.set_standby(false).await;
                }
                changed = self.snapshots.changed() => {
                    if changed.is_ok() {
                        self.handle_tick().await;
                    }
                }
                Some(event) = self.observer_events.recv() => {
                    self.handle_observer_event(event).await;
                }
                Some(event) = self.health_events.recv() => {
                    self.handle_health_event(event);
                }
                Some(event) = self.plane_events.recv() => {
                    self.handle_plane_event(event);
                }
                Some(name) = self.fence_due_rx.recv() => {
                    self.handle_fence_due(name);
                }
                Some((request, reply)) = self.commands.recv() => {
                    self.handle_command(request, reply).await;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn handle_tick(&mut self) {
        let Some(snapshot) = self.snapshots.borrow_and_update().clone() else {
            return;
        };

        if let Some(member) = snapshot.member(&self.config.node.name) {
            self.local_node_id = Some(member.node_id);
        }
        self.plane_ctx.allowlist.set_members(
            snapshot
                .members
                .iter()
                .filter_map(|m| m.overlay_ip.parse::<IpAddr>().ok()),
        );

        if self.runtime.phase == NodePhase::WaitingQuorum {
            if snapshot.quorate {
                info!("quorum reached");
                self.runtime.phase = NodePhase::Follower;
            } else {
                self.last_snapshot = Some(snapshot);
                return;
            }
        }

        self.track_dead_nodes(&snapshot);

        // Election.
        let mut standby_set: HashSet<String> =
            self.plane_ctx.standby_peers().into_iter().collect();
        if self.runtime.in_standby || self.runtime.in_failover_hold() {
            standby_set.insert(self.config.node.name.clone());
        }
        let election = elect(
            &snapshot.members,
            self.local_node_id.unwrap_or(u32::MAX),
            &standby_set,
            self.config.cluster.quorum_required,
            snapshot.quorate,
        );
        if let Some(change) = self.tracker.observe(election.as_ref()) {
            info!(
                leader = change.leader_name.as_deref().unwrap_or("none"),
                local = change.is_local,
                "leadership changed"
            );
        }

        // Quorum gate: a leader that lost quorum retracts immediately.
        if self.runtime.is_leader
            && self.config.cluster.quorum_required
            && !snapshot.quorate
        {
            self.demote("quorum lost").await;
        }

        let elected_local = election
            .as_ref()
            .map(|e| e.is_local_leader)
            .unwrap_or(false);

        if self.runtime.is_leader && !elected_local {
            self.demote("lost election").await;
        }

        // Promotion debounces for `failoverDelayMs` so a flapping peer
        // does not bounce the VIPs.
        if elected_local && !self.runtime.is_leader && !self.runtime.in_standby {
            match self.runtime.promote_at {
                None => {
                    self.runtime.promote_at = Some(Instant::now() + self.config.failover_delay());
                    debug!("promotion scheduled");
                }
                Some(at) if Instant::now() >= at => self.promote().await,
                Some(_) => {}
            }
        } else if !elected_local {
            self.runtime.promote_at = None;
        }

        // Watchdog: a non-leader must hold no VIP.
        let mut local_vip_active = false;
        if !self.runtime.is_leader {
            match self.vip_manager.any_active(self.activator.vips()).await {
                Ok(active) => {
                    local_vip_active = active;
                    if active {
                        error!("follower holds a VIP, retracting immediately");
                        for vip in self.activator.vips() {
                            if let Err(e) = self.vip_manager.deactivate(vip).await {
                                error!(vip = %vip.name, error = %e, "emergency retraction failed");
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "vip watchdog check failed"),
            }
        }

        // Release a failover hold once some other node leads.
        let peer_leads = self
            .plane_ctx
            .peer_states
            .lock()
            .unwrap()
            .values()
            .any(|s| s.is_leader);
        if self.runtime.failover_hold_until.is_some() && peer_leads {
            self.runtime.failover_hold_until = None;
            info!("failover complete, another node leads");
        }

        self.update_seizure(&snapshot, elected_local, local_vip_active, peer_leads)
            .await;

        self.publish_local_state();
        self.last_snapshot = Some(snapshot);
    }

    fn track_dead_nodes(&mut self, snapshot: &ClusterSnapshot) {
        for member in &snapshot.members {
            if member.name == self.config.node.name {
                continue;
            }
            if member.online {
                self.runtime.dead_node_polls.remove(&member.name);
                if self.runtime.cancel_fence(&member.name) {
                    info!(node = %member.name, "node returned, pending fence cancelled");
                }
            } else {
                let polls = self
                    .runtime
                    .dead_node_polls
                    .entry(member.name.clone())
                    .or_insert(0);
                *polls += 1;
                // Backup path: a peer that was already gone when we
                // started never produces a state-change event.
                if *polls >= DEAD_POLLS_BEFORE_FENCE
                    && !self.runtime.pending_fences.contains_key(&member.name)
                    && !self.fence.in_cooldown(&member.name)
                {
                    self.schedule_fence(
                        member.name.clone(),
                        Duration::from_secs(self.config.stonith.fence_delay_on_node_left_secs),
                        "node seen offline",
                    );
                }
            }
        }
        self.runtime
            .dead_node_polls
            .retain(|name, _| snapshot.member(name).is_some());
    }

    /// Leader seizure: recovers the cluster when a leader died without
    /// handing anything over. The counter resets on any tick where a VIP
    /// is observed anywhere or where the election inhibits takeover.
    async fn update_seizure(
        &mut self,
        snapshot: &ClusterSnapshot,
        elected_local: bool,
        local_vip_active: bool,
        peer_leads: bool,
    ) {
        let vip_seen_anywhere = local_vip_active || peer_leads || self.runtime.is_leader;
        let inhibited = !elected_local
            || self.runtime.in_standby
            || self.runtime.in_startup_grace()
            || (self.config.cluster.quorum_required && !snapshot.quorate);
        if vip_seen_anywhere || inhibited {
            self.runtime.polls_without_vip = 0;
            return;
        }
        self.runtime.polls_without_vip += 1;
        if self.runtime.polls_without_vip >= POLLS_BEFORE_SEIZURE && !self.runtime.is_leader {
            warn!(
                polls = self.runtime.polls_without_vip,
                "no VIP observed anywhere, seizing leadership"
            );
            self.runtime.polls_without_vip = 0;
            self.promote().await;
        }
    }

    async fn handle_observer_event(&mut self, event: ObserverEvent) {
        match event {
            ObserverEvent::NodeStateChange {
                name,
                online: false,
                previous_online: true,
            } if name != self.config.node.name => {
                warn!(node = %name, "peer left the cluster");
                self.schedule_fence(
                    name,
                    Duration::from_secs(self.config.stonith.fence_delay_on_node_left_secs),
                    "node left cluster",
                );
            }
            ObserverEvent::NodeStateChange {
                name,
                online: true,
                ..
            } => {
                info!(node = %name, "peer online");
                self.runtime.dead_node_polls.remove(&name);
                if self.runtime.cancel_fence(&name) {
                    info!(node = %name, "pending fence cancelled");
                }
            }
            ObserverEvent::NodeStateChange { .. } => {}
            ObserverEvent::QuorumChange { quorate: false } => {
                warn!("quorum lost");
                if self.runtime.is_leader && self.config.cluster.quorum_required {
                    self.demote("quorum lost").await;
                }
            }
            ObserverEvent::QuorumChange { quorate: true } => {
                info!("quorum regained");
                if self.runtime.phase == NodePhase::WaitingQuorum {
                    self.runtime.phase = NodePhase::Follower;
                }
            }
        }
    }

    fn handle_health_event(&mut self, event: HealthEvent) {
        if event.healthy {
            info!(target = %event.name, "health recovered");
            return;
        }
        warn!(target = %event.name, error = ?event.state.last_error, "health check failed");
        if event.service && self.runtime.is_leader {
            let activator = Arc::clone(&self.activator);
            let name = event.name.clone();
            tokio::spawn(async move {
                match activator.restart_service(&name).await {
                    Ok(()) => info!(service = %name, "service restarted after health failure"),
                    Err(error) => error!(service = %name, %error, "health-driven restart failed"),
                }
            });
        }
    }

    fn handle_plane_event(&mut self, event: PlaneEvent) {
        match event {
            PlaneEvent::PeerFlipped { name, state } => {
                debug!(peer = %name, standby = state.standby, leader = state.is_leader, "peer state");
            }
            PlaneEvent::PeerUnreachable { name } => {
                warn!(peer = %name, "peer unreachable on the overlay");
            }
        }
    }

    /// Idempotent per target; a second schedule while one is pending is a
    /// no-op.
    fn schedule_fence(&mut self, name: String, delay: Duration, reason: &str) {
        if name == self.config.node.name || self.runtime.pending_fences.contains_key(&name) {
            return;
        }
        if !self.config.stonith.enabled {
            return;
        }
        info!(node = %name, ?delay, reason, "fence scheduled");
        let due_tx = self.fence_due_tx.clone();
        let timer_name = name.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = due_tx.send(timer_name);
        });
        self.runtime.pending_fences.insert(
            name,
            PendingFence {
                timer,
                reason: reason.to_string(),
                scheduled_at: Instant::now(),
            },
        );
    }

    fn handle_fence_due(&mut self, name: String) {
        // A cancellation that raced the timer wins.
        let Some(pending) = self.runtime.pending_fences.remove(&name) else {
            return;
        };
        let ctx = self.gate_context();
        if !ctx.is_leader {
            debug!(node = %name, "not leader, leaving the fence to the elected leader");
            return;
        }
        let fence = Arc::clone(&self.fence);
        tokio::spawn(async move {
            fence
                .fence(&name, &pending.reason, FenceInitiator::Automatic, ctx)
                .await;
        });
    }

    fn gate_context(&self) -> GateContext {
        GateContext {
            quorate: self
                .last_snapshot
                .as_ref()
                .map(|s| s.quorate)
                .unwrap_or(false),
            is_leader: self.runtime.is_leader,
            require_quorum: self.config.cluster.quorum_required,
        }
    }

    async fn promote(&mut self) {
        if self.runtime.is_leader {
            return;
        }
        info!("promoting to leader");
        self.runtime.promote_at = None;
        self.runtime.is_leader = true;
        self.runtime.phase = NodePhase::Leader;
        let report = self.activator.activate_all().await;
        if !report.success {
            error!(errors = ?report.errors, "resource activation failed, demoting");
            self.demote("activation failed").await;
            return;
        }
        self.health.set_leader(true);
        self.publish_local_state();
        info!("leader active");
    }

    async fn demote(&mut self, reason: &str) {
        self.runtime.promote_at = None;
        if self.runtime.is_leader {
            info!(reason, "stepping down");
            self.health.set_leader(false);
            self.runtime.is_leader = false;
            let report = self.activator.deactivate_all().await;
            if !report.success {
                error!(errors = ?report.errors, "resource retraction incomplete");
            }
        }
        self.runtime.phase = if self.runtime.in_standby {
            NodePhase::Standby
        } else {
            NodePhase::Follower
        };
        self.publish_local_state();
    }

    async fn set_standby(&mut self, standby: bool) {
        if standby == self.runtime.in_standby {
            return;
        }
        self.runtime.in_standby = standby;
        if standby {
            self.demote("standby requested").await;
        } else {
            self.runtime.phase = NodePhase::Follower;
            self.publish_local_state();
        }
    }

    fn publish_local_state(&self) {
        self.local_state_tx.send_replace(LocalState {
            standby: self.runtime.in_standby,
            is_leader: self.runtime.is_leader,
        });
    }

    fn reload(&mut self) -> Result<String, String> {
        let new = Config::load(&self.config_path).map_err(|e| e.to_string())?;
        if new.cluster.name != self.config.cluster.name
            || new.node.name != self.config.node.name
        {
            return Err("cluster identity (cluster.name, node.name) is immutable at reload".into());
        }

        self.activator = Arc::new(ResourceActivator::new(
            new.resolved_vips(),
            new.services.clone(),
            &new.constraints,
            Arc::clone(&self.vip_manager),
            Arc::clone(&self.systemd),
        ));

        if new.services != self.config.services || new.health_checks != self.config.health_checks
        {
            self.health.stop();
            let (mut health, health_events) =
                HealthMonitor::new(&new.services, &new.health_checks, Arc::clone(&self.runner));
            health.start();
            health.set_leader(self.runtime.is_leader);
            self.health = health;
            self.health_events = health_events;
            info!("health monitor recreated");
        }

        if new.stonith != self.config.stonith {
            warn!("stonith configuration changes take effect at the next restart");
        }

        self.config = new;
        Ok("configuration reloaded".to_string())
    }

    async fn handle_command(
        &mut self,
        request: ControlRequest,
        reply: oneshot::Sender<ControlResponse>,
    ) {
        let response = match request {
            ControlRequest::Status => ControlResponse::ok_with_data(self.status_report()),
            ControlRequest::Health => {
                let health = self.health.snapshot();
                ControlResponse::ok_with_data(serde_json::to_value(health).unwrap_or_default())
            }
            ControlRequest::Resources => self.resources_report().await,
            ControlRequest::Standby => {
                self.set_standby(true).await;
                ControlResponse::ok_with_message("node in standby")
            }
            ControlRequest::Unstandby => {
                self.set_standby(false).await;
                ControlResponse::ok_with_message("node active")
            }
            ControlRequest::Failover { target } => self.handle_failover(target).await,
            ControlRequest::Reload => match self.reload() {
                Ok(message) => ControlResponse::ok_with_message(message),
                Err(error) => ControlResponse::err(error),
            },
            ControlRequest::StonithStatus => {
                let mut status = self.fence.status();
                if let Some(map) = status.as_object_mut() {
                    let pending: Vec<serde_json::Value> = self
                        .runtime
                        .pending_fences
                        .iter()
                        .map(|(node, fence)| {
                            serde_json::json!({
                                "node": node,
                                "reason": fence.reason,
                                "pendingForSecs": fence.scheduled_at.elapsed().as_secs(),
                            })
                        })
                        .collect();
                    map.insert("pendingFences".to_string(), serde_json::json!(pending));
                }
                ControlResponse::ok_with_data(status)
            }
            ControlRequest::StonithFence { node } => {
                if node == self.config.node.name {
                    ControlResponse::err("refusing to fence the local node")
                } else {
                    let fence = Arc::clone(&self.fence);
                    let ctx = self.gate_context();
                    tokio::spawn(async move {
                        let record = fence
                            .fence(&node, "manual fence", FenceInitiator::Manual, ctx)
                            .await;
                        let response = if record.success {
                            ControlResponse::ok_with_data(
                                serde_json::to_value(&record).unwrap_or_default(),
                            )
                        } else {
                            ControlResponse::err(record.reason.clone())
                        };
                        let _ = reply.send(response);
                    });
                    return;
                }
            }
            ControlRequest::StonithUnfence { node } => {
                let fence = Arc::clone(&self.fence);
                tokio::spawn(async move {
                    let record = fence.unfence(&node, FenceInitiator::Manual).await;
                    let response = if record.success {
                        ControlResponse::ok_with_message(format!("{node} powered on"))
                    } else {
                        ControlResponse::err(record.reason.clone())
                    };
                    let _ = reply.send(response);
                });
                return;
            }
            ControlRequest::StonithHistory => ControlResponse::ok_with_data(
                serde_json::to_value(self.fence.history_snapshot()).unwrap_or_default(),
            ),
        };
        let _ = reply.send(response);
    }

    fn status_report(&self) -> serde_json::Value {
        let snapshot = self.last_snapshot.as_ref();
        serde_json::json!({
            "node": self.config.node.name,
            "cluster": self.config.cluster.name,
            "phase": self.runtime.phase,
            "isLeader": self.runtime.is_leader,
            "standby": self.runtime.in_standby,
            "priority": self.config.node.priority,
            "nodeId": self.local_node_id,
            "quorate": snapshot.map(|s| s.quorate),
            "expectedVotes": snapshot.map(|s| s.expected_votes),
            "totalVotes": snapshot.map(|s| s.total_votes),
            "members": snapshot.map(|s| s.members.clone()),
            "startupGraceActive": self.runtime.in_startup_grace(),
            "pendingFences": self.runtime.pending_fences.keys().collect::<Vec<_>>(),
            "joinPhase": self.state_file.snapshot().phase,
        })
    }

    async fn resources_report(&self) -> ControlResponse {
        let mut vips = Vec::new();
        for vip in self.activator.vips() {
            let active = self.vip_manager.is_active(vip).await.unwrap_or(false);
            vips.push(serde_json::json!({
                "name": vip.name,
                "ip": vip.ip,
                "cidr": vip.cidr,
                "interface": vip.interface,
                "active": active,
            }));
        }
        let mut services = Vec::new();
        for service in self.activator.services() {
            let active = self.systemd.is_active(&service.unit).await.unwrap_or(false);
            services.push(serde_json::json!({
                "name": service.name,
                "unit": service.unit,
                "active": active,
                "monitored": service.healthcheck.is_some(),
            }));
        }
        ControlResponse::ok_with_data(serde_json::json!({
            "vips": vips,
            "services": services,
            "constraints": self.config.constraints,
        }))
    }

    async fn handle_failover(&mut self, target: Option<String>) -> ControlResponse {
        if !self.runtime.is_leader {
            return ControlResponse::err("this node is not the leader");
        }
        if let Some(target) = &target {
            let Some(snapshot) = &self.last_snapshot else {
                return ControlResponse::err("no membership snapshot yet");
            };
            match snapshot.member(target) {
                Some(member) if member.online => {}
                Some(_) => return ControlResponse::err(format!("{target} is offline")),
                None => return ControlResponse::err(format!("{target} is not a cluster member")),
            }
            if target == &self.config.node.name {
                return ControlResponse::err("this node already leads");
            }
            if self.plane_ctx.standby_peers().contains(target) {
                return ControlResponse::err(format!("{target} is in standby"));
            }
        }
        // Step down and hold back from the next elections long enough for
        // a peer to take over.
        let hold = self.config.failover_delay() * 2 + self.config.poll_interval() * 5;
        self.runtime.failover_hold_until = Some(Instant::now() + hold);
        self.demote("failover requested").await;
        ControlResponse::ok_with_message(match target {
            Some(target) => format!("leadership released in favour of {target}"),
            None => "leadership released".to_string(),
        })
    }

    async fn shutdown(&mut self) {
        info!("shutting down");
        self.runtime.phase = NodePhase::Stopping;
        for name in self.runtime.cancel_all_fences() {
            info!(node = %name, reason = "shutdown", "pending fence cancelled");
        }
        if self.runtime.is_leader {
            self.health.set_leader(false);
            self.runtime.is_leader = false;
            let report = self.activator.deactivate_all().await;
            if !report.success {
                error!(errors = ?report.errors, "retraction incomplete during shutdown");
            }
        }
        self.health.stop();
        self.observer.stop();
        self.poller.stop();
        self.plane_server.stop();
        self.knock.stop();
        self.control.stop();
        self.fence.shutdown().await;
        self.state_file.cleanup();
        info!("stopped");
    }
}
