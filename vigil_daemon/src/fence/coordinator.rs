//! Fence decisions: the safety gates, the execution protocol (power off,
//! then confirm), and the journaling of every outcome.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};
use vigil_protocol::control::{FenceAction, FenceInitiator, FenceRecord};

use super::driver::{PowerState, StonithDriver, build_driver};
use super::history::{FenceHistory, REFUSAL_PREFIX};
use crate::config::StonithConfig;
use crate::unix_millis;

/// How long to wait for the driver to report the target off.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Storm gate window.
const STORM_WINDOW: Duration = Duration::from_secs(300);

/// The supervisor's view of the cluster at the moment a fence is
/// attempted. Gates are evaluated against this, not against live state.
#[derive(Clone, Copy, Debug)]
pub struct GateContext {
    pub quorate: bool,
    pub is_leader: bool,
    pub require_quorum: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FenceRefusal {
    Disabled,
    NoQuorum,
    StartupGrace,
    Cooldown { remaining_secs: u64 },
    Storm,
    NotLeader,
    NoMapping,
}

impl std::fmt::Display for FenceRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FenceRefusal::Disabled => write!(f, "stonith disabled"),
            FenceRefusal::NoQuorum => write!(f, "no quorum"),
            FenceRefusal::StartupGrace => write!(f, "startup grace"),
            FenceRefusal::Cooldown { remaining_secs } => {
                write!(f, "cooldown ({remaining_secs}s remaining)")
            }
            FenceRefusal::Storm => write!(f, "storm"),
            FenceRefusal::NotLeader => write!(f, "not leader"),
            FenceRefusal::NoMapping => write!(f, "no node mapping"),
        }
    }
}

pub struct FenceCoordinator {
    config: StonithConfig,
    driver: Option<Box<dyn StonithDriver>>,
    initialized: AtomicBool,
    history: Mutex<FenceHistory>,
    started_at: Instant,
}

impl FenceCoordinator {
    pub fn from_config(config: StonithConfig, history: FenceHistory) -> Self {
        let driver = config
            .enabled
            .then(|| config.driver.as_ref().map(build_driver))
            .flatten();
        Self::with_driver(config, history, driver)
    }

    pub fn with_driver(
        config: StonithConfig,
        history: FenceHistory,
        driver: Option<Box<dyn StonithDriver>>,
    ) -> Self {
        Self {
            config,
            driver,
            initialized: AtomicBool::new(false),
            history: Mutex::new(history),
            started_at: Instant::now(),
        }
    }

    /// Probe the driver once. Until this succeeds every automatic fence
    /// is refused as disabled.
    pub async fn init(&self) {
        let Some(driver) = &self.driver else {
            return;
        };
        match driver.test().await {
            Ok(()) => {
                self.initialized.store(true, Ordering::SeqCst);
                info!(driver = driver.kind(), "stonith driver ready");
            }
            Err(e) => {
                error!(driver = driver.kind(), error = %e, "stonith driver test failed");
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Some(driver) = &self.driver {
            driver.destroy().await;
        }
    }

    pub fn history_snapshot(&self) -> Vec<FenceRecord> {
        self.history.lock().unwrap().snapshot()
    }

    pub fn status(&self) -> serde_json::Value {
        let grace = Duration::from_secs(self.config.startup_grace_period_secs);
        let grace_remaining = grace.saturating_sub(self.started_at.elapsed());
        serde_json::json!({
            "enabled": self.config.enabled,
            "driver": self.driver.as_ref().map(|d| d.kind()),
            "driverReady": self.initialized.load(Ordering::SeqCst),
            "graceRemainingSecs": grace_remaining.as_secs(),
            "recentFences": self
                .history
                .lock()
                .unwrap()
                .power_off_attempts_within(STORM_WINDOW),
            "maxFencesPer5Min": self.config.max_fences_per_5_min,
            "mappedNodes": self.config.node_mapping.keys().collect::<Vec<_>>(),
        })
    }

    /// Whether `target` was actually fenced within the cooldown window.
    /// The backup scheduling path consults this so a peer that stays dead
    /// does not churn the journal with refusals every poll.
    pub fn in_cooldown(&self, target: &str) -> bool {
        let min_delay = self.config.min_delay_between_fence_secs * 1000;
        self.history
            .lock()
            .unwrap()
            .last_power_off_attempt(target)
            .map(|last| unix_millis().saturating_sub(last) < min_delay)
            .unwrap_or(false)
    }

    /// The seven safety gates, in order. Manual fences bypass only the
    /// startup-grace and storm gates.
    fn check_gates(
        &self,
        target: &str,
        initiated_by: FenceInitiator,
        ctx: &GateContext,
    ) -> Result<String, FenceRefusal> {
        let automatic = initiated_by == FenceInitiator::Automatic;
        if self.driver.is_none() || !self.initialized.load(Ordering::SeqCst) {
            return Err(FenceRefusal::Disabled);
        }
        if ctx.require_quorum && !ctx.quorate {
            return Err(FenceRefusal::NoQuorum);
        }
        let grace = Duration::from_secs(self.config.startup_grace_period_secs);
        if automatic && self.started_at.elapsed() < grace {
            return Err(FenceRefusal::StartupGrace);
        }
        let min_delay = self.config.min_delay_between_fence_secs * 1000;
        if let Some(last) = self.history.lock().unwrap().last_power_off_attempt(target) {
            let since = unix_millis().saturating_sub(last);
            if since < min_delay {
                return Err(FenceRefusal::Cooldown {
                    remaining_secs: (min_delay - since) / 1000,
                });
            }
        }
        if automatic {
            let recent = self
                .history
                .lock()
                .unwrap()
                .power_off_attempts_within(STORM_WINDOW);
            if recent >= self.config.max_fences_per_5_min {
                return Err(FenceRefusal::Storm);
            }
        }
        if !ctx.is_leader {
            return Err(FenceRefusal::NotLeader);
        }
        match self.config.node_mapping.get(target) {
            Some(mapped) => Ok(mapped.clone()),
            None => Err(FenceRefusal::NoMapping),
        }
    }

    /// Fence `target`. Every outcome, including a gate refusal, lands in
    /// the journal; the returned record is what was appended.
    pub async fn fence(
        &self,
        target: &str,
        reason: &str,
        initiated_by: FenceInitiator,
        ctx: GateContext,
    ) -> FenceRecord {
        let mapped = match self.check_gates(target, initiated_by, &ctx) {
            Ok(mapped) => mapped,
            Err(refusal) => {
                warn!(node = target, %refusal, "fence refused");
                return self.append(FenceRecord {
                    node: target.to_string(),
                    action: FenceAction::PowerOff,
                    success: false,
                    reason: format!("{REFUSAL_PREFIX}{refusal}"),
                    timestamp: unix_millis(),
                    duration_ms: 0,
                    initiated_by,
                });
            }
        };

        info!(node = target, mapped = %mapped, reason, "fencing node");
        let driver = self.driver.as_ref().expect("gate 1 checked the driver");
        let started = Instant::now();
        let outcome = match driver.power_off(&mapped).await {
            Ok(()) => self.confirm_off(driver.as_ref(), &mapped).await,
            Err(e) => Err(format!("power off failed: {e}")),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let record = match outcome {
            Ok(()) => {
                info!(node = target, duration_ms, "node fenced");
                FenceRecord {
                    node: target.to_string(),
                    action: FenceAction::PowerOff,
                    success: true,
                    reason: reason.to_string(),
                    timestamp: unix_millis(),
                    duration_ms,
                    initiated_by,
                }
            }
            Err(detail) => {
                error!(node = target, %detail, "fence failed");
                FenceRecord {
                    node: target.to_string(),
                    action: FenceAction::PowerOff,
                    success: false,
                    reason: format!("{reason} ({detail})"),
                    timestamp: unix_millis(),
                    duration_ms,
                    initiated_by,
                }
            }
        };
        self.append(record)
    }

    /// Power a fenced node back on. Only the driver and mapping gates
    /// apply; bringing a node up cannot split the brain.
    pub async fn unfence(&self, target: &str, initiated_by: FenceInitiator) -> FenceRecord {
        let outcome = async {
            if self.driver.is_none() || !self.initialized.load(Ordering::SeqCst) {
                return Err(FenceRefusal::Disabled.to_string());
            }
            let mapped = self
                .config
                .node_mapping
                .get(target)
                .ok_or_else(|| FenceRefusal::NoMapping.to_string())?;
            self.driver
                .as_ref()
                .expect("checked above")
                .power_on(mapped)
                .await
                .map_err(|e| e.to_string())
        };
        let started = Instant::now();
        let result = outcome.await;
        let record = FenceRecord {
            node: target.to_string(),
            action: FenceAction::PowerOn,
            success: result.is_ok(),
            reason: match &result {
                Ok(()) => "manual power on".to_string(),
                Err(detail) => detail.clone(),
            },
            timestamp: unix_millis(),
            duration_ms: started.elapsed().as_millis() as u64,
            initiated_by,
        };
        self.append(record)
    }

    async fn confirm_off(&self, driver: &dyn StonithDriver, mapped: &str) -> Result<(), String> {
        let deadline = Instant::now() + CONFIRM_TIMEOUT;
        loop {
            match driver.status(mapped).await {
                Ok(PowerState::Off) => return Ok(()),
                Ok(_) if Instant::now() >= deadline => {
                    return Err(format!("target not off after {CONFIRM_TIMEOUT:?}"));
                }
                Ok(_) => tokio::time::sleep(CONFIRM_POLL_INTERVAL).await,
                Err(e) if Instant::now() >= deadline => {
                    return Err(format!("status check failed: {e}"));
                }
                Err(_) => tokio::time::sleep(CONFIRM_POLL_INTERVAL).await,
            }
        }
    }

    fn append(&self, record: FenceRecord) -> FenceRecord {
        self.history.lock().unwrap().append(record.clone());
        record
    }
}
