//! The fence history journal: a bounded JSON array on disk, rewritten
//! after every append. Only the coordinator writes it; everyone else gets
//! copies.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;
use vigil_protocol::control::{FenceAction, FenceRecord};

use crate::unix_millis;

pub const MAX_ENTRIES: usize = 100;

pub struct FenceHistory {
    path: PathBuf,
    entries: Vec<FenceRecord>,
    max_entries: usize,
}

impl FenceHistory {
    /// Load the journal, or start empty when the file is absent or
    /// corrupt (corruption is logged and the file is overwritten on the
    /// next append).
    pub fn load(path: PathBuf) -> Self {
        let entries = match std::fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<Vec<FenceRecord>>(&raw) {
                Ok(entries) => entries,
                Err(error) => {
                    warn!(path = %path.display(), %error, "fence history is corrupt, resetting");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            path,
            entries,
            max_entries: MAX_ENTRIES,
        }
    }

    #[cfg(test)]
    pub fn with_max(path: PathBuf, max_entries: usize) -> Self {
        let mut history = Self::load(path);
        history.max_entries = max_entries;
        history
    }

    /// Append and persist. The oldest entries are discarded beyond the
    /// bound; persistence failures are logged, not propagated, so a full
    /// disk cannot block fencing.
    pub fn append(&mut self, record: FenceRecord) {
        self.entries.push(record);
        if self.entries.len() > self.max_entries {
            let excess = self.entries.len() - self.max_entries;
            self.entries.drain(..excess);
        }
        match serde_json::to_vec_pretty(&self.entries) {
            Ok(raw) => {
                if let Err(error) = crate::fslock::atomic_write(&self.path, &raw) {
                    warn!(path = %self.path.display(), %error, "could not persist fence history");
                }
            }
            Err(error) => warn!(%error, "could not serialize fence history"),
        }
    }

    /// Newest first.
    pub fn snapshot(&self) -> Vec<FenceRecord> {
        let mut entries = self.entries.clone();
        entries.reverse();
        entries
    }

    /// Power-off attempts (refusals excluded) in the trailing window,
    /// across all targets. Drives the storm gate.
    pub fn power_off_attempts_within(&self, window: Duration) -> usize {
        let cutoff = unix_millis().saturating_sub(window.as_millis() as u64);
        self.entries
            .iter()
            .filter(|e| e.action == FenceAction::PowerOff && !is_refusal(e))
            .filter(|e| e.timestamp >= cutoff)
            .count()
    }

    /// When the given target was last actually fenced, in ms since epoch.
    pub fn last_power_off_attempt(&self, target: &str) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.node == target && e.action == FenceAction::PowerOff && !is_refusal(e))
            .map(|e| e.timestamp)
    }
}

/// Refused fences are journaled too but must not count against the storm
/// or cooldown gates; they are marked by their reason prefix.
pub const REFUSAL_PREFIX: &str = "refused: ";

fn is_refusal(record: &FenceRecord) -> bool {
    record.reason.starts_with(REFUSAL_PREFIX)
}

#[cfg(test)]
mod tests {
    use vigil_protocol::control::FenceInitiator;

    use super::*;

    fn record(node: &str, age: Duration, reason: &str) -> FenceRecord {
        FenceRecord {
            node: node.to_string(),
            action: FenceAction::PowerOff,
            success: true,
            reason: reason.to_string(),
            timestamp: unix_millis() - age.as_millis() as u64,
            duration_ms: 1200,
            initiated_by: FenceInitiator::Automatic,
        }
    }

    #[test]
    fn journal_round_trips_and_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fence-history.json");

        let mut history = FenceHistory::load(path.clone());
        history.append(record("ns3", Duration::ZERO, "node left"));
        drop(history);

        let history = FenceHistory::load(path);
        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].node, "ns3");
    }

    #[test]
    fn corrupt_journal_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fence-history.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let history = FenceHistory::load(path);
        assert!(history.snapshot().is_empty());
    }

    #[test]
    fn bound_discards_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fence-history.json");
        let mut history = FenceHistory::with_max(path, 3);
        for i in 0..5 {
            history.append(record(&format!("n{i}"), Duration::ZERO, "test"));
        }
        let nodes: Vec<String> = history.snapshot().into_iter().map(|e| e.node).collect();
        assert_eq!(nodes, vec!["n4", "n3", "n2"]);
    }

    #[test]
    fn storm_window_ignores_old_and_refused_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = FenceHistory::load(dir.path().join("h.json"));
        history.append(record("ns2", Duration::from_secs(400), "old"));
        history.append(record("ns2", Duration::from_secs(100), "node left"));
        history.append(record("ns3", Duration::from_secs(50), "node left"));
        history.append(record("ns3", Duration::from_secs(10), "refused: storm"));

        assert_eq!(history.power_off_attempts_within(Duration::from_secs(300)), 2);
        assert!(history.last_power_off_attempt("ns3").is_some());
        assert!(history.last_power_off_attempt("ns9").is_none());
    }
}
