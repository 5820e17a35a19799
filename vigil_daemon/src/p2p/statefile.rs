//! The leader-authoritative node state file tracking the join/propagation
//! lifecycle of the overlay.

use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::unix_millis;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Initializing,
    Collecting,
    Propagating,
    Active,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NodeStateDoc {
    pub phase: Phase,
    pub cluster_name: String,
    pub leader_node: String,
    pub leader_ip: String,
    pub peers: Vec<String>,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagated_at: Option<u64>,
}

pub struct NodeStateFile {
    path: PathBuf,
    doc: Mutex<NodeStateDoc>,
}

impl NodeStateFile {
    /// Load the existing document or initialise a fresh one.
    pub fn open(path: PathBuf, cluster_name: &str, local_name: &str, local_ip: &str) -> Self {
        let doc = std::fs::read(&path)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_else(|| NodeStateDoc {
                phase: Phase::Initializing,
                cluster_name: cluster_name.to_string(),
                leader_node: local_name.to_string(),
                leader_ip: local_ip.to_string(),
                peers: Vec::new(),
                created_at: unix_millis(),
                propagated_at: None,
            });
        Self {
            path,
            doc: Mutex::new(doc),
        }
    }

    pub fn snapshot(&self) -> NodeStateDoc {
        self.doc.lock().unwrap().clone()
    }

    /// First peer moves `initializing` to `collecting`.
    pub fn add_peer(&self, name: &str) {
        let mut doc = self.doc.lock().unwrap();
        if !doc.peers.iter().any(|p| p == name) {
            doc.peers.push(name.to_string());
        }
        if doc.phase == Phase::Initializing {
            doc.phase = Phase::Collecting;
        }
        self.persist(&doc);
    }

    /// Removing the last peer before propagation returns to
    /// `initializing`.
    pub fn remove_peer(&self, name: &str) {
        let mut doc = self.doc.lock().unwrap();
        doc.peers.retain(|p| p != name);
        if doc.peers.is_empty() && doc.phase == Phase::Collecting {
            doc.phase = Phase::Initializing;
        }
        self.persist(&doc);
    }

    pub fn begin_propagation(&self) {
        let mut doc = self.doc.lock().unwrap();
        doc.phase = Phase::Propagating;
        self.persist(&doc);
    }

    pub fn complete_propagation(&self) {
        let mut doc = self.doc.lock().unwrap();
        doc.phase = Phase::Active;
        doc.propagated_at = Some(unix_millis());
        self.persist(&doc);
    }

    /// Remove the file on graceful stop.
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    fn persist(&self, doc: &NodeStateDoc) {
        match serde_json::to_vec_pretty(doc) {
            Ok(raw) => {
                if let Err(error) = crate::fslock::atomic_write(&self.path, &raw) {
                    warn!(path = %self.path.display(), %error, "could not persist node state");
                }
            }
            Err(error) => warn!(%error, "could not serialize node state"),
        }
    }
}
