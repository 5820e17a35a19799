//! WireGuard mesh wrapper: peer add/remove via `wg set`, handshake
//! observation via `wg show`, and overlay config persistence.
//!
//! The `[Interface]` section of the overlay config (private key, address,
//! listen port) is owned by the setup tooling; this module preserves it
//! verbatim and rewrites only the `[Peer]` sections.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};
use vigil_protocol::p2p::MeshPeerEntry;

use crate::command::{CommandError, CommandRunner};
use crate::unix_millis;

const WG: &str = "wg";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// A handshake older than this no longer proves the tunnel is up.
const HANDSHAKE_FRESHNESS: Duration = Duration::from_secs(180);

#[derive(thiserror::Error, Debug)]
pub enum MeshError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("wg {verb} failed: {stderr}")]
    WgFailed { verb: &'static str, stderr: String },
    #[error("cannot access {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct MeshManager {
    runner: Arc<dyn CommandRunner>,
    interface: String,
    config_path: PathBuf,
    /// Peers plus the preserved `[Interface]` preamble of the config.
    state: Mutex<ConfigState>,
}

#[derive(Default)]
struct ConfigState {
    preamble: String,
    peers: Vec<MeshPeerEntry>,
}

impl MeshManager {
    pub fn new(runner: Arc<dyn CommandRunner>, interface: String, config_path: PathBuf) -> Self {
        let state = match std::fs::read_to_string(&config_path) {
            Ok(raw) => parse_config(&raw),
            Err(_) => ConfigState::default(),
        };
        Self {
            runner,
            interface,
            config_path,
            state: Mutex::new(state),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn list_peers(&self) -> Vec<MeshPeerEntry> {
        self.state.lock().unwrap().peers.clone()
    }

    pub fn peer(&self, name: &str) -> Option<MeshPeerEntry> {
        self.state
            .lock()
            .unwrap()
            .peers
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    /// This node's overlay public key.
    pub async fn public_key(&self) -> Result<String, MeshError> {
        let output = self
            .runner
            .run(WG, &["show", &self.interface, "public-key"], COMMAND_TIMEOUT)
            .await?;
        if !output.success() {
            return Err(MeshError::WgFailed {
                verb: "show",
                stderr: output.stderr,
            });
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Add or update a peer on the interface and persist it. Re-adding an
    /// existing peer with the same key refreshes its endpoint.
    pub async fn ensure_peer(&self, peer: MeshPeerEntry) -> Result<(), MeshError> {
        let allowed = format!("{}/32", peer.overlay_ip);
        let mut args = vec![
            "set",
            self.interface.as_str(),
            "peer",
            peer.public_key.as_str(),
            "allowed-ips",
            allowed.as_str(),
        ];
        if let Some(endpoint) = &peer.endpoint {
            args.push("endpoint");
            args.push(endpoint.as_str());
        }
        let output = self.runner.run(WG, &args, COMMAND_TIMEOUT).await?;
        if !output.success() {
            return Err(MeshError::WgFailed {
                verb: "set",
                stderr: output.stderr,
            });
        }
        {
            let mut state = self.state.lock().unwrap();
            state.peers.retain(|p| p.name != peer.name && p.public_key != peer.public_key);
            state.peers.push(peer.clone());
        }
        self.persist()?;
        info!(peer = %peer.name, overlay_ip = %peer.overlay_ip, "mesh peer configured");
        Ok(())
    }

    pub async fn remove_peer(&self, name: &str) -> Result<(), MeshError> {
        let Some(peer) = self.peer(name) else {
            return Ok(());
        };
        let output = self
            .runner
            .run(
                WG,
                &["set", &self.interface, "peer", &peer.public_key, "remove"],
                COMMAND_TIMEOUT,
            )
            .await?;
        if !output.success() {
            return Err(MeshError::WgFailed {
                verb: "set",
                stderr: output.stderr,
            });
        }
        self.state.lock().unwrap().peers.retain(|p| p.name != name);
        self.persist()?;
        info!(peer = %name, "mesh peer removed");
        Ok(())
    }

    /// Wait until a fresh handshake with `public_key` is observable, up to
    /// `bound`. Returns false on timeout; the caller then falls back to
    /// the peer's public endpoint.
    pub async fn wait_for_handshake(&self, public_key: &str, bound: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + bound;
        loop {
            match self.latest_handshake(public_key).await {
                Ok(Some(ts)) => {
                    let age = unix_millis().saturating_sub(ts * 1000);
                    if ts > 0 && age < HANDSHAKE_FRESHNESS.as_millis() as u64 {
                        debug!(public_key, "handshake observed");
                        return true;
                    }
                }
                Ok(None) => {}
                Err(error) => warn!(%error, "handshake check failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(HANDSHAKE_POLL_INTERVAL).await;
        }
    }

    /// Unix seconds of the most recent handshake, if the peer is known to
    /// the kernel at all.
    async fn latest_handshake(&self, public_key: &str) -> Result<Option<u64>, MeshError> {
        let output = self
            .runner
            .run(
                WG,
                &["show", &self.interface, "latest-handshakes"],
                COMMAND_TIMEOUT,
            )
            .await?;
        if !output.success() {
            return Err(MeshError::WgFailed {
                verb: "show",
                stderr: output.stderr,
            });
        }
        for line in output.stdout.lines() {
            let mut parts = line.split_whitespace();
            if parts.next() == Some(public_key) {
                return Ok(parts.next().and_then(|ts| ts.parse().ok()));
            }
        }
        Ok(None)
    }

    fn persist(&self) -> Result<(), MeshError> {
        let rendered = {
            let state = self.state.lock().unwrap();
            render_config(&state)
        };
        crate::fslock::replace_locked(&self.config_path, rendered.as_bytes()).map_err(|source| {
            MeshError::ConfigIo {
                path: self.config_path.clone(),
                source,
            }
        })
    }
}

fn parse_config(raw: &str) -> ConfigState {
    let mut preamble = String::new();
    let mut peers = Vec::new();
    let mut in_peer = false;
    let mut current = MeshPeerEntry {
        name: String::new(),
        public_key: String::new(),
        overlay_ip: String::new(),
        endpoint: None,
    };
    let mut flush = |current: &mut MeshPeerEntry, peers: &mut Vec<MeshPeerEntry>| {
        if !current.public_key.is_empty() {
            peers.push(current.clone());
        }
        *current = MeshPeerEntry {
            name: String::new(),
            public_key: String::new(),
            overlay_ip: String::new(),
            endpoint: None,
        };
    };
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed == "[Peer]" {
            flush(&mut current, &mut peers);
            in_peer = true;
            continue;
        }
        if !in_peer {
            preamble.push_str(line);
            preamble.push('\n');
            continue;
        }
        if let Some(name) = trimmed.strip_prefix("# Name =") {
            current.name = name.trim().to_string();
        } else if let Some((key, value)) = trimmed.split_once('=') {
            let value = value.trim();
            match key.trim() {
                "PublicKey" => current.public_key = value.to_string(),
                "AllowedIPs" => {
                    current.overlay_ip = value.split('/').next().unwrap_or(value).to_string();
                }
                "Endpoint" => current.endpoint = Some(value.to_string()),
                _ => {}
            }
        }
    }
    flush(&mut current, &mut peers);
    ConfigState {
        preamble: preamble.trim_end().to_string(),
        peers,
    }
}

fn render_config(state: &ConfigState) -> String {
    let mut out = String::new();
    if !state.preamble.is_empty() {
        out.push_str(&state.preamble);
        out.push('\n');
    }
    for peer in &state.peers {
        out.push('\n');
        out.push_str("[Peer]\n");
        out.push_str(&format!("# Name = {}\n", peer.name));
        out.push_str(&format!("PublicKey = {}\n", peer.public_key));
        out.push_str(&format!("AllowedIPs = {}/32\n", peer.overlay_ip));
        if let Some(endpoint) = &peer.endpoint {
            out.push_str(&format!("Endpoint = {}\n", endpoint));
        }
        out.push_str("PersistentKeepalive = 25\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::FakeRunner;

    const CONFIG: &str = "\
[Interface]
Address = 10.99.0.1/24
ListenPort = 51820
PrivateKey = REDACTED

[Peer]
# Name = ns2
PublicKey = peer2key
AllowedIPs = 10.99.0.2/32
Endpoint = 203.0.113.11:51820
PersistentKeepalive = 25
";

    #[test]
    fn config_parse_and_render_preserve_interface_and_peers() {
        let state = parse_config(CONFIG);
        assert!(state.preamble.contains("PrivateKey = REDACTED"));
        assert_eq!(state.peers.len(), 1);
        assert_eq!(state.peers[0].name, "ns2");
        assert_eq!(state.peers[0].overlay_ip, "10.99.0.2");

        let rendered = render_config(&state);
        let reparsed = parse_config(&rendered);
        assert_eq!(reparsed.peers, state.peers);
        assert!(rendered.contains("PrivateKey = REDACTED"));
    }

    #[tokio::test]
    async fn ensure_peer_sets_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg0.conf");
        std::fs::write(&path, CONFIG).unwrap();

        let runner = Arc::new(FakeRunner::new());
        let mesh = MeshManager::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            "wg0".to_string(),
            path.clone(),
        );
        mesh.ensure_peer(MeshPeerEntry {
            name: "ns3".to_string(),
            public_key: "peer3key".to_string(),
            overlay_ip: "10.99.0.3".to_string(),
            endpoint: Some("203.0.113.12:51820".to_string()),
        })
        .await
        .unwrap();

        let call = &runner.recorded()[0];
        assert!(call.contains("set wg0 peer peer3key allowed-ips 10.99.0.3/32"));
        assert!(call.contains("endpoint 203.0.113.12:51820"));

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("# Name = ns3"));
        assert!(written.contains("# Name = ns2"));
        assert_eq!(mesh.list_peers().len(), 2);
    }

    #[tokio::test]
    async fn handshake_wait_times_out_without_a_fresh_handshake() {
        let runner = Arc::new(FakeRunner::new());
        runner.push_ok("peer3key\t0\n");
        let dir = tempfile::tempdir().unwrap();
        let mesh = MeshManager::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            "wg0".to_string(),
            dir.path().join("wg0.conf"),
        );
        // Unscripted follow-up calls return empty output (peer unknown).
        assert!(!mesh.wait_for_handshake("peer3key", Duration::from_millis(50)).await);
    }
}
