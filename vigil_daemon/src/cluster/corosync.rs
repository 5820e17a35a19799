//! Corosync wrapper: quorum sampling via `corosync-quorumtool`, member
//! state via `corosync-cmapctl`, and nodelist maintenance in
//! `corosync.conf`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vigil_protocol::p2p::MemberEntry;

use super::{ClusterSnapshot, MemberInfo};
use crate::command::{CommandError, CommandRunner};

const QUORUMTOOL: &str = "corosync-quorumtool";
const CMAPCTL: &str = "corosync-cmapctl";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum MembershipError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("{tool} exited with status {status}: {stderr}")]
    ToolFailed {
        tool: &'static str,
        status: i32,
        stderr: String,
    },
    #[error("could not parse {tool} output: {detail}")]
    Parse { tool: &'static str, detail: String },
    #[error("cannot access {path}: {source}")]
    ConfIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Source of membership/quorum samples. The daemon uses [`Corosync`];
/// tests script a fake.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn sample(&self) -> Result<ClusterSnapshot, MembershipError>;
}

pub struct Corosync {
    runner: Arc<dyn CommandRunner>,
    conf_path: PathBuf,
}

impl Corosync {
    pub fn new(runner: Arc<dyn CommandRunner>, conf_path: PathBuf) -> Self {
        Self { runner, conf_path }
    }

    /// True once the corosync daemon answers the quorum tool at all.
    /// Used by the startup environment check.
    pub async fn is_running(&self) -> bool {
        matches!(
            self.runner.run(QUORUMTOOL, &["-s"], COMMAND_TIMEOUT).await,
            Ok(output) if output.status == 0 || output.status == 1
        )
    }

    /// The configured nodelist, straight from `corosync.conf`.
    pub fn configured_members(&self) -> Result<Vec<MemberEntry>, MembershipError> {
        let text = std::fs::read_to_string(&self.conf_path).map_err(|source| {
            MembershipError::ConfIo {
                path: self.conf_path.clone(),
                source,
            }
        })?;
        Ok(parse_nodelist(&text))
    }

    /// Rewrite `corosync.conf` with the given members, preserving the
    /// cluster name. Serialised against concurrent writers with an
    /// exclusive advisory lock; two-member clusters get `two_node: 1`.
    pub fn write_members(
        &self,
        cluster_name: &str,
        members: &[MemberEntry],
    ) -> Result<(), MembershipError> {
        let rendered = render_conf(cluster_name, members);
        crate::fslock::replace_locked(&self.conf_path, rendered.as_bytes()).map_err(|source| {
            MembershipError::ConfIo {
                path: self.conf_path.clone(),
                source,
            }
        })
    }
}

#[async_trait]
impl MembershipSource for Corosync {
    async fn sample(&self) -> Result<ClusterSnapshot, MembershipError> {
        let quorum = self.runner.run(QUORUMTOOL, &["-s"], COMMAND_TIMEOUT).await?;
        // quorumtool exits 1 when inquorate; both carry a parseable report.
        if quorum.status != 0 && quorum.status != 1 {
            return Err(MembershipError::ToolFailed {
                tool: QUORUMTOOL,
                status: quorum.status,
                stderr: quorum.stderr,
            });
        }
        let report = parse_quorumtool(&quorum.stdout)?;

        let cmap = self
            .runner
            .run(CMAPCTL, &["runtime.members."], COMMAND_TIMEOUT)
            .await?;
        let runtime = if cmap.success() {
            parse_runtime_members(&cmap.stdout)
        } else {
            HashMap::new()
        };

        let configured = self.configured_members().unwrap_or_default();
        let mut members = Vec::with_capacity(configured.len());
        for entry in &configured {
            let state = runtime.get(&entry.node_id);
            members.push(MemberInfo {
                node_id: entry.node_id,
                name: entry.name.clone(),
                overlay_ip: state
                    .and_then(|s| s.ip.clone())
                    .unwrap_or_else(|| entry.addr.clone()),
                online: state.map(|s| s.joined).unwrap_or(false),
            });
        }
        // Members corosync reports but the conf does not yet list (mid-join)
        // still show up, keyed by node-id.
        for (node_id, state) in &runtime {
            if state.joined && !members.iter().any(|m| m.node_id == *node_id) {
                members.push(MemberInfo {
                    node_id: *node_id,
                    name: format!("node{}", node_id),
                    overlay_ip: state.ip.clone().unwrap_or_default(),
                    online: true,
                });
            }
        }
        members.sort_by_key(|m| m.node_id);

        Ok(ClusterSnapshot {
            quorate: report.quorate,
            expected_votes: report.expected_votes,
            total_votes: report.total_votes,
            members,
        })
    }
}

struct QuorumReport {
    quorate: bool,
    expected_votes: u32,
    total_votes: u32,
}

fn parse_quorumtool(stdout: &str) -> Result<QuorumReport, MembershipError> {
    let mut quorate = None;
    let mut expected_votes = None;
    let mut total_votes = None;
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Quorate" => quorate = Some(value.eq_ignore_ascii_case("yes")),
            "Expected votes" => expected_votes = value.parse().ok(),
            "Total votes" => total_votes = value.parse().ok(),
            _ => {}
        }
    }
    match (quorate, expected_votes, total_votes) {
        (Some(quorate), Some(expected_votes), Some(total_votes)) => Ok(QuorumReport {
            quorate,
            expected_votes,
            total_votes,
        }),
        _ => Err(MembershipError::Parse {
            tool: QUORUMTOOL,
            detail: "missing Quorate/Expected votes/Total votes".to_string(),
        }),
    }
}

#[derive(Default)]
struct RuntimeMember {
    ip: Option<String>,
    joined: bool,
}

/// Parse `corosync-cmapctl runtime.members.` lines such as
/// `runtime.members.2.ip (str) = r(0) ip(10.99.0.2)` and
/// `runtime.members.2.status (str) = joined`.
fn parse_runtime_members(stdout: &str) -> HashMap<u32, RuntimeMember> {
    let mut members: HashMap<u32, RuntimeMember> = HashMap::new();
    for line in stdout.lines() {
        let Some(rest) = line.trim().strip_prefix("runtime.members.") else {
            continue;
        };
        let Some((id_str, rest)) = rest.split_once('.') else {
            continue;
        };
        let Ok(node_id) = id_str.parse::<u32>() else {
            continue;
        };
        let Some((field, value)) = rest.split_once('=') else {
            continue;
        };
        let entry = members.entry(node_id).or_default();
        let value = value.trim();
        if field.trim_start().starts_with("status") {
            entry.joined = value == "joined";
        } else if field.trim_start().starts_with("ip") {
            // value looks like `r(0) ip(10.99.0.2)`
            if let Some(start) = value.find("ip(") {
                let tail = &value[start + 3..];
                if let Some(end) = tail.find(')') {
                    entry.ip = Some(tail[..end].to_string());
                }
            }
        }
    }
    members
}

/// Extract `node { ... }` entries from a corosync.conf nodelist.
pub fn parse_nodelist(text: &str) -> Vec<MemberEntry> {
    let mut members = Vec::new();
    let mut in_node = false;
    let mut name = None;
    let mut node_id = None;
    let mut addr = None;
    for line in text.lines() {
        let line = line.trim();
        // "nodelist {" also starts with "node"; only the entries count.
        if (line.starts_with("node ") || line.starts_with("node{")) && line.ends_with('{') {
            in_node = true;
            name = None;
            node_id = None;
            addr = None;
        } else if in_node && line.starts_with('}') {
            if let (Some(name), Some(node_id), Some(addr)) =
                (name.take(), node_id.take(), addr.take())
            {
                members.push(MemberEntry {
                    node_id,
                    name,
                    addr,
                });
            }
            in_node = false;
        } else if in_node {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim() {
                "name" => name = Some(value),
                "nodeid" => node_id = value.parse().ok(),
                "ring0_addr" => addr = Some(value),
                _ => {}
            }
        }
    }
    members.sort_by_key(|m| m.node_id);
    members
}

/// Render a complete corosync.conf for the given members.
pub fn render_conf(cluster_name: &str, members: &[MemberEntry]) -> String {
    let mut out = String::new();
    out.push_str("totem {\n    version: 2\n");
    out.push_str(&format!("    cluster_name: {}\n", cluster_name));
    out.push_str("    transport: knet\n    crypto_cipher: aes256\n    crypto_hash: sha256\n}\n\n");
    out.push_str("nodelist {\n");
    for member in members {
        out.push_str("    node {\n");
        out.push_str(&format!("        name: {}\n", member.name));
        out.push_str(&format!("        nodeid: {}\n", member.node_id));
        out.push_str(&format!("        ring0_addr: {}\n", member.addr));
        out.push_str("    }\n");
    }
    out.push_str("}\n\nquorum {\n    provider: corosync_votequorum\n");
    if members.len() == 2 {
        out.push_str("    two_node: 1\n");
    }
    out.push_str("}\n\nlogging {\n    to_syslog: yes\n}\n");
    out
}

/// Node-ids are assigned at join and never reused: next is max + 1.
pub fn next_node_id(members: &[MemberEntry]) -> u32 {
    members.iter().map(|m| m.node_id).max().unwrap_or(0) + 1
}
