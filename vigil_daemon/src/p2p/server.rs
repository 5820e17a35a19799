//! The plane's HTTP server, bound on the overlay interface. Admission is
//! source-IP based with a body/query shared key on the sensitive routes;
//! anything unauthorised gets a bare 404.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use vigil_protocol::p2p::{AddPeerRequest, MeshPeerEntry, PeerState, SyncMembersRequest};

use super::allowlist::AllowList;
use super::http::{Request, Response, ServerCodec};
use super::statefile::NodeStateFile;
use super::{LocalState, propagate};
use crate::cluster::corosync::{Corosync, next_node_id};
use crate::mesh::MeshManager;
use crate::unix_millis;

/// How long one connection may take to deliver its single request.
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// Everything the handlers (and the propagation protocol) need.
pub struct PlaneContext {
    pub local_name: String,
    pub cluster_name: String,
    pub auth_key: String,
    pub p2p_port: u16,
    pub request_timeout: Duration,
    pub allowlist: Arc<AllowList>,
    pub local_state: watch::Receiver<LocalState>,
    pub mesh: Arc<MeshManager>,
    pub corosync: Arc<Corosync>,
    pub state_file: Arc<NodeStateFile>,
    /// Latest polled view of each remote peer, maintained by the poller.
    pub peer_states: Mutex<HashMap<String, PeerState>>,
}

impl PlaneContext {
    /// Names of remote peers currently reporting standby.
    pub fn standby_peers(&self) -> Vec<String> {
        self.peer_states
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, state)| state.standby)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

pub struct PlaneServer {
    local_addr: SocketAddr,
    task: Option<JoinHandle<()>>,
}

impl PlaneServer {
    pub async fn bind(
        bind_ip: IpAddr,
        port: u16,
        ctx: Arc<PlaneContext>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((bind_ip, port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "p2p plane bound");
        let task = tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "p2p accept failed");
                        continue;
                    }
                };
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    let served = tokio::time::timeout(
                        REQUEST_DEADLINE,
                        serve_connection(stream, peer_addr, ctx),
                    )
                    .await;
                    if served.is_err() {
                        debug!(peer = %peer_addr, "p2p connection timed out");
                    }
                });
            }
        });
        Ok(Self {
            local_addr,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PlaneServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    ctx: Arc<PlaneContext>,
) {
    let mut framed = Framed::new(stream, ServerCodec);
    let request = match framed.next().await {
        Some(Ok(request)) => request,
        Some(Err(error)) => {
            debug!(peer = %peer_addr, %error, "bad p2p request");
            let _ = framed.send(Response::bad_request()).await;
            return;
        }
        None => return,
    };
    let response = dispatch(request, peer_addr.ip(), ctx).await;
    if let Err(error) = framed.send(response).await {
        debug!(peer = %peer_addr, %error, "p2p response not delivered");
    }
}

async fn dispatch(request: Request, peer_ip: IpAddr, ctx: Arc<PlaneContext>) -> Response {
    let ip_allowed = ctx.allowlist.is_allowed(peer_ip);
    let query_key_ok = request.query.get("authKey").map(String::as_str) == Some(ctx.auth_key.as_str());

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/state") if ip_allowed => {
            let local = ctx.local_state.borrow().clone();
            Response::json(&PeerState {
                name: ctx.local_name.clone(),
                standby: local.standby,
                is_leader: local.is_leader,
                timestamp: unix_millis(),
            })
        }
        ("GET", "/health") if ip_allowed => Response::json(&serde_json::json!({"status": "ok"})),
        ("POST", "/add-peer") if ip_allowed => handle_add_peer(&request, ctx).await,
        ("GET", "/corosync-nodes") if query_key_ok => match ctx.corosync.configured_members() {
            Ok(members) => Response::json(&members),
            Err(error) => {
                warn!(%error, "could not read member list");
                Response::json(&serde_json::json!({"success": false, "error": error.to_string()}))
            }
        },
        ("GET", "/mesh-peers") if query_key_ok => Response::json(&ctx.mesh.list_peers()),
        ("POST", "/sync-corosync") => handle_sync_members(&request, ctx),
        // Unauthorised and unknown both fall through to the same 404.
        _ => Response::not_found(),
    }
}

async fn handle_add_peer(request: &Request, ctx: Arc<PlaneContext>) -> Response {
    let body: AddPeerRequest = match request.json_body() {
        Ok(body) => body,
        Err(_) => return Response::bad_request(),
    };
    if body.auth_key != ctx.auth_key {
        return Response::not_found();
    }
    let entry = MeshPeerEntry {
        name: body.name.clone(),
        public_key: body.public_key.clone(),
        overlay_ip: body.overlay_ip.clone(),
        endpoint: body.endpoint.clone(),
    };
    if let Err(error) = ctx.mesh.ensure_peer(entry.clone()).await {
        warn!(peer = %body.name, %error, "could not configure mesh peer");
        return Response::json(&serde_json::json!({
            "success": false,
            "error": error.to_string(),
        }));
    }

    // Extend the corosync nodelist under the file lock; an existing entry
    // keeps its node-id (ids are monotonic, never reused).
    let node_id = {
        let mut members = ctx.corosync.configured_members().unwrap_or_default();
        match members.iter().find(|m| m.name == body.name) {
            Some(existing) => existing.node_id,
            None => {
                let node_id = next_node_id(&members);
                members.push(vigil_protocol::p2p::MemberEntry {
                    node_id,
                    name: body.name.clone(),
                    addr: body.overlay_ip.clone(),
                });
                if let Err(error) = ctx.corosync.write_members(&ctx.cluster_name, &members) {
                    warn!(%error, "could not extend member list");
                }
                node_id
            }
        }
    };
    ctx.state_file.add_peer(&body.name);
    // The joiner polls us from its overlay address before the next
    // membership snapshot refreshes the permanent set.
    if let Ok(ip) = body.overlay_ip.parse::<IpAddr>() {
        ctx.allowlist.admit_temporarily(ip);
    }

    if !body.propagated {
        info!(peer = %body.name, node_id, "new peer registered, propagating");
        tokio::spawn(propagate::propagate_new_peer(Arc::clone(&ctx), entry));
    } else {
        debug!(peer = %body.name, node_id, "relayed peer registered");
    }
    Response::json(&serde_json::json!({"success": true, "nodeId": node_id}))
}

fn handle_sync_members(request: &Request, ctx: Arc<PlaneContext>) -> Response {
    let body: SyncMembersRequest = match request.json_body() {
        Ok(body) => body,
        Err(_) => return Response::bad_request(),
    };
    if body.auth_key != ctx.auth_key {
        return Response::not_found();
    }
    let local = ctx.corosync.configured_members().unwrap_or_default();
    // The merge is monotonic: only a strictly larger list replaces ours.
    // An equal-length list with different members keeps the local copy;
    // reconciling that by hand is an operator call.
    if body.members.len() > local.len() {
        if let Err(error) = ctx.corosync.write_members(&ctx.cluster_name, &body.members) {
            warn!(%error, "could not apply synced member list");
            return Response::json(&serde_json::json!({
                "success": false,
                "error": error.to_string(),
            }));
        }
        info!(
            from = local.len(),
            to = body.members.len(),
            "member list extended by sync"
        );
        Response::json(&serde_json::json!({"success": true, "message": "accepted"}))
    } else {
        if body.members.len() == local.len() && body.members != local {
            warn!("sync offered an equal-length but different member list, keeping local");
        }
        Response::json(&serde_json::json!({"success": true, "message": "kept local"}))
    }
}
