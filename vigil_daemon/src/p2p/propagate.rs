//! Peer propagation: after a first-hand `/add-peer`, relay the new peer
//! to every existing member, teach the new peer about the existing ones,
//! and push the grown member list out. Arrival order does not matter;
//! the monotonic merge on `/sync-corosync` makes the mesh converge.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use vigil_protocol::p2p::{AddPeerRequest, MeshPeerEntry, SyncMembersRequest};

use super::client;
use super::http::Request;
use super::server::PlaneContext;

/// Handshake wait before falling back to an existing peer's public
/// endpoint.
const EXISTING_PEER_HANDSHAKE_BOUND: Duration = Duration::from_secs(15);
/// The new peer gets longer; its tunnel is still coming up.
const NEW_PEER_HANDSHAKE_BOUND: Duration = Duration::from_secs(30);
const PROPAGATION_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn propagate_new_peer(ctx: Arc<PlaneContext>, new_peer: MeshPeerEntry) {
    ctx.state_file.begin_propagation();
    let existing: Vec<MeshPeerEntry> = ctx
        .mesh
        .list_peers()
        .into_iter()
        .filter(|p| p.name != new_peer.name)
        .collect();

    // Relay the new peer to every existing member.
    for peer in &existing {
        let Some(addr) = reach(&ctx, peer, EXISTING_PEER_HANDSHAKE_BOUND).await else {
            warn!(peer = %peer.name, "unreachable during propagation, skipping");
            continue;
        };
        post_add_peer(&ctx, addr, peer, &new_peer).await;
    }

    // Teach the new peer about every existing member.
    if !existing.is_empty() {
        match reach(&ctx, &new_peer, NEW_PEER_HANDSHAKE_BOUND).await {
            Some(addr) => {
                for peer in &existing {
                    post_add_peer(&ctx, addr, &new_peer, peer).await;
                }
            }
            None => warn!(peer = %new_peer.name, "new peer unreachable, relying on later sync"),
        }
    }

    // Push the grown member list to the existing members.
    let members = ctx.corosync.configured_members().unwrap_or_default();
    let sync = SyncMembersRequest {
        auth_key: ctx.auth_key.clone(),
        members,
    };
    for peer in &existing {
        let Some(addr) = reach(&ctx, peer, EXISTING_PEER_HANDSHAKE_BOUND).await else {
            continue;
        };
        let request = Request::post_json("/sync-corosync", &sync);
        match client::fetch(addr, request, PROPAGATION_REQUEST_TIMEOUT).await {
            Ok(response) if response.is_success() => {
                debug!(peer = %peer.name, "member list synced")
            }
            Ok(response) => warn!(peer = %peer.name, status = response.status, "sync rejected"),
            Err(error) => warn!(peer = %peer.name, %error, "sync failed"),
        }
    }

    ctx.state_file.complete_propagation();
    info!(peer = %new_peer.name, peers = existing.len() + 1, "propagation complete");
}

/// Pick the address to talk to `peer` on: its overlay address once the
/// handshake is observable, otherwise its public endpoint (if any) with
/// the plane port.
async fn reach(
    ctx: &PlaneContext,
    peer: &MeshPeerEntry,
    handshake_bound: Duration,
) -> Option<SocketAddr> {
    if ctx.mesh.wait_for_handshake(&peer.public_key, handshake_bound).await {
        if let Ok(ip) = peer.overlay_ip.parse::<IpAddr>() {
            return Some(SocketAddr::new(ip, ctx.p2p_port));
        }
    }
    let endpoint = peer.endpoint.as_ref()?;
    let host = endpoint.rsplit_once(':').map(|(h, _)| h).unwrap_or(endpoint);
    host.parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, ctx.p2p_port))
}

async fn post_add_peer(
    ctx: &PlaneContext,
    addr: SocketAddr,
    recipient: &MeshPeerEntry,
    subject: &MeshPeerEntry,
) {
    let body = AddPeerRequest {
        name: subject.name.clone(),
        public_key: subject.public_key.clone(),
        overlay_ip: subject.overlay_ip.clone(),
        endpoint: subject.endpoint.clone(),
        auth_key: ctx.auth_key.clone(),
        propagated: true,
    };
    let request = Request::post_json("/add-peer", &body);
    match client::fetch(addr, request, PROPAGATION_REQUEST_TIMEOUT).await {
        Ok(response) if response.is_success() => {
            debug!(to = %recipient.name, subject = %subject.name, "peer relayed");
        }
        Ok(response) => {
            warn!(to = %recipient.name, subject = %subject.name, status = response.status, "peer relay rejected");
        }
        Err(error) => {
            warn!(to = %recipient.name, subject = %subject.name, %error, "peer relay failed");
        }
    }
}
