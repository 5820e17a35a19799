//! Bodies exchanged on the peer-to-peer plane (JSON over the overlay HTTP
//! server).

use serde::{Deserialize, Serialize};

/// `GET /state` reply: the remote node's view of itself.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerState {
    pub name: String,
    pub standby: bool,
    pub is_leader: bool,
    /// Milliseconds since the UNIX epoch at the responding node.
    pub timestamp: u64,
}

/// `POST /add-peer` body: register a new overlay peer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddPeerRequest {
    pub name: String,
    pub public_key: String,
    pub overlay_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub auth_key: String,
    /// Set when this request is a relay from another member, which stops
    /// the recipient from re-propagating and looping forever.
    #[serde(default)]
    pub propagated: bool,
}

/// One corosync nodelist entry as exchanged by `/corosync-nodes` and
/// `/sync-corosync`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MemberEntry {
    pub node_id: u32,
    pub name: String,
    pub addr: String,
}

/// `POST /sync-corosync` body.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMembersRequest {
    pub auth_key: String,
    pub members: Vec<MemberEntry>,
}

/// `GET /mesh-peers` reply entry: the local view of one overlay peer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MeshPeerEntry {
    pub name: String,
    pub public_key: String,
    pub overlay_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_field_names_are_camel_case() {
        let req = AddPeerRequest {
            name: "ns3".to_string(),
            public_key: "k".to_string(),
            overlay_ip: "10.99.0.3".to_string(),
            endpoint: None,
            auth_key: "a".to_string(),
            propagated: false,
        };
        let line = serde_json::to_string(&req).unwrap();
        assert!(line.contains("publicKey"));
        assert!(line.contains("overlayIp"));
        assert!(line.contains("authKey"));
    }

    #[test]
    fn propagated_defaults_to_false() {
        let req: AddPeerRequest = serde_json::from_str(
            r#"{"name":"n","publicKey":"k","overlayIp":"10.99.0.9","authKey":"a"}"#,
        )
        .unwrap();
        assert!(!req.propagated);
    }
}
