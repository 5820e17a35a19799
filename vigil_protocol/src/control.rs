//! Control-socket protocol: newline-delimited JSON, one request per
//! connection, single JSON response.

use serde::{Deserialize, Serialize};

/// A command sent to the daemon over the local control socket.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlRequest {
    /// Best-effort snapshot of node and cluster state. Always succeeds.
    Status,
    /// Per-target health monitor results.
    Health,
    /// Declared VIPs, services and constraints with their activation state.
    Resources,
    /// Put this node into standby (releases leadership).
    Standby,
    /// Leave standby.
    Unstandby,
    /// Ask the current leader to step down so another node takes over.
    Failover {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Re-read the configuration file.
    Reload,
    /// Fencing driver status and gate state.
    StonithStatus,
    /// Manually fence a node (bypasses the grace and storm gates only).
    StonithFence { node: String },
    /// Manually power a fenced node back on.
    StonithUnfence { node: String },
    /// The persisted fence history, newest first.
    StonithHistory,
}

/// Response envelope for every control command.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn ok_with_message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn ok_with_data(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// What a fence operation did to the target.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FenceAction {
    PowerOff,
    PowerOn,
}

/// Who asked for the fence.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FenceInitiator {
    Automatic,
    Manual,
}

/// One entry of the persisted fence history. The on-disk journal is a JSON
/// array of these, newest last; `stonith-history` returns them newest first.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FenceRecord {
    pub node: String,
    pub action: FenceAction,
    pub success: bool,
    pub reason: String,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: u64,
    pub duration_ms: u64,
    pub initiated_by: FenceInitiator,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let reqs = [
            ControlRequest::Status,
            ControlRequest::Failover { target: None },
            ControlRequest::Failover {
                target: Some("ns2".to_string()),
            },
            ControlRequest::StonithFence {
                node: "ns3".to_string(),
            },
        ];
        for req in reqs {
            let line = serde_json::to_string(&req).unwrap();
            let back: ControlRequest = serde_json::from_str(&line).unwrap();
            assert_eq!(req, back);
        }
    }

    #[test]
    fn request_uses_kebab_case_tags() {
        let line = serde_json::to_string(&ControlRequest::StonithHistory).unwrap();
        assert!(line.contains("stonith-history"), "got {line}");
    }

    #[test]
    fn response_omits_empty_fields() {
        let line = serde_json::to_string(&ControlResponse::ok()).unwrap();
        assert_eq!(line, r#"{"success":true}"#);
    }
}
