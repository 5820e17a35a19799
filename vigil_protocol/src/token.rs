//! Join tokens: a base64url-encoded JSON object handed to a joining node,
//! optionally prefixed with the `vigil-join://` URI scheme.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

/// URI scheme a token may be wrapped in.
pub const TOKEN_URI_SCHEME: &str = "vigil-join://";

/// Token versions this build understands.
pub const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u8> = 1..=3;

/// An overlay peer carried inside a v2+ token so the joiner can pre-seed
/// its mesh without a round-trip per member.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenPeer {
    pub name: String,
    pub pubkey: String,
    pub mesh_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// The join token payload.
///
/// `v` is the token format version. Version 1 carries only the initiator
/// contact info; version 2 adds the assigned overlay address and the used-IP
/// set; version 3 adds the full peer list and the initiator name.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinToken {
    pub v: u8,
    pub cluster: String,
    /// Public `host:port` of the initiator's overlay transport.
    pub endpoint: String,
    pub pubkey: String,
    pub authkey: String,
    pub mesh_network: String,
    pub mesh_ip: String,
    pub corosync_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_ips: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<TokenPeer>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_name: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("token is not valid base64url")]
    InvalidEncoding(#[from] base64::DecodeError),
    #[error("token payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("unsupported token version {0}")]
    UnsupportedVersion(u8),
}

impl JoinToken {
    /// Serialize and base64url-encode, without the URI scheme.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("token serialization cannot fail");
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Like [`JoinToken::encode`] but wrapped in `vigil-join://`.
    pub fn encode_uri(&self) -> String {
        format!("{}{}", TOKEN_URI_SCHEME, self.encode())
    }

    /// Decode a token, accepting either the bare base64url form or the
    /// `vigil-join://` form. Rejects versions outside 1..=3.
    pub fn decode(input: &str) -> Result<Self, TokenError> {
        let input = input.trim();
        let payload = input.strip_prefix(TOKEN_URI_SCHEME).unwrap_or(input);
        let raw = URL_SAFE_NO_PAD.decode(payload.as_bytes())?;
        let token: JoinToken = serde_json::from_slice(&raw)?;
        if !SUPPORTED_VERSIONS.contains(&token.v) {
            return Err(TokenError::UnsupportedVersion(token.v));
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(v: u8) -> JoinToken {
        JoinToken {
            v,
            cluster: "lab".to_string(),
            endpoint: "203.0.113.10:51820".to_string(),
            pubkey: "c29tZS1wdWJsaWMta2V5".to_string(),
            authkey: "c2VjcmV0".to_string(),
            mesh_network: "10.99.0.0/24".to_string(),
            mesh_ip: "10.99.0.1".to_string(),
            corosync_port: 5405,
            assigned_ip: (v >= 2).then(|| "10.99.0.3".to_string()),
            used_ips: (v >= 2).then(|| vec!["10.99.0.1".to_string(), "10.99.0.2".to_string()]),
            peers: (v >= 3).then(|| {
                vec![TokenPeer {
                    name: "ns2".to_string(),
                    pubkey: "cGVlci1rZXk".to_string(),
                    mesh_ip: "10.99.0.2".to_string(),
                    endpoint: Some("203.0.113.11:51820".to_string()),
                }]
            }),
            initiator_name: (v >= 3).then(|| "ns1".to_string()),
        }
    }

    #[test]
    fn encode_decode_is_identity_for_all_versions() {
        for v in 1..=3 {
            let token = sample(v);
            assert_eq!(JoinToken::decode(&token.encode()).unwrap(), token);
            assert_eq!(JoinToken::decode(&token.encode_uri()).unwrap(), token);
        }
    }

    #[test]
    fn uri_scheme_prefix_is_applied() {
        let uri = sample(1).encode_uri();
        assert!(uri.starts_with("vigil-join://"));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut token = sample(1);
        token.v = 9;
        let err = JoinToken::decode(&token.encode()).unwrap_err();
        assert!(matches!(err, TokenError::UnsupportedVersion(9)));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(JoinToken::decode("!!!not-base64!!!").is_err());
        let raw = URL_SAFE_NO_PAD.encode(b"{\"not\": \"a token\"}");
        assert!(JoinToken::decode(&raw).is_err());
    }
}
