//! Daemon configuration: YAML schema, defaults, and load-time validation.
//!
//! Times in the file may be given in seconds (`interval`, `timeout`) or
//! milliseconds (`intervalMs`, `timeoutMs`); the canonical internal unit is
//! milliseconds. VIP addresses accept the `"x.x.x.x/cidr"` shorthand.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub node: NodeConfig,
    #[serde(default)]
    pub vips: Vec<VipConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub health_checks: Vec<HealthCheckConfig>,
    #[serde(default)]
    pub constraints: Vec<ConstraintConfig>,
    #[serde(default)]
    pub stonith: StonithConfig,
    #[serde(default)]
    pub p2p: P2pConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub quorum_required: bool,
    #[serde(default = "default_failover_delay_ms")]
    pub failover_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeConfig {
    pub name: String,
    /// Administrative weight shown in `status`; leader election is decided
    /// by node-id alone.
    #[serde(default)]
    pub priority: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VipConfig {
    pub name: String,
    pub ip: String,
    #[serde(default)]
    pub cidr: Option<u8>,
    pub interface: String,
}

/// A VIP with the address shorthand resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vip {
    pub name: String,
    pub ip: String,
    pub cidr: u8,
    pub interface: String,
}

impl VipConfig {
    /// Resolve `"10.0.0.5/20"` shorthand against the optional explicit
    /// `cidr` field. Disagreement between the two is a load error.
    pub fn resolve(&self) -> Result<Vip, ConfigError> {
        let (ip, embedded) = match self.ip.split_once('/') {
            Some((ip, suffix)) => {
                let cidr: u8 = suffix.parse().map_err(|_| {
                    invalid(format!("vip {}: bad cidr suffix in {:?}", self.name, self.ip))
                })?;
                (ip.to_string(), Some(cidr))
            }
            None => (self.ip.clone(), None),
        };
        let cidr = match (embedded, self.cidr) {
            (Some(a), Some(b)) if a != b => {
                return Err(invalid(format!(
                    "vip {}: cidr {} conflicts with address suffix /{}",
                    self.name, b, a
                )));
            }
            (Some(a), _) => a,
            (None, Some(b)) => b,
            (None, None) => {
                return Err(invalid(format!(
                    "vip {}: no cidr given (use `cidr:` or an address suffix)",
                    self.name
                )));
            }
        };
        if ip.parse::<std::net::IpAddr>().is_err() {
            return Err(invalid(format!("vip {}: {:?} is not an IP address", self.name, ip)));
        }
        if cidr > 32 {
            return Err(invalid(format!("vip {}: cidr /{} out of range", self.name, cidr)));
        }
        Ok(Vip {
            name: self.name.clone(),
            ip,
            cidr,
            interface: self.interface.clone(),
        })
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    pub unit: String,
    #[serde(default)]
    pub healthcheck: Option<ProbeConfig>,
}

/// A standalone health check; unlike service probes these run on every
/// node, leader or not.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    pub name: String,
    #[serde(flatten)]
    pub probe: ProbeConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    #[serde(flatten)]
    pub target: ProbeTarget,
    /// Seconds; superseded by `intervalMs` when both are present.
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    /// Seconds; superseded by `timeoutMs` when both are present.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_failures_before_unhealthy")]
    pub failures_before_unhealthy: u32,
    #[serde(default = "default_successes_before_healthy")]
    pub successes_before_healthy: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeTarget {
    Http { url: String },
    Tcp { host: String, port: u16 },
    Systemd { unit: String },
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(
            self.interval_ms
                .or(self.interval.map(|s| s * 1000))
                .unwrap_or(DEFAULT_PROBE_INTERVAL_MS),
        )
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(
            self.timeout_ms
                .or(self.timeout.map(|s| s * 1000))
                .unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
        )
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConstraintConfig {
    /// `first` must be started before `then` (and stopped after it).
    Order { first: String, then: String },
    /// `a` and `b` must be active on the same node. With a single-leader
    /// model this is satisfied structurally; kept for validation and
    /// operator visibility.
    Colocation { a: String, b: String },
}

// serde_yaml's derive-based externally tagged enum support only accepts a
// `!Tag` form, not the plain `order: {..}` single-key-map form used by this
// config schema; deserialize manually so that shape works.
impl<'de> Deserialize<'de> for ConstraintConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ConstraintVisitor;

        impl<'de> serde::de::Visitor<'de> for ConstraintVisitor {
            type Value = ConstraintConfig;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a map with a single key `order` or `colocation`")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let key: String = map
                    .next_key()?
                    .ok_or_else(|| serde::de::Error::custom("expected a constraint variant key"))?;
                let value = match key.as_str() {
                    "order" => {
                        #[derive(Deserialize)]
                        struct Order {
                            first: String,
                            then: String,
                        }
                        let Order { first, then } = map.next_value()?;
                        ConstraintConfig::Order { first, then }
                    }
                    "colocation" => {
                        #[derive(Deserialize)]
                        struct Colocation {
                            a: String,
                            b: String,
                        }
                        let Colocation { a, b } = map.next_value()?;
                        ConstraintConfig::Colocation { a, b }
                    }
                    other => {
                        return Err(serde::de::Error::unknown_variant(
                            other,
                            &["order", "colocation"],
                        ));
                    }
                };
                if map.next_key::<String>()?.is_some() {
                    return Err(serde::de::Error::custom(
                        "constraint map must have exactly one key",
                    ));
                }
                Ok(value)
            }
        }

        deserializer.deserialize_map(ConstraintVisitor)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StonithConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub driver: Option<DriverConfig>,
    /// Cluster node name → identifier the driver understands (VM id, URL
    /// template key, ...).
    #[serde(default)]
    pub node_mapping: BTreeMap<String, String>,
    #[serde(default = "default_startup_grace_secs")]
    pub startup_grace_period_secs: u64,
    #[serde(default = "default_min_delay_between_fence_secs")]
    pub min_delay_between_fence_secs: u64,
    #[serde(default = "default_max_fences_per_5_min")]
    pub max_fences_per_5_min: usize,
    #[serde(default = "default_fence_delay_on_node_left_secs")]
    pub fence_delay_on_node_left_secs: u64,
}

// `#[derive(Default)]` would zero the numeric fields instead of using the
// per-field serde defaults above; keep them in sync so an absent `stonith:`
// key behaves the same as an empty `stonith: {}` one.
impl Default for StonithConfig {
    fn default() -> Self {
        StonithConfig {
            enabled: false,
            driver: None,
            node_mapping: BTreeMap::new(),
            startup_grace_period_secs: default_startup_grace_secs(),
            min_delay_between_fence_secs: default_min_delay_between_fence_secs(),
            max_fences_per_5_min: default_max_fences_per_5_min(),
            fence_delay_on_node_left_secs: default_fence_delay_on_node_left_secs(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum DriverConfig {
    /// REST hypervisor API (node mapping values are VM identifiers).
    Hypervisor {
        api_url: String,
        token: String,
        #[serde(default = "default_driver_retries")]
        retries: u32,
        #[serde(default = "default_driver_retry_delay_ms")]
        retry_delay_ms: u64,
    },
    /// Generic HTTP templates; `{node}` in a template is replaced by the
    /// node-mapping value.
    Http {
        power_off_url: String,
        power_on_url: String,
        #[serde(default)]
        status_url: Option<String>,
        #[serde(default)]
        method: Option<String>,
        #[serde(default = "default_driver_retries")]
        retries: u32,
        #[serde(default = "default_driver_retry_delay_ms")]
        retry_delay_ms: u64,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct P2pConfig {
    /// Overlay address to bind; defaults to the node's mesh address at
    /// runtime when unset.
    #[serde(default)]
    pub bind_ip: Option<String>,
    #[serde(default = "default_p2p_port")]
    pub port: u16,
    #[serde(default = "default_p2p_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_p2p_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub auth_key: String,
    #[serde(default = "default_knock_port")]
    pub knock_port: u16,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            bind_ip: None,
            port: default_p2p_port(),
            poll_interval_ms: default_p2p_poll_interval_ms(),
            request_timeout_ms: default_p2p_request_timeout_ms(),
            auth_key: String::new(),
            knock_port: default_knock_port(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MeshConfig {
    #[serde(default = "default_mesh_interface")]
    pub interface: String,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    /// Overlay address of this node, e.g. `10.99.0.1`.
    #[serde(default)]
    pub address: Option<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            interface: default_mesh_interface(),
            config_path: None,
            address: None,
        }
    }
}

impl MeshConfig {
    pub fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/etc/wireguard/{}.conf", self.interface)))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,
    #[serde(default = "default_fence_history")]
    pub fence_history: PathBuf,
    #[serde(default = "default_node_state")]
    pub node_state: PathBuf,
    #[serde(default = "default_corosync_conf")]
    pub corosync_conf: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            control_socket: default_control_socket(),
            fence_history: default_fence_history(),
            node_state: default_node_state(),
            corosync_conf: default_corosync_conf(),
        }
    }
}

pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;

fn default_true() -> bool {
    true
}
fn default_failover_delay_ms() -> u64 {
    3_000
}
fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_failures_before_unhealthy() -> u32 {
    3
}
fn default_successes_before_healthy() -> u32 {
    2
}
fn default_startup_grace_secs() -> u64 {
    120
}
fn default_min_delay_between_fence_secs() -> u64 {
    60
}
fn default_max_fences_per_5_min() -> usize {
    2
}
fn default_fence_delay_on_node_left_secs() -> u64 {
    10
}
fn default_driver_retries() -> u32 {
    3
}
fn default_driver_retry_delay_ms() -> u64 {
    1_000
}
fn default_p2p_port() -> u16 {
    7777
}
fn default_p2p_poll_interval_ms() -> u64 {
    5_000
}
fn default_p2p_request_timeout_ms() -> u64 {
    2_000
}
fn default_knock_port() -> u16 {
    51_821
}
fn default_mesh_interface() -> String {
    "wg0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_pid_file() -> PathBuf {
    PathBuf::from("/run/vigil/vigild.pid")
}
fn default_control_socket() -> PathBuf {
    PathBuf::from("/run/vigil/control.sock")
}
fn default_fence_history() -> PathBuf {
    PathBuf::from("/var/lib/vigil/fence-history.json")
}
fn default_node_state() -> PathBuf {
    PathBuf::from("/var/lib/vigil/node-state.json")
}
fn default_corosync_conf() -> PathBuf {
    PathBuf::from("/etc/corosync/corosync.conf")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolved VIP declarations (shorthand applied). Call sites can rely
    /// on this never failing after [`Config::validate`] has passed.
    pub fn resolved_vips(&self) -> Vec<Vip> {
        self.vips
            .iter()
            .map(|v| v.resolve().expect("validated at load"))
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.poll_interval_ms)
    }

    pub fn failover_delay(&self) -> Duration {
        Duration::from_millis(self.cluster.failover_delay_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.name.is_empty() {
            return Err(invalid("cluster.name must not be empty"));
        }
        if self.node.name.is_empty() {
            return Err(invalid("node.name must not be empty"));
        }
        if self.cluster.poll_interval_ms == 0 {
            return Err(invalid("cluster.pollIntervalMs must be positive"));
        }

        let mut resource_names = std::collections::HashSet::new();
        for vip in &self.vips {
            vip.resolve()?;
            if !resource_names.insert(vip.name.as_str()) {
                return Err(invalid(format!("duplicate resource name {:?}", vip.name)));
            }
        }
        for service in &self.services {
            if !resource_names.insert(service.name.as_str()) {
                return Err(invalid(format!("duplicate resource name {:?}", service.name)));
            }
            if let Some(probe) = &service.healthcheck {
                validate_probe(&service.name, probe)?;
            }
        }
        for check in &self.health_checks {
            validate_probe(&check.name, &check.probe)?;
        }

        for constraint in &self.constraints {
            let (a, b) = match constraint {
                ConstraintConfig::Order { first, then } => (first, then),
                ConstraintConfig::Colocation { a, b } => (a, b),
            };
            for endpoint in [a, b] {
                if !resource_names.contains(endpoint.as_str()) {
                    return Err(invalid(format!(
                        "constraint references undeclared resource {:?}",
                        endpoint
                    )));
                }
            }
        }

        if self.stonith.enabled {
            if self.stonith.driver.is_none() {
                return Err(invalid("stonith.enabled requires stonith.driver"));
            }
            if self.stonith.node_mapping.is_empty() {
                return Err(invalid("stonith.enabled requires stonith.nodeMapping"));
            }
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(invalid(format!("logging.level {:?} is not a level", other)));
            }
        }
        Ok(())
    }
}

fn validate_probe(name: &str, probe: &ProbeConfig) -> Result<(), ConfigError> {
    if probe.interval().is_zero() {
        return Err(invalid(format!("health check {:?}: interval must be positive", name)));
    }
    if probe.probe_timeout().is_zero() {
        return Err(invalid(format!("health check {:?}: timeout must be positive", name)));
    }
    if let ProbeTarget::Http { url } = &probe.target {
        // Probes speak plain HTTP/1.1 on the LAN; TLS endpoints should be
        // checked with a tcp probe against the listener instead.
        if !url.starts_with("http://") {
            return Err(invalid(format!("health check {:?}: unsupported url {:?}", name, url)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
cluster:
  name: lab
node:
  name: ns1
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert!(config.cluster.quorum_required);
        assert_eq!(config.cluster.failover_delay_ms, 3_000);
        assert_eq!(config.cluster.poll_interval_ms, 2_000);
        assert_eq!(config.p2p.port, 7777);
        assert_eq!(config.p2p.knock_port, 51_821);
        assert_eq!(config.stonith.startup_grace_period_secs, 120);
        assert_eq!(config.stonith.min_delay_between_fence_secs, 60);
        assert_eq!(config.stonith.max_fences_per_5_min, 2);
        assert_eq!(config.stonith.fence_delay_on_node_left_secs, 10);
    }

    #[test]
    fn vip_shorthand_yields_cidr() {
        let vip = VipConfig {
            name: "web".to_string(),
            ip: "10.0.0.5/20".to_string(),
            cidr: None,
            interface: "eth0".to_string(),
        }
        .resolve()
        .unwrap();
        assert_eq!(vip.ip, "10.0.0.5");
        assert_eq!(vip.cidr, 20);
    }

    #[test]
    fn vip_cidr_conflict_is_rejected() {
        let err = VipConfig {
            name: "web".to_string(),
            ip: "10.0.0.5/20".to_string(),
            cidr: Some(24),
            interface: "eth0".to_string(),
        }
        .resolve()
        .unwrap_err();
        assert!(err.to_string().contains("conflicts"));
    }

    #[test]
    fn zero_interval_health_check_is_rejected() {
        let raw = format!(
            "{MINIMAL}healthChecks:\n  - name: gw\n    type: tcp\n    host: 10.0.0.1\n    port: 22\n    intervalMs: 0\n"
        );
        let err = Config::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("interval"));
    }

    #[test]
    fn seconds_are_canonicalised_to_millis() {
        let raw = format!(
            "{MINIMAL}healthChecks:\n  - name: gw\n    type: tcp\n    host: 10.0.0.1\n    port: 22\n    interval: 5\n    timeout: 2\n"
        );
        let config = Config::parse(&raw).unwrap();
        let probe = &config.health_checks[0].probe;
        assert_eq!(probe.interval(), Duration::from_millis(5_000));
        assert_eq!(probe.probe_timeout(), Duration::from_millis(2_000));
    }

    #[test]
    fn dangling_constraint_is_rejected() {
        let raw = format!(
            "{MINIMAL}services:\n  - name: web\n    unit: nginx.service\nconstraints:\n  - order:\n      first: web\n      then: ghost\n"
        );
        let err = Config::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn stonith_without_driver_is_rejected() {
        let raw = format!("{MINIMAL}stonith:\n  enabled: true\n");
        assert!(Config::parse(&raw).is_err());
    }

    #[test]
    fn full_config_parses() {
        let raw = r#"
cluster:
  name: lab
  quorumRequired: true
  failoverDelayMs: 1500
  pollIntervalMs: 1000
node:
  name: ns1
  priority: 10
vips:
  - name: vip-web
    ip: 192.168.1.250/24
    interface: eth0
services:
  - name: web
    unit: nginx.service
    healthcheck:
      type: http
      url: http://127.0.0.1:80/healthz
      intervalMs: 2000
      timeoutMs: 500
constraints:
  - order:
      first: web
      then: vip-web
  - colocation:
      a: web
      b: vip-web
stonith:
  enabled: true
  driver:
    kind: hypervisor
    apiUrl: https://pve.example:8006/api2/json
    token: root@pam!ha=secret
  nodeMapping:
    ns2: "102"
    ns3: "103"
p2p:
  authKey: swordfish
mesh:
  interface: wg0
  address: 10.99.0.1
logging:
  level: debug
"#;
        let config = Config::parse(raw).unwrap();
        assert_eq!(config.resolved_vips()[0].cidr, 24);
        assert_eq!(config.stonith.node_mapping.len(), 2);
        assert!(matches!(
            config.services[0].healthcheck.as_ref().unwrap().target,
            ProbeTarget::Http { .. }
        ));
    }
}
