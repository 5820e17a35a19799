//! End-to-end daemon behaviour against a simulated host: corosync answers
//! come from a scripted cluster model, `ip`/`systemctl` mutate an
//! in-memory host, and the daemon is driven through its control socket.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use vigil_daemon::command::{CommandError, CommandOutput, CommandRunner};
use vigil_daemon::config::Config;
use vigil_daemon::supervisor::Supervisor;
use vigil_protocol::control::{ControlRequest, ControlResponse};

/// A two-node cluster model plus the local host's address/unit state.
struct SimHost {
    quorate: AtomicBool,
    online: Mutex<HashSet<String>>,
    addresses: Mutex<HashSet<String>>,
    active_units: Mutex<HashSet<String>>,
}

impl SimHost {
    fn new() -> Self {
        Self {
            quorate: AtomicBool::new(true),
            online: Mutex::new(["ns1".to_string(), "ns2".to_string()].into()),
            addresses: Mutex::new(HashSet::new()),
            active_units: Mutex::new(HashSet::new()),
        }
    }

    fn quorumtool_output(&self) -> String {
        let quorate = if self.quorate.load(Ordering::SeqCst) {
            "Yes"
        } else {
            "No"
        };
        let online = self.online.lock().unwrap().len();
        format!(
            "Quorum information\n------------------\nNode ID:          1\nQuorate:          {quorate}\n\n\
             Votequorum information\n----------------------\nExpected votes:   2\nTotal votes:      {online}\nQuorum:           2\n"
        )
    }

    fn cmapctl_output(&self) -> String {
        let online = self.online.lock().unwrap();
        let mut out = String::new();
        for (id, name, ip) in [(1, "ns1", "127.0.0.1"), (2, "ns2", "127.0.0.2")] {
            let status = if online.contains(name) { "joined" } else { "left" };
            out.push_str(&format!("runtime.members.{id}.ip (str) = r(0) ip({ip})\n"));
            out.push_str(&format!("runtime.members.{id}.status (str) = {status}\n"));
        }
        out
    }

    fn vip_active(&self) -> bool {
        !self.addresses.lock().unwrap().is_empty()
    }
}

struct SimRunner(Arc<SimHost>);

fn ok(stdout: String) -> Result<CommandOutput, CommandError> {
    Ok(CommandOutput {
        status: 0,
        stdout,
        stderr: String::new(),
    })
}

#[async_trait]
impl CommandRunner for SimRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        _timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let sim = &self.0;
        match program {
            "corosync-quorumtool" => ok(sim.quorumtool_output()),
            "corosync-cmapctl" => ok(sim.cmapctl_output()),
            "ip" => match args {
                ["addr", "add", address, "dev", _iface] => {
                    sim.addresses.lock().unwrap().insert(address.to_string());
                    ok(String::new())
                }
                ["addr", "del", address, "dev", _iface] => {
                    sim.addresses.lock().unwrap().remove(*address);
                    ok(String::new())
                }
                ["-o", "addr", "show", "dev", iface] => {
                    let listing = sim
                        .addresses
                        .lock()
                        .unwrap()
                        .iter()
                        .map(|a| format!("2: {iface}    inet {a} scope global {iface}"))
                        .collect::<Vec<_>>()
                        .join("\n");
                    ok(listing)
                }
                _ => ok(String::new()),
            },
            "systemctl" => match args {
                ["start", unit] => {
                    sim.active_units.lock().unwrap().insert(unit.to_string());
                    ok(String::new())
                }
                ["stop", unit] => {
                    sim.active_units.lock().unwrap().remove(*unit);
                    ok(String::new())
                }
                ["is-active", unit] => {
                    if sim.active_units.lock().unwrap().contains(*unit) {
                        ok("active\n".to_string())
                    } else {
                        ok("inactive\n".to_string())
                    }
                }
                _ => ok(String::new()),
            },
            // wg / arping are irrelevant to this scenario.
            _ => ok(String::new()),
        }
    }
}

fn test_config(dir: &tempfile::TempDir) -> Config {
    let raw = format!(
        r#"
cluster:
  name: lab
  quorumRequired: true
  failoverDelayMs: 100
  pollIntervalMs: 50
node:
  name: ns1
vips:
  - name: vip-web
    ip: 192.168.1.250/24
    interface: dummy0
services:
  - name: web
    unit: nginx.service
constraints:
  - order:
      first: web
      then: vip-web
p2p:
  port: 0
  knockPort: 0
  authKey: test-key
mesh:
  interface: wg0
  address: 127.0.0.1
  configPath: {dir}/wg0.conf
paths:
  pidFile: {dir}/vigild.pid
  controlSocket: {dir}/control.sock
  fenceHistory: {dir}/fence-history.json
  nodeState: {dir}/node-state.json
  corosyncConf: {dir}/corosync.conf
"#,
        dir = dir.path().display()
    );
    Config::parse(&raw).unwrap()
}

const COROSYNC_CONF: &str = "\
totem {
    version: 2
    cluster_name: lab
}

nodelist {
    node {
        name: ns1
        nodeid: 1
        ring0_addr: 127.0.0.1
    }
    node {
        name: ns2
        nodeid: 2
        ring0_addr: 127.0.0.2
    }
}

quorum {
    provider: corosync_votequorum
    two_node: 1
}
";

async fn control(socket: &std::path::Path, request: &ControlRequest) -> ControlResponse {
    let stream = UnixStream::connect(socket).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut line = serde_json::to_string(request).unwrap();
    line.push('\n');
    write_half.write_all(line.as_bytes()).await.unwrap();
    let mut reply = String::new();
    BufReader::new(read_half)
        .read_line(&mut reply)
        .await
        .unwrap();
    serde_json::from_str(&reply).unwrap()
}

async fn wait_for_phase(socket: &std::path::Path, phase: &str) -> ControlResponse {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let response = control(socket, &ControlRequest::Status).await;
        let current = response.data.as_ref().and_then(|d| d["phase"].as_str().map(String::from));
        if current.as_deref() == Some(phase) {
            return response;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for phase {phase}, last response: {response:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leader_lifecycle_quorum_loss_and_standby() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("corosync.conf"), COROSYNC_CONF).unwrap();
    std::fs::write(dir.path().join("wg0.conf"), "[Interface]\nAddress = 127.0.0.1/24\n").unwrap();

    let sim = Arc::new(SimHost::new());
    let config = test_config(&dir);
    let socket = config.paths.control_socket.clone();

    let runner = Arc::new(SimRunner(Arc::clone(&sim)));
    let mut supervisor = Supervisor::build(config, dir.path().join("config.yaml"), runner)
        .await
        .expect("daemon builds against the simulated host");
    let daemon = tokio::spawn(async move { supervisor.run().await });

    // ns1 has the smallest node-id, so it promotes after the failover
    // delay and activates the VIP and the service, in constraint order.
    let status = wait_for_phase(&socket, "leader").await;
    let data = status.data.unwrap();
    assert_eq!(data["isLeader"], true);
    assert_eq!(data["quorate"], true);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !sim.vip_active() {
        assert!(tokio::time::Instant::now() < deadline, "vip never activated");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(sim.active_units.lock().unwrap().contains("nginx.service"));

    // Resources report shows both as active.
    let resources = control(&socket, &ControlRequest::Resources).await;
    let data = resources.data.unwrap();
    assert_eq!(data["vips"][0]["active"], true);
    assert_eq!(data["services"][0]["active"], true);

    // Partition: quorum lost. The leader must retract everything.
    sim.quorate.store(false, Ordering::SeqCst);
    sim.online.lock().unwrap().remove("ns2");
    wait_for_phase(&socket, "follower").await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while sim.vip_active() {
        assert!(tokio::time::Instant::now() < deadline, "vip never retracted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!sim.active_units.lock().unwrap().contains("nginx.service"));

    // Quorum returns; the node leads again.
    sim.quorate.store(true, Ordering::SeqCst);
    sim.online.lock().unwrap().insert("ns2".to_string());
    wait_for_phase(&socket, "leader").await;

    // Standby demotes and blocks re-promotion; unstandby recovers.
    let response = control(&socket, &ControlRequest::Standby).await;
    assert!(response.success);
    wait_for_phase(&socket, "standby").await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while sim.vip_active() {
        assert!(tokio::time::Instant::now() < deadline, "vip held in standby");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Standby twice is the same as once.
    let response = control(&socket, &ControlRequest::Standby).await;
    assert!(response.success);
    wait_for_phase(&socket, "standby").await;

    let response = control(&socket, &ControlRequest::Unstandby).await;
    assert!(response.success);
    wait_for_phase(&socket, "leader").await;

    daemon.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn follower_watchdog_strips_stray_vips() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("corosync.conf"), COROSYNC_CONF).unwrap();
    std::fs::write(dir.path().join("wg0.conf"), "[Interface]\n").unwrap();

    let sim = Arc::new(SimHost::new());
    let config = test_config(&dir);
    let socket = config.paths.control_socket.clone();

    let runner = Arc::new(SimRunner(Arc::clone(&sim)));
    let mut supervisor = Supervisor::build(config, dir.path().join("config.yaml"), runner)
        .await
        .unwrap();
    let daemon = tokio::spawn(async move { supervisor.run().await });

    // Lead once, then step into standby so the node stays a non-leader
    // while remaining fully in service.
    wait_for_phase(&socket, "leader").await;
    control(&socket, &ControlRequest::Standby).await;
    wait_for_phase(&socket, "standby").await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while sim.vip_active() {
        assert!(tokio::time::Instant::now() < deadline, "standby kept the vip");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Plant a stray VIP as if a crashed run had left it behind; the
    // per-tick watchdog must strip it from a non-leader.
    sim.addresses
        .lock()
        .unwrap()
        .insert("192.168.1.250/24".to_string());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while sim.vip_active() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "watchdog never removed the stray vip"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let status = control(&socket, &ControlRequest::Status).await;
    assert_eq!(status.data.unwrap()["isLeader"], false);
    daemon.abort();
}
