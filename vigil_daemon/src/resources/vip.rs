//! VIP plumbing: `ip addr` add/remove with post-activation verification
//! and gratuitous ARP announcements so neighbours refresh their caches.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::command::{CommandError, CommandRunner};
use crate::config::Vip;

const IP: &str = "ip";
const ARPING: &str = "arping";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum VipError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("adding {vip} failed: {stderr}")]
    AddFailed { vip: String, stderr: String },
    #[error("removing {vip} failed: {stderr}")]
    RemoveFailed { vip: String, stderr: String },
    #[error("{vip} did not appear on {interface} after activation")]
    VerifyFailed { vip: String, interface: String },
}

pub struct VipManager {
    runner: Arc<dyn CommandRunner>,
}

impl VipManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Whether `vip` is currently present on its interface.
    pub async fn is_active(&self, vip: &Vip) -> Result<bool, VipError> {
        let output = self
            .runner
            .run(IP, &["-o", "addr", "show", "dev", &vip.interface], COMMAND_TIMEOUT)
            .await?;
        if !output.success() {
            // A missing interface means the address cannot be present.
            return Ok(false);
        }
        let needle = format!("inet {}/{}", vip.ip, vip.cidr);
        Ok(output.stdout.lines().any(|line| line.contains(&needle)))
    }

    /// Whether any of the given VIPs is present locally. Drives the
    /// follower watchdog.
    pub async fn any_active(&self, vips: &[Vip]) -> Result<bool, VipError> {
        for vip in vips {
            if self.is_active(vip).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Add the address, verify it took, and announce it. Activating an
    /// already-present VIP is a no-op success. Verification failure is
    /// fatal for this VIP and the caller is expected to demote.
    pub async fn activate(&self, vip: &Vip) -> Result<(), VipError> {
        if self.is_active(vip).await? {
            debug!(vip = %vip.name, "already active");
            return Ok(());
        }
        let address = format!("{}/{}", vip.ip, vip.cidr);
        let output = self
            .runner
            .run(IP, &["addr", "add", &address, "dev", &vip.interface], COMMAND_TIMEOUT)
            .await?;
        // "File exists" races are fine, verification below settles it.
        if !output.success() && !output.stderr.contains("File exists") {
            return Err(VipError::AddFailed {
                vip: vip.name.clone(),
                stderr: output.stderr,
            });
        }
        if !self.is_active(vip).await? {
            return Err(VipError::VerifyFailed {
                vip: vip.name.clone(),
                interface: vip.interface.clone(),
            });
        }
        self.announce(vip).await;
        Ok(())
    }

    /// Remove the address. Deactivating an absent VIP is a no-op success.
    pub async fn deactivate(&self, vip: &Vip) -> Result<(), VipError> {
        if !self.is_active(vip).await? {
            return Ok(());
        }
        let address = format!("{}/{}", vip.ip, vip.cidr);
        let output = self
            .runner
            .run(IP, &["addr", "del", &address, "dev", &vip.interface], COMMAND_TIMEOUT)
            .await?;
        if !output.success() && !output.stderr.contains("Cannot assign") {
            return Err(VipError::RemoveFailed {
                vip: vip.name.clone(),
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    /// Three unsolicited announcements plus the address-check variant.
    /// Announcement failures are logged, never fatal.
    async fn announce(&self, vip: &Vip) {
        for flag in ["-U", "-A"] {
            let count = if flag == "-U" { "3" } else { "1" };
            let result = self
                .runner
                .run(
                    ARPING,
                    &["-q", flag, "-c", count, "-I", &vip.interface, &vip.ip],
                    COMMAND_TIMEOUT,
                )
                .await;
            if let Err(error) = result {
                warn!(vip = %vip.name, %error, "gratuitous ARP announcement failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::FakeRunner;

    fn vip() -> Vip {
        Vip {
            name: "vip-web".to_string(),
            ip: "192.168.1.250".to_string(),
            cidr: 24,
            interface: "eth0".to_string(),
        }
    }

    const ADDR_SHOWING_VIP: &str =
        "2: eth0    inet 192.168.1.10/24 brd 192.168.1.255 scope global eth0\n\
         2: eth0    inet 192.168.1.250/24 scope global secondary eth0\n";

    #[tokio::test]
    async fn activate_is_noop_when_already_present() {
        let runner = Arc::new(FakeRunner::new());
        runner.push_ok(ADDR_SHOWING_VIP);
        let manager = VipManager::new(Arc::clone(&runner) as Arc<dyn CommandRunner>);
        manager.activate(&vip()).await.unwrap();
        // One `ip addr show`, no add.
        assert_eq!(runner.recorded().len(), 1);
    }

    #[tokio::test]
    async fn activate_adds_verifies_and_announces() {
        let runner = Arc::new(FakeRunner::new());
        runner.push_ok(""); // show: absent
        runner.push_ok(""); // add
        runner.push_ok(ADDR_SHOWING_VIP); // verify
        let manager = VipManager::new(Arc::clone(&runner) as Arc<dyn CommandRunner>);
        manager.activate(&vip()).await.unwrap();
        let calls = runner.recorded();
        assert!(calls[1].starts_with("ip addr add 192.168.1.250/24 dev eth0"));
        assert!(calls[3].contains("arping"));
        assert!(calls[3].contains("-U"));
        assert!(calls[4].contains("-A"));
    }

    #[tokio::test]
    async fn failed_verification_is_fatal_for_the_vip() {
        let runner = Arc::new(FakeRunner::new());
        runner.push_ok(""); // show: absent
        runner.push_ok(""); // add claims success
        runner.push_ok(""); // verify: still absent
        let manager = VipManager::new(Arc::clone(&runner) as Arc<dyn CommandRunner>);
        let err = manager.activate(&vip()).await.unwrap_err();
        assert!(matches!(err, VipError::VerifyFailed { .. }));
    }

    #[tokio::test]
    async fn deactivate_absent_vip_is_noop() {
        let runner = Arc::new(FakeRunner::new());
        runner.push_ok(""); // show: absent
        let manager = VipManager::new(Arc::clone(&runner) as Arc<dyn CommandRunner>);
        manager.deactivate(&vip()).await.unwrap();
        assert_eq!(runner.recorded().len(), 1);
    }
}
