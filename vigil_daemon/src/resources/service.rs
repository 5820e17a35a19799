//! systemd unit wrapper.

use std::sync::Arc;
use std::time::Duration;

use crate::command::{CommandError, CommandRunner};

const SYSTEMCTL: &str = "systemctl";
/// Wall-clock bound for each unit operation.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("systemctl {verb} {unit} exited {status}: {stderr}")]
    UnitFailed {
        verb: &'static str,
        unit: String,
        status: i32,
        stderr: String,
    },
}

pub struct SystemdManager {
    runner: Arc<dyn CommandRunner>,
}

impl SystemdManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub async fn start(&self, unit: &str) -> Result<(), ServiceError> {
        self.unit_op("start", unit).await
    }

    pub async fn stop(&self, unit: &str) -> Result<(), ServiceError> {
        self.unit_op("stop", unit).await
    }

    pub async fn restart(&self, unit: &str) -> Result<(), ServiceError> {
        self.unit_op("restart", unit).await
    }

    /// True iff `systemctl is-active` prints exactly `active`.
    pub async fn is_active(&self, unit: &str) -> Result<bool, ServiceError> {
        let output = self
            .runner
            .run(SYSTEMCTL, &["is-active", unit], OPERATION_TIMEOUT)
            .await?;
        Ok(output.stdout.trim() == "active")
    }

    async fn unit_op(&self, verb: &'static str, unit: &str) -> Result<(), ServiceError> {
        let output = self
            .runner
            .run(SYSTEMCTL, &[verb, unit], OPERATION_TIMEOUT)
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(ServiceError::UnitFailed {
                verb,
                unit: unit.to_string(),
                status: output.status,
                stderr: output.stderr,
            })
        }
    }
}
