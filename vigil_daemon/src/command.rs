//! External command execution with enforced wall-clock timeouts.
//!
//! Every wrapper that shells out (`ip`, `systemctl`, `corosync-quorumtool`,
//! `wg`, `arping`) goes through a [`CommandRunner`] so tests can substitute
//! a scripted fake.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("i/o error while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Seam for shelling out. The daemon uses [`SystemRunner`]; tests inject
/// fakes that replay canned output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError>;
}

/// Runs commands on the host. The child is killed when the timeout
/// elapses; a timeout is reported as an error, not a non-zero status.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
        match waited {
            Ok(Ok(output)) => Ok(CommandOutput {
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(source)) => Err(CommandError::Io {
                program: program.to_string(),
                source,
            }),
            // kill_on_drop reaps the child once the future is dropped.
            Err(_elapsed) => Err(CommandError::Timeout {
                program: program.to_string(),
                timeout,
            }),
        }
    }
}
