//! PID file handling: refuse to start beside a live daemon, replace a
//! stale file from a dead one.

use std::path::PathBuf;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{info, warn};

#[derive(thiserror::Error, Debug)]
pub enum PidFileError {
    #[error("another daemon is already running with pid {0}")]
    AlreadyRunning(i32),
    #[error("cannot write pid file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn acquire(path: PathBuf) -> Result<Self, PidFileError> {
        if let Ok(raw) = std::fs::read_to_string(&path) {
            if let Ok(pid) = raw.trim().parse::<i32>() {
                // Signal 0 probes liveness without delivering anything.
                if kill(Pid::from_raw(pid), None).is_ok() {
                    return Err(PidFileError::AlreadyRunning(pid));
                }
                warn!(pid, "replacing stale pid file");
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PidFileError::Io {
                path: path.clone(),
                source,
            })?;
        }
        std::fs::write(&path, format!("{}\n", std::process::id())).map_err(|source| {
            PidFileError::Io {
                path: path.clone(),
                source,
            }
        })?;
        info!(path = %path.display(), pid = std::process::id(), "pid file written");
        Ok(Self { path })
    }

    pub fn release(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_pid_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigild.pid");
        // A pid far above any live process on a test machine.
        std::fs::write(&path, "999999999\n").unwrap();
        let pid_file = PidFile::acquire(path.clone()).unwrap();
        let written: i32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(written, std::process::id() as i32);
        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn live_pid_refuses_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigild.pid");
        // Our own pid is definitely alive.
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        let err = PidFile::acquire(path).unwrap_err();
        assert!(matches!(err, PidFileError::AlreadyRunning(_)));
    }
}
