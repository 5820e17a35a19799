//! Advisory-locked file replacement for the shared config files
//! (`corosync.conf`, the overlay config) that both the `/add-peer` and
//! `/sync-corosync` handlers may rewrite.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use nix::fcntl::{Flock, FlockArg};

/// Replace `path` with `contents` under an exclusive `flock` on a sibling
/// `<name>.lock` file. The payload lands via temp-file + rename so readers
/// never observe a partial write.
pub fn replace_locked(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let lock_path = lock_path_for(path);
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    let _guard = Flock::lock(lock_file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| std::io::Error::from(errno))?;

    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)?;
        tmp.write_all(contents)?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
}

/// Temp-file + rename replacement without the advisory lock, for files
/// with a single writer (the fence history journal).
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)?;
        tmp.write_all(contents)?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
}

fn lock_path_for(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_contents_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("corosync.conf");
        replace_locked(&target, b"first").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"first");
        replace_locked(&target, b"second").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"second");
        assert!(dir.path().join("corosync.conf.lock").exists());
    }
}
