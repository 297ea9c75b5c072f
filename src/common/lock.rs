//! Advisory locking of disk images.
//!
//! Mutating operations take an exclusive lock, read-only ones a shared
//! lock, both non-blocking: another holder means the disk is busy and the
//! operation aborts before touching anything.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::common::log;
use crate::error::{Error, Result};

/// Held advisory lock; released when the last clone of the handle drops.
#[derive(Clone)]
pub struct DiskLock {
    inner: Arc<Inner>,
}

struct Inner {
    // Kept alive for the lock lifetime; flock releases on close.
    _lock: Flock<std::fs::File>,
    path: PathBuf,
}

impl DiskLock {
    /// Shared lock for read-only operations.
    pub fn read(path: &Path) -> Result<Self> {
        Self::acquire(path, FlockArg::LockSharedNonblock)
    }

    /// Exclusive lock for mutating operations.
    pub fn write(path: &Path) -> Result<Self> {
        Self::acquire(path, FlockArg::LockExclusiveNonblock)
    }

    fn acquire(path: &Path, arg: FlockArg) -> Result<Self> {
        log::info(format!("Disk lock: {}", path.display()));

        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|_| Error::InvalidHdd)?;

        let lock = Flock::lock(file, arg).map_err(|(_, errno)| match errno {
            Errno::EWOULDBLOCK => Error::Locked(path.to_path_buf()),
            other => Error::internal(format!(
                "Unable to lock {}: {other}",
                path.display()
            )),
        })?;

        Ok(DiskLock {
            inner: Arc::new(Inner {
                _lock: lock,
                path: path.to_path_buf(),
            }),
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        log::info(format!("Disk unlock: {}", self.path.display()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn read_locks_can_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("disk.qcow2");
        fs::write(&img, b"img").unwrap();

        let first = DiskLock::read(&img).unwrap();
        let second = DiskLock::read(&img).unwrap();
        drop(first);
        drop(second);
    }

    #[test]
    fn write_lock_excludes_other_locks() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("disk.qcow2");
        fs::write(&img, b"img").unwrap();

        let guard = DiskLock::write(&img).unwrap();
        assert!(matches!(DiskLock::write(&img), Err(Error::Locked(_))));
        assert!(matches!(DiskLock::read(&img), Err(Error::Locked(_))));
        drop(guard);

        DiskLock::write(&img).unwrap();
    }

    #[test]
    fn clones_share_one_lock() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("disk.qcow2");
        fs::write(&img, b"img").unwrap();

        let guard = DiskLock::write(&img).unwrap();
        let clone = guard.clone();
        drop(guard);
        // Still held through the clone.
        assert!(matches!(DiskLock::write(&img), Err(Error::Locked(_))));
        drop(clone);
        DiskLock::write(&img).unwrap();
    }

    #[test]
    fn missing_file_is_invalid_hdd() {
        assert!(matches!(
            DiskLock::write(Path::new("/nonexistent/disk.qcow2")),
            Err(Error::InvalidHdd)
        ));
    }
}
