//! Symlink-as-PID directory lock
//!
//! The lock is a symlink named `.lock` whose target is the decimal PID of
//! the holder. Creating the symlink is atomic; a lock held by a process that
//! no longer exists is considered stale and removed.

use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Name of the lock symlink inside a problem directory
pub const LOCK_FILE: &str = ".lock";

/// Pause while the lock symlink vanished between symlink() and readlink()
const SYMLINK_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockAttempt {
    Acquired,
    /// Another live process, or this one, holds the lock
    Busy,
}

/// PID text written into lock symlinks created by this process
pub(crate) fn own_pid() -> String {
    std::process::id().to_string()
}

/// Try once to take the lock, clearing stale locks on the way
///
/// Errors from `symlink` other than `EEXIST` are returned unchanged so the
/// caller can tell a missing directory from a permission problem.
pub(crate) fn try_lock(lock_path: &Path, pid: &str) -> io::Result<LockAttempt> {
    loop {
        match std::os::unix::fs::symlink(pid, lock_path) {
            Ok(()) => {
                debug!(lock = %lock_path.display(), "Locked");
                return Ok(LockAttempt::Acquired);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        let holder = match std::fs::read_link(lock_path) {
            Ok(target) => target.to_string_lossy().into_owned(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                std::thread::sleep(SYMLINK_RETRY);
                continue;
            }
            Err(e) => return Err(e),
        };

        if holder == pid {
            info!(lock = %lock_path.display(), "Lock is already held by this process");
            return Ok(LockAttempt::Busy);
        }

        if is_pid(&holder) {
            if Path::new("/proc").join(&holder).exists() {
                info!(lock = %lock_path.display(), pid = %holder, "Lock is held by another process");
                return Ok(LockAttempt::Busy);
            }
            info!(lock = %lock_path.display(), pid = %holder, "Lock holder is gone, removing stale lock");
        }

        match std::fs::remove_file(lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn unlock(lock_path: &Path) {
    match std::fs::remove_file(lock_path) {
        Ok(()) => debug!(lock = %lock_path.display(), "Unlocked"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(lock = %lock_path.display(), error = %e, "Failed to remove lock"),
    }
}

fn is_pid(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_and_release() {
        let dir = tempdir().unwrap();
        let lock = dir.path().join(LOCK_FILE);

        assert_eq!(try_lock(&lock, &own_pid()).unwrap(), LockAttempt::Acquired);
        assert_eq!(std::fs::read_link(&lock).unwrap().to_string_lossy(), own_pid());

        // Held by us: busy, not re-entrant
        assert_eq!(try_lock(&lock, &own_pid()).unwrap(), LockAttempt::Busy);

        unlock(&lock);
        assert!(std::fs::symlink_metadata(&lock).is_err());
    }

    #[test]
    fn live_holder_is_busy() {
        let dir = tempdir().unwrap();
        let lock = dir.path().join(LOCK_FILE);
        // PID 1 always exists
        std::os::unix::fs::symlink("1", &lock).unwrap();

        assert_eq!(try_lock(&lock, &own_pid()).unwrap(), LockAttempt::Busy);
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        let lock = dir.path().join(LOCK_FILE);
        // Above the kernel's pid_max limit
        std::os::unix::fs::symlink("99999999", &lock).unwrap();

        assert_eq!(try_lock(&lock, &own_pid()).unwrap(), LockAttempt::Acquired);
        assert_eq!(std::fs::read_link(&lock).unwrap().to_string_lossy(), own_pid());
    }

    #[test]
    fn garbage_lock_is_replaced() {
        let dir = tempdir().unwrap();
        let lock = dir.path().join(LOCK_FILE);
        std::os::unix::fs::symlink("not-a-pid", &lock).unwrap();

        assert_eq!(try_lock(&lock, &own_pid()).unwrap(), LockAttempt::Acquired);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let lock = dir.path().join("missing").join(LOCK_FILE);
        let err = try_lock(&lock, &own_pid()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
