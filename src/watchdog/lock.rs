//! At-most-one-pass lock.
//!
//! Cron passes and manual runs are separate processes, so the in-process
//! mutex is backed by an advisory `flock` on a lock file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::error::WatchdogError;

/// Held for the whole pass; released on drop.
#[derive(Debug)]
pub struct PassGuard {
    _local: OwnedMutexGuard<()>,
    _file: Option<std::fs::File>,
}

#[derive(Debug, Clone)]
pub struct PassLock {
    local: Arc<Mutex<()>>,
    file: Option<PathBuf>,
}

impl PassLock {
    /// `file` enables the cross-process lock.
    pub fn new(file: Option<PathBuf>) -> Self {
        Self {
            local: Arc::new(Mutex::new(())),
            file,
        }
    }

    /// Take the lock without waiting.
    ///
    /// A lock file that cannot be opened is logged and skipped; a lock file
    /// held by another process is a conflict.
    pub fn try_acquire(&self) -> Result<PassGuard, WatchdogError> {
        let local = Arc::clone(&self.local)
            .try_lock_owned()
            .map_err(|_| WatchdogError::PassInProgress)?;

        let file = match &self.file {
            Some(path) => match lock_file(path) {
                Ok(Some(file)) => Some(file),
                Ok(None) => return Err(WatchdogError::PassInProgress),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        "pass lock file unavailable, relying on in-process lock: {e}"
                    );
                    None
                }
            },
            None => None,
        };

        Ok(PassGuard {
            _local: local,
            _file: file,
        })
    }
}

/// `Ok(None)` when another holder has the lock.
#[cfg(unix)]
fn lock_file(path: &Path) -> std::io::Result<Option<std::fs::File>> {
    use std::os::unix::io::AsRawFd;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    // SAFETY: the fd is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(Some(file));
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(None)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn lock_file(_path: &Path) -> std::io::Result<Option<std::fs::File>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "file locking is only implemented on unix",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected_until_release() {
        let lock = PassLock::new(None);
        let guard = lock.try_acquire().unwrap();
        assert!(matches!(lock.try_acquire(), Err(WatchdogError::PassInProgress)));
        drop(guard);
        assert!(lock.try_acquire().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn file_lock_conflicts_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("watchdog.lock");
        let first = PassLock::new(Some(path.clone()));
        let second = PassLock::new(Some(path));
        let guard = first.try_acquire().unwrap();
        assert!(matches!(second.try_acquire(), Err(WatchdogError::PassInProgress)));
        drop(guard);
        assert!(second.try_acquire().is_ok());
    }
}
