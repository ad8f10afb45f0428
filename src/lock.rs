//! Per-storage locking
//!
//! Operations that allocate, rename or free volumes run while holding the
//! storage lock. Locks are not reentrant: code holding the lock must not try
//! to take it again.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default time to wait for a storage lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default directory for lock files
pub const DEFAULT_LOCK_DIR: &str = "/var/lock/volstore";

/// Held lock, released when dropped
pub struct LockGuard {
    _inner: Box<dyn Send>,
}

impl LockGuard {
    fn new(inner: impl Send + 'static) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LockGuard")
    }
}

/// Mutual exclusion per storage id
pub trait StorageLocker: Send + Sync {
    /// Wait up to `timeout` for the lock of `storeid`
    fn acquire(&self, storeid: &str, timeout: Duration) -> Result<LockGuard>;
}

/// Run `f` while holding the lock of `storeid`
pub fn with_storage_lock<T>(
    locker: &dyn StorageLocker,
    storeid: &str,
    timeout: Duration,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let _guard = locker.acquire(storeid, timeout)?;
    f()
}

/// Locks backed by `flock` on files in a lock directory
///
/// Works across processes on the same host.
#[derive(Debug, Clone)]
pub struct FileLocker {
    dir: PathBuf,
}

impl FileLocker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn lock_path(&self, storeid: &str) -> PathBuf {
        self.dir.join(format!("storage-{}", storeid))
    }
}

impl Default for FileLocker {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_DIR)
    }
}

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl StorageLocker for FileLocker {
    fn acquire(&self, storeid: &str, timeout: Duration) -> Result<LockGuard> {
        fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(storeid);
        let file: File = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => {
                    debug!(storage = storeid, "acquired storage lock");
                    return Ok(LockGuard::new(file));
                }
                Err(e) if e == Errno::EWOULDBLOCK || e == Errno::EINTR => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout(storeid.to_string()));
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }
}

#[derive(Debug, Default)]
struct MemoryLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// In-process locks, for tests and single-process embedding
#[derive(Debug, Clone, Default)]
pub struct MemoryLocker {
    inner: Arc<MemoryLocks>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `storeid` is currently locked
    pub fn is_locked(&self, storeid: &str) -> bool {
        self.inner
            .held
            .lock()
            .map(|held| held.contains(storeid))
            .unwrap_or(false)
    }
}

struct MemoryGuard {
    locks: Arc<MemoryLocks>,
    storeid: String,
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locks.held.lock() {
            held.remove(&self.storeid);
        }
        self.locks.released.notify_all();
    }
}

impl StorageLocker for MemoryLocker {
    fn acquire(&self, storeid: &str, timeout: Duration) -> Result<LockGuard> {
        let poisoned = || Error::Other("storage lock table poisoned".to_string());
        let deadline = Instant::now() + timeout;
        let mut held = self.inner.held.lock().map_err(|_| poisoned())?;

        while held.contains(storeid) {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout(storeid.to_string()));
            }
            held = self
                .inner
                .released
                .wait_timeout(held, deadline - now)
                .map_err(|_| poisoned())?
                .0;
        }

        held.insert(storeid.to_string());
        Ok(LockGuard::new(MemoryGuard {
            locks: Arc::clone(&self.inner),
            storeid: storeid.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_memory_lock_excludes() {
        let locker = MemoryLocker::new();
        let guard = locker.acquire("store1", Duration::from_secs(1)).unwrap();
        assert!(locker.is_locked("store1"));

        let err = locker.acquire("store1", Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));

        // other storages are independent
        let _other = locker.acquire("store2", Duration::from_millis(50)).unwrap();

        drop(guard);
        assert!(!locker.is_locked("store1"));
        assert!(locker.acquire("store1", Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn test_memory_lock_waits_for_release() {
        let locker = MemoryLocker::new();
        let guard = locker.acquire("store1", Duration::from_secs(1)).unwrap();
        let released = Arc::new(AtomicBool::new(false));

        let handle = {
            let locker = locker.clone();
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let _g = locker.acquire("store1", Duration::from_secs(5)).unwrap();
                assert!(released.load(Ordering::SeqCst));
            })
        };

        thread::sleep(Duration::from_millis(50));
        released.store(true, Ordering::SeqCst);
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn test_file_lock_excludes() {
        let dir = TempDir::new().unwrap();
        let locker = FileLocker::new(dir.path());
        let guard = locker.acquire("store1", Duration::from_secs(1)).unwrap();
        assert!(dir.path().join("storage-store1").exists());

        // a second open file description conflicts even within one process
        let err = locker.acquire("store1", Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));

        drop(guard);
        assert!(locker.acquire("store1", Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_with_storage_lock() {
        let locker = MemoryLocker::new();
        let value = with_storage_lock(&locker, "s", Duration::from_secs(1), || {
            assert!(locker.is_locked("s"));
            Ok(42)
        })
        .unwrap();
        assert_eq!(value, 42);
        assert!(!locker.is_locked("s"));
    }
}
