//! Re-entry guards for the periodic tasks.
//!
//! Each entry point takes an exclusive file lock under the configured lock
//! directory before doing any work; a second copy of the task finds the lock
//! held and exits non-zero. The retrieval task instead competes for one of
//! `STORAGED_SLOTS` pool locks, which bounds the number of parallel
//! retrieval processes.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use fd_lock::{RwLock, RwLockWriteGuard};
use log::debug;

use crate::error::{GuardErrorKind, NlaResult};

/// A held task lock. The lock is released when the process exits; the
/// leaked [`RwLock`] backing the guard is intentional and bounded by the
/// number of acquisition attempts per process.
pub struct TaskGuard {
    _guard: RwLockWriteGuard<'static, File>,
    path: PathBuf,
}

impl std::fmt::Debug for TaskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGuard").field("path", &self.path).finish()
    }
}

impl TaskGuard {
    /// The lock file backing this guard.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Try to take the exclusive lock for `name`. `Ok(None)` means another
/// process holds it.
pub fn try_exclusive(lock_dir: &Path, name: &str) -> NlaResult<Option<TaskGuard>> {
    std::fs::create_dir_all(lock_dir).map_err(|err| GuardErrorKind::LockFile {
        path: lock_dir.to_path_buf(),
        source: err,
    })?;
    let path = lock_dir.join(format!("{name}.lock"));
    let file = File::create(&path).map_err(|err| GuardErrorKind::LockFile {
        path: path.clone(),
        source: err,
    })?;
    let lock: &'static mut RwLock<File> = Box::leak(Box::new(RwLock::new(file)));
    match lock.try_write() {
        Ok(guard) => {
            debug!("holding task lock {}", path.display());
            Ok(Some(TaskGuard { _guard: guard, path }))
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(err) => Err(GuardErrorKind::LockFile { path, source: err }.into()),
    }
}

/// Acquire the task lock for `name` or fail with [`GuardErrorKind::Busy`].
pub fn acquire(lock_dir: &Path, name: &str) -> NlaResult<TaskGuard> {
    try_exclusive(lock_dir, name)?.ok_or_else(|| GuardErrorKind::Busy(name.to_string()).into())
}

/// Compete for one of the `pool_size` retrieval locks. Returns the slot-pool
/// index won, or [`GuardErrorKind::Busy`] when every seat is taken.
pub fn acquire_pool(lock_dir: &Path, name: &str, pool_size: usize) -> NlaResult<(usize, TaskGuard)> {
    for seat in 0..pool_size {
        if let Some(guard) = try_exclusive(lock_dir, &format!("{name}.{seat}"))? {
            return Ok((seat, guard));
        }
    }
    Err(GuardErrorKind::Busy(name.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_in_one_process_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let guard = acquire(dir.path(), "tidy").unwrap();
        assert!(guard.path().ends_with("tidy.lock"));
        assert!(try_exclusive(dir.path(), "tidy").unwrap().is_none());
        drop(guard);
        assert!(try_exclusive(dir.path(), "tidy").unwrap().is_some());
    }

    #[test]
    fn pool_hands_out_distinct_seats_until_full() {
        let dir = tempfile::tempdir().unwrap();
        let (seat_a, _ga) = acquire_pool(dir.path(), "retrieve", 2).unwrap();
        let (seat_b, _gb) = acquire_pool(dir.path(), "retrieve", 2).unwrap();
        assert_ne!(seat_a, seat_b);
        assert!(acquire_pool(dir.path(), "retrieve", 2).is_err());
    }
}
