//! Named advisory locks shared across processes.
//!
//! Every lock is backed by a file under the store's `locks/` directory and
//! taken with `flock(2)`, so it is respected by concurrent invocations and
//! released by the kernel if a holder crashes. Within one process the
//! kernel serializes on the open file description, so independent
//! [`Locksmith`] handles (one per invocation, or one per test thread)
//! contend exactly like separate processes do.
//!
//! Deadlock avoidance is the caller's job: acquisition order is fixed by
//! convention (the `gc` lock is always taken before any `volume-*` lock)
//! and the locksmith does not detect cycles.

use std::fs::File;
use std::os::fd::AsFd;

use cap_std::fs::{Dir, OpenOptions};
use rustix::fs::{FlockOperation, flock};

use crate::error::Result;

/// Shared (read) or exclusive (write) acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Multiple holders allowed; excludes exclusive holders.
    Shared,
    /// Single holder; excludes everyone.
    Exclusive,
}

/// Hands out named advisory locks backed by lockfiles.
#[derive(Debug)]
pub struct Locksmith {
    locks_dir: Dir,
}

/// RAII guard for a held lock. Dropping it releases the lock; the guard is
/// the only way the lock is ever released, so every exit path releases.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // The kernel would also drop the lock when the fd closes; unlocking
        // explicitly keeps the release visible at the drop point.
        let _ = flock(self.file.as_fd(), FlockOperation::Unlock);
    }
}

impl Locksmith {
    /// Create a locksmith over an open `locks/` directory handle.
    pub fn new(locks_dir: Dir) -> Self {
        Self { locks_dir }
    }

    /// Acquire the named lock, blocking until it is granted.
    ///
    /// The name must be filesystem-safe; the store only uses `gc` and
    /// `volume-<hex>` names.
    pub fn lock(&self, name: &str, mode: LockMode) -> Result<LockGuard> {
        let file: File = self
            .locks_dir
            .open_with(
                name,
                OpenOptions::new().create(true).read(true).write(true),
            )?
            .into_std();

        let op = match mode {
            LockMode::Shared => FlockOperation::LockShared,
            LockMode::Exclusive => FlockOperation::LockExclusive,
        };
        flock(file.as_fd(), op).map_err(std::io::Error::from)?;

        Ok(LockGuard { file })
    }

    /// Try to acquire the named lock without blocking.
    ///
    /// Returns `Ok(None)` when another holder has it.
    pub fn try_lock(&self, name: &str, mode: LockMode) -> Result<Option<LockGuard>> {
        let file: File = self
            .locks_dir
            .open_with(
                name,
                OpenOptions::new().create(true).read(true).write(true),
            )?
            .into_std();

        let op = match mode {
            LockMode::Shared => FlockOperation::NonBlockingLockShared,
            LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
        };
        match flock(file.as_fd(), op) {
            Ok(()) => Ok(Some(LockGuard { file })),
            Err(rustix::io::Errno::WOULDBLOCK) => Ok(None),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std::ambient_authority;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    fn locksmith_at(path: &std::path::Path) -> Locksmith {
        Locksmith::new(Dir::open_ambient_dir(path, ambient_authority()).unwrap())
    }

    #[test]
    fn lock_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let locksmith = locksmith_at(dir.path());

        {
            let _guard = locksmith.lock("gc", LockMode::Exclusive).unwrap();
        }
        // Released on drop; can be taken again.
        let _guard = locksmith.lock("gc", LockMode::Exclusive).unwrap();
    }

    #[test]
    fn exclusive_excludes_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let a = locksmith_at(dir.path());
        let b = locksmith_at(dir.path());

        let guard = a.lock("volume-abc", LockMode::Exclusive).unwrap();
        assert!(b.try_lock("volume-abc", LockMode::Exclusive).unwrap().is_none());
        drop(guard);
        assert!(b.try_lock("volume-abc", LockMode::Exclusive).unwrap().is_some());
    }

    #[test]
    fn shared_admits_shared_but_not_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let a = locksmith_at(dir.path());
        let b = locksmith_at(dir.path());

        let _read_a = a.lock("gc", LockMode::Shared).unwrap();
        let read_b = b.try_lock("gc", LockMode::Shared).unwrap();
        assert!(read_b.is_some());
        assert!(b.try_lock("gc", LockMode::Exclusive).unwrap().is_none());
    }

    #[test]
    fn distinct_names_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let a = locksmith_at(dir.path());
        let b = locksmith_at(dir.path());

        let _one = a.lock("volume-one", LockMode::Exclusive).unwrap();
        assert!(b.try_lock("volume-two", LockMode::Exclusive).unwrap().is_some());
    }

    #[test]
    fn blocking_lock_serializes_threads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let in_section = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let path = path.clone();
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            handles.push(thread::spawn(move || {
                let locksmith = locksmith_at(&path);
                for _ in 0..10 {
                    let _guard = locksmith.lock("counter", LockMode::Exclusive).unwrap();
                    let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    in_section.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
