//! Nested mutual exclusion: an intra-process mutex wrapping a whole-file
//! advisory lock on `root/lock`, acquired around every state transition and
//! query. One lock file guards the whole store rather than one per key,
//! since every key's state lives under the same root and transitions are
//! observed and mutated together.

use crate::prelude::*;
use crate::util::retry_interrupted;
use fs2::FileExt;
use std::fs::{self, File};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Owns the process-local mutex and the open file descriptor used for the
/// cross-process advisory lock. Lives inside `store::Inner` for the whole
/// lifetime of a [`crate::ContentStore`] handle.
pub(crate) struct StoreLock {
    file: File,
    mutex: Mutex<()>,
}

impl StoreLock {
    /// Opens (creating if necessary) `root/lock`. Does not itself acquire
    /// the lock -- that happens per-operation in [`StoreLock::acquire`].
    pub(crate) fn open(lock_path: &Path) -> Result<StoreLock> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(lock_path)?;
        Ok(StoreLock {
            file,
            mutex: Mutex::new(()),
        })
    }

    /// Acquire both locks, in order: process-local mutex first, then the
    /// cross-process file lock. The returned guard releases them in reverse
    /// order on drop.
    pub(crate) fn acquire(&self) -> Result<LockGuard<'_>> {
        let mutex_guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        trace!("acquiring advisory lock on store lock file");
        retry_interrupted(|| self.file.lock_exclusive())?;
        Ok(LockGuard {
            file: &self.file,
            _mutex_guard: mutex_guard,
        })
    }
}

/// Held for the duration of one store operation. Releasing it (via `Drop`)
/// unlocks the file first, then drops the process-local mutex guard --
/// the acquisition order, reversed.
pub(crate) struct LockGuard<'a> {
    file: &'a File,
    _mutex_guard: MutexGuard<'a, ()>,
}

impl<'a> Drop for LockGuard<'a> {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(self.file) {
            warn!("failed to release store lock: {e}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn acquire_then_release_allows_reacquire() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let lock = StoreLock::open(&tmp.path().join("lock"))?;
        {
            let _g = lock.acquire()?;
        }
        let _g2 = lock.acquire()?;
        Ok(())
    }

    #[test]
    fn two_independent_file_handles_serialize() -> Result<()> {
        // Simulates two processes: two separate opens of the same lock file.
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("lock");
        let a = StoreLock::open(&path)?;
        let b = StoreLock::open(&path)?;

        let guard_a = a.acquire()?;
        assert!(b.file.try_lock_exclusive().is_err());
        drop(guard_a);
        // Now b can get it.
        b.file.try_lock_exclusive()?;
        fs2::FileExt::unlock(&b.file)?;
        Ok(())
    }
}
