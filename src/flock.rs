//! Exclusive advisory file locking, scoped to a block via RAII.
//!
//! This is the thinnest layer in the crate: `fslock::LockFile` already gives us a cross-platform
//! advisory lock, we just wrap it so callers get a guard that is released on every exit path
//! (including an unwinding panic), instead of having to remember to call `unlock()` themselves.

use std::io;
use std::path::Path;

use fslock::LockFile;

/// An exclusive advisory lock over a file, released when the guard is dropped.
pub struct FileLock {
    inner: LockFile,
}

impl FileLock {
    /// Opens (creating if necessary) the file at `path` for locking purposes.
    ///
    /// This does not itself acquire the lock; call [`FileLock::acquire`] for that.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            inner: LockFile::open(path)?,
        })
    }

    /// Blocks until the lock is acquired, returning a guard that releases it on drop.
    pub fn acquire(&mut self) -> io::Result<LockGuard<'_>> {
        self.inner.lock()?;
        Ok(LockGuard { lock: &mut self.inner })
    }
}

/// RAII guard for a held [`FileLock`]. Unlocks on drop; unlock errors are logged, not propagated,
/// since there's nothing a caller can usefully do about a failed `unlock` at that point.
pub struct LockGuard<'a> {
    lock: &'a mut LockFile,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            tracing::warn!(error = %e, "failed to release file lock");
        }
    }
}
