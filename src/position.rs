//! Durable and live read-position tracking.
//!
//! Two representations of the same logical fact — "how far has any consumer read?" — are kept:
//!
//! - the *durable* copy, a 16-byte `(bucket: u64, offset: u64)` tuple in `<name>.pos`, fsynced on
//!   every write, which is what recovery trusts after a crash;
//! - the *live* copy, a 24-byte `(bucket: u64, offset: u64, age: u64)` triple in a shared-memory
//!   segment, which every `get` reads and writes without ever touching disk.
//!
//! The durable copy is always a lower bound on the live copy: it's updated every `sync_age` reads
//! (or on bucket rotation), trading a bounded amount of at-least-once redelivery after a crash for
//! not having to `fsync` on every single read.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use snafu::ResultExt;

use crate::error::{IoSnafu, LockSnafu, OpenSnafu, PositionError};
use crate::flock::FileLock;
use crate::ipc::shm::SharedMemory;

/// Size, in bytes, of the live position triple: three little-endian `u64`s.
pub const LIVE_LEN: usize = 24;
/// Size, in bytes, of the durable position tuple: two little-endian `u64`s.
const DURABLE_LEN: usize = 16;

pub struct PositionStore {
    durable_path: PathBuf,
    durable_file: File,
    durable_lock: FileLock,
    live: SharedMemory,
}

impl PositionStore {
    /// Attaches to (initializing if this is the first process to ever open this queue name) the
    /// position state for `name`.
    pub fn open(name: &str) -> Result<Self, PositionError> {
        let durable_path = PathBuf::from(format!("{name}.pos"));
        let is_new = !durable_path.exists();

        let durable_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&durable_path)
            .context(OpenSnafu { path: durable_path.clone() })?;
        let durable_lock = FileLock::open(&durable_path).context(OpenSnafu { path: durable_path.clone() })?;
        let live = SharedMemory::open(&format!("{name}.spos"), LIVE_LEN).map_err(|source| PositionError::Ipc { source })?;

        let mut store = Self {
            durable_path,
            durable_file,
            durable_lock,
            live,
        };

        if is_new {
            // First process to ever see this queue name: both representations start at (0, 0).
            store.write_live(0, 0, 0);
            store.update_durable(0, 0)?;
        }

        Ok(store)
    }

    pub fn durable_path(&self) -> &Path {
        &self.durable_path
    }

    /// Reads the live `(bucket, offset, age)` triple from the shared-memory mirror.
    pub fn read_live(&self) -> (u64, u64, u64) {
        let bytes = self.live.as_slice();
        let bucket = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let offset = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let age = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        (bucket, offset, age)
    }

    /// Writes `(bucket, offset, age)` to the shared-memory mirror. Not flushed to disk; the
    /// mirror is advisory and can legitimately be lost on reboot.
    pub fn write_live(&mut self, bucket: u64, offset: u64, age: u64) {
        let bytes = self.live.as_mut_slice();
        bytes[0..8].copy_from_slice(&bucket.to_le_bytes());
        bytes[8..16].copy_from_slice(&offset.to_le_bytes());
        bytes[16..24].copy_from_slice(&age.to_le_bytes());
    }

    /// Reads the durable `(bucket, offset)` tuple under the position file's own lock.
    pub fn read_durable(&mut self) -> Result<(u64, u64), PositionError> {
        let path = self.durable_path.clone();
        let _guard = self.durable_lock.acquire().context(LockSnafu { path: path.clone() })?;

        self.durable_file
            .seek(SeekFrom::Start(0))
            .context(IoSnafu { path: path.clone() })?;
        let mut buf = [0u8; DURABLE_LEN];
        let mut filled = 0;
        loop {
            match self.durable_file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "fatal I/O error reading durable position");
                    return Err(e).context(IoSnafu { path });
                }
            }
        }

        if filled < DURABLE_LEN {
            // New, empty, or truncated position file: treat as "nothing read yet".
            return Ok((0, 0));
        }

        let bucket = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let offset = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        Ok((bucket, offset))
    }

    /// Overwrites the durable position under the position file's lock, flushing and fsyncing
    /// before returning. This is the operation that bounds post-crash redelivery: once it
    /// returns, a crash can replay at most the records read since the *previous* call.
    pub fn update_durable(&mut self, bucket: u64, offset: u64) -> Result<(), PositionError> {
        let path = self.durable_path.clone();
        let _guard = self
            .durable_lock
            .acquire()
            .map_err(|e| {
                tracing::error!(path = %path.display(), error = %e, "fatal: failed to lock position file");
                e
            })
            .context(LockSnafu { path: path.clone() })?;

        self.durable_file
            .seek(SeekFrom::Start(0))
            .context(IoSnafu { path: path.clone() })?;

        let mut buf = [0u8; DURABLE_LEN];
        buf[0..8].copy_from_slice(&bucket.to_le_bytes());
        buf[8..16].copy_from_slice(&offset.to_le_bytes());
        self.durable_file
            .write_all(&buf)
            .and_then(|_| self.durable_file.flush())
            .and_then(|_| self.durable_file.sync_all())
            .map_err(|e| {
                tracing::error!(path = %path.display(), bucket, offset, error = %e, "fatal I/O error updating durable position");
                e
            })
            .context(IoSnafu { path })?;

        tracing::trace!(bucket, offset, "durable position updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn queue_name(dir: &TempDir, label: &str) -> String {
        dir.path().join(label).to_string_lossy().into_owned()
    }

    #[test]
    fn fresh_queue_starts_at_zero() {
        let dir = TempDir::new().unwrap();
        let name = queue_name(&dir, "q1");
        let mut store = PositionStore::open(&name).unwrap();
        assert_eq!(store.read_live(), (0, 0, 0));
        assert_eq!(store.read_durable().unwrap(), (0, 0));
    }

    #[test]
    fn durable_update_is_visible_after_reopen() {
        let dir = TempDir::new().unwrap();
        let name = queue_name(&dir, "q2");
        {
            let mut store = PositionStore::open(&name).unwrap();
            store.update_durable(3, 128).unwrap();
        }
        let mut store = PositionStore::open(&name).unwrap();
        assert_eq!(store.read_durable().unwrap(), (3, 128));
    }

    #[test]
    fn live_mirror_does_not_require_flush_to_read_back() {
        let dir = TempDir::new().unwrap();
        let name = queue_name(&dir, "q3");
        let mut store = PositionStore::open(&name).unwrap();
        store.write_live(7, 42, 3);
        assert_eq!(store.read_live(), (7, 42, 3));
    }
}
