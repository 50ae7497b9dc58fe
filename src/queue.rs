//! The queue engine: ties the position store, the segmented log, and the IPC primitives together
//! into `put`/`get`.
//!
//! The two operations hold up the same invariant throughout: the pending-item semaphore's count
//! must never be *lower* than the number of records actually unread on disk, only ever equal to
//! or (briefly, harmlessly) higher. `put` always signals after its record is durably appended;
//! `get` only ever consumes one signal per successful read, and if it consumes a signal but finds
//! nothing readable (a stale wakeup racing a bucket rotation, or the sentinel signal from `stop`),
//! it simply returns without producing a record rather than blocking again to "catch up". Losing a
//! signal occasionally is safe; inventing a record that isn't there would not be.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::QueueConfig;
use crate::error::{IpcError, QueueError, RecordError};
use crate::ipc::sem::{self, Semaphore};
use crate::position::PositionStore;
use crate::record;
use crate::segment::SegmentLog;

/// A persistent, multi-process FIFO queue backed by a segmented on-disk log.
///
/// Multiple `Queue` handles, in the same process or different ones, can safely share one `name`:
/// producers calling `put` and consumers calling `get` concurrently see the same logical
/// sequence of records, delivered at least once.
pub struct Queue {
    name: String,
    config: QueueConfig,
    position: PositionStore,
    segment: SegmentLog,
    pending_sem: Box<dyn Semaphore>,
    reader_sem: Box<dyn Semaphore>,
    stopped: AtomicBool,
}

impl Queue {
    /// Opens (creating if necessary) the queue named `name` with default tunables.
    pub fn open(name: impl Into<String>) -> Result<Self, QueueError> {
        Self::with_config(name, QueueConfig::defaults())
    }

    /// Opens (creating if necessary) the queue named `name` with the given tunables.
    pub fn with_config(name: impl Into<String>, config: QueueConfig) -> Result<Self, QueueError> {
        let name = name.into();
        let mut position = PositionStore::open(&name)?;
        let segment = SegmentLog::new(name.clone());

        let (durable_bucket, durable_offset) = position.read_durable()?;
        let initial_pending = recover_pending_count(&segment, config.compress, durable_bucket, durable_offset)?;

        let pending_sem = sem::open(&format!("{name}.sem"), initial_pending, config.semaphore_backend)
            .map_err(|source| QueueError::Ipc { source })?;
        let reader_sem = sem::open(&format!("{name}.lock"), 1, config.semaphore_backend)
            .map_err(|source| QueueError::Ipc { source })?;

        tracing::debug!(name = %name, initial_pending, "queue opened");

        Ok(Self {
            name,
            config,
            position,
            segment,
            pending_sem,
            reader_sem,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends `payload` durably and signals one waiting (or future) consumer.
    ///
    /// Returns once the record is fsynced to its bucket file; the pending-item semaphore is only
    /// released after that point, so a crash between the write and the signal just means the
    /// record is picked up on next recovery instead of being delivered twice.
    pub fn put(&mut self, payload: &[u8]) -> Result<(), QueueError> {
        let framed = record::encode(payload, self.config.compress).map_err(|source| QueueError::Record { source })?;

        // Re-derive the current write bucket from disk on every call rather than trusting a
        // cached number: any producer process, not just this handle, may have rotated it since
        // our last write.
        let bucket = self.segment.list_buckets()?.into_iter().max().unwrap_or(0);
        let mut writer = self.segment.open_write(bucket)?;
        let new_len = writer.append(&framed)?;
        drop(writer);

        if new_len > self.config.bucket_size {
            // Touch the next bucket into existence now, so every producer's next `list_buckets`
            // agrees on where to write, and every consumer's next `get` knows this bucket is done.
            drop(self.segment.open_write(bucket + 1)?);
            tracing::debug!(old_bucket = bucket, new_bucket = bucket + 1, "rotated write bucket");
        }

        self.pending_sem.release().map_err(|source| QueueError::Ipc { source })?;
        Ok(())
    }

    /// Waits up to `timeout` for a record (`None` blocks indefinitely, `Some(Duration::ZERO)`
    /// never blocks) and returns it, or `Ok(None)` if none became available in time.
    ///
    /// A single call may internally retry: acquiring the pending-item signal only promises that
    /// *something* was released, not that a decodable record is still sitting at the read cursor
    /// (a spurious wakeup, or one that raced a corruption reset, can leave nothing to read). Each
    /// retry re-acquires both the pending-item and reader-serialization semaphores from scratch,
    /// so a retry that finds nothing still leaves both counters correct for whichever other
    /// `get` comes next, in this process or another.
    pub fn get(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, QueueError> {
        loop {
            let acquired =
                sem::acquire_timed(self.pending_sem.as_ref(), timeout).map_err(|source| QueueError::Ipc { source })?;
            if !acquired {
                return Ok(None);
            }

            if self.stopped.load(Ordering::SeqCst) {
                // This may be the sentinel signal `stop` releases to wake a blocked reader, or it
                // may be a real record that will simply be picked up by the next `get` after
                // restart. Either way a stopped queue reports no new records.
                return Ok(None);
            }

            let lock_acquired = sem::acquire_timed(self.reader_sem.as_ref(), Some(self.config.reader_lock_timeout))
                .map_err(|source| QueueError::Ipc { source })?;
            if !lock_acquired {
                if self.stopped.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                if let Err(e) = self.pending_sem.release() {
                    tracing::warn!(error = %e, "failed to restore pending signal after reader-lock timeout");
                }
                tracing::error!(
                    name = self.reader_sem.name(),
                    timeout = ?self.config.reader_lock_timeout,
                    "fatal: reader-serialization lock acquisition timed out"
                );
                return Err(QueueError::Ipc {
                    source: IpcError::SemaphoreOp {
                        name: self.reader_sem.name().to_string(),
                        source: io::Error::new(io::ErrorKind::TimedOut, "reader-serialization lock acquisition timed out"),
                    },
                });
            }

            let outcome = self.read_one_locked();

            if let Err(e) = self.reader_sem.release() {
                tracing::warn!(error = %e, "failed to release reader-serialization semaphore");
            }

            match outcome? {
                ReadOutcome::Emitted(payload) => return Ok(Some(payload)),
                ReadOutcome::Rewait => continue,
            }
        }
    }

    /// Performs exactly one read attempt, assuming the reader-serialization lock is already
    /// held. Never loops internally: `Eof` and `Corrupt` both resolve to [`ReadOutcome::Rewait`]
    /// so the caller re-acquires the pending-item signal before trying again, matching the
    /// `WaitSignal -> HoldLock -> ... -> Rewait -> WaitSignal` cycle this engine is built around.
    fn read_one_locked(&mut self) -> Result<ReadOutcome, QueueError> {
        let (bucket, offset, age) = self.position.read_live();
        let mut reader = self.segment.open_read(bucket, offset)?;

        match record::decode(&mut reader, self.config.compress) {
            Ok(payload) => {
                let mut new_bucket = bucket;
                let mut new_offset = reader.position().map_err(|source| QueueError::Record { source })?;
                let mut forced_sync = false;

                if new_offset > self.config.bucket_size {
                    // This bucket is spent. Buckets are only ever reclaimed one generation
                    // behind the bucket just finished (`bucket - 1` and below) — the bucket we
                    // just emptied is left for the *next* rotation to clean up, so a reader that
                    // is momentarily one bucket behind another never has the file pulled out from
                    // under it.
                    if bucket > 0 {
                        self.segment.cleanup(bucket - 1)?;
                    }
                    new_bucket = bucket + 1;
                    new_offset = 0;
                    forced_sync = true;
                    reader = self.segment.open_read(new_bucket, 0)?;
                    tracing::debug!(old_bucket = bucket, new_bucket, "rotated read bucket");
                }

                // If there's more to read right now, re-release the pending-item signal so the
                // next `get` (here or in another process) doesn't have to wait for a producer.
                // This double-release is deliberate, not a bug: see the module-level invariant
                // note on over-signalling.
                let mut peek = [0u8; 1];
                if matches!(reader.read(&mut peek), Ok(1)) {
                    if let Err(e) = self.pending_sem.release() {
                        tracing::warn!(error = %e, "failed to re-release pending signal for pipelined read");
                    }
                }

                // `age` here is the counter as of the *start* of this attempt; a forced rotation
                // always takes the durable-sync branch regardless of `age`. The persisted live age
                // is always one tick ahead of whatever age the sync decision was made against.
                if forced_sync || age >= self.config.sync_age {
                    self.position.update_durable(new_bucket, new_offset)?;
                    self.position.write_live(new_bucket, new_offset, 1);
                } else {
                    self.position.write_live(new_bucket, new_offset, age + 1);
                }

                Ok(ReadOutcome::Emitted(payload))
            }
            Err(RecordError::Eof) => {
                // Nothing new at this offset yet. The offset itself hasn't moved; this just
                // ticks `age` the same as any other attempt, so a long run of empty wakeups still
                // eventually flushes the durable position.
                if age >= self.config.sync_age {
                    self.position.update_durable(bucket, offset)?;
                    self.position.write_live(bucket, offset, 1);
                } else {
                    self.position.write_live(bucket, offset, age + 1);
                }
                Ok(ReadOutcome::Rewait)
            }
            Err(RecordError::Corrupt { reason }) => {
                // The bytes at the live offset don't decode. Don't try to skip past them — we
                // don't know how large the bad frame actually is — instead fall back to the last
                // known-good durable position and let the caller retry from there.
                tracing::warn!(bucket, offset, reason, "corrupt record, resetting to durable position");
                let (durable_bucket, durable_offset) = self.position.read_durable()?;

                if (durable_bucket, durable_offset) == (bucket, offset) {
                    // The durable position points at the exact same offset that just failed to
                    // decode, so resetting to it changes nothing: the next attempt will land right
                    // back here and fail the same way. The queue is stuck at this offset until an
                    // operator intervenes (truncating or skipping the bad record); this loop alone
                    // cannot make progress.
                    tracing::error!(
                        bucket,
                        offset,
                        reason,
                        "queue permanently stuck: durable position also points into corrupt data"
                    );
                }

                self.position.write_live(durable_bucket, durable_offset, 0);
                Ok(ReadOutcome::Rewait)
            }
            Err(RecordError::Io(e)) => {
                tracing::error!(bucket, offset, error = %e, "fatal I/O error decoding record");
                Err(QueueError::Record { source: e })
            }
        }
    }

    /// Signals every blocked (and future) `get` to stop waiting for new records.
    ///
    /// Existing on-disk records and IPC state are untouched; this only affects this process's
    /// view of whether the queue is accepting new reads. A producer can still `put` afterward,
    /// and a fresh `Queue::open` is unaffected by a prior handle's `stop`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Err(e) = self.pending_sem.release() {
            tracing::warn!(error = %e, "failed to release wakeup signal on stop");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Releases this handle's local resources (file descriptors, semaphore handles, the
    /// shared-memory mapping). On-disk bucket files, the position file, and the underlying IPC
    /// objects are left intact for other handles or a later `open`.
    pub fn close(self) {}
}

/// Result of one `read_one_locked` attempt.
enum ReadOutcome {
    /// A record was decoded and the position advanced past it.
    Emitted(Vec<u8>),
    /// Nothing decodable was at the read cursor (EOF or corruption); the caller should release
    /// the locks it holds and wait for the next signal before trying again.
    Rewait,
}

/// Counts how many full records sit between `(from_bucket, from_offset)` and the end of the log,
/// used to seed a freshly-created pending-item semaphore at startup so a crash that loses the
/// semaphore's in-kernel value doesn't also lose track of unread records still sitting on disk.
///
/// This is best-effort: a corrupt record partway through a bucket stops the count for that
/// bucket rather than erroring, since recovery's job here is an approximate initial value, not
/// validation (`get` itself handles corruption when it actually reaches that offset).
fn recover_pending_count(
    segment: &SegmentLog,
    compress: bool,
    from_bucket: u64,
    from_offset: u64,
) -> Result<u32, QueueError> {
    let buckets: Vec<u64> = segment
        .list_buckets()?
        .into_iter()
        .filter(|&b| b >= from_bucket)
        .collect();

    let mut count: u32 = 0;
    for bucket in buckets {
        let start_offset = if bucket == from_bucket { from_offset } else { 0 };
        let mut reader = segment.open_read(bucket, start_offset)?;
        loop {
            match record::decode(&mut reader, compress) {
                Ok(_) => count = count.saturating_add(1),
                Err(_) => break,
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, label: &str) -> Queue {
        let name = dir.path().join(label).to_string_lossy().into_owned();
        Queue::open(name).unwrap()
    }

    #[test]
    fn put_then_get_round_trips_in_order() {
        let dir = TempDir::new().unwrap();
        let mut q = open(&dir, "order");

        q.put(b"first").unwrap();
        q.put(b"second").unwrap();

        assert_eq!(q.get(Some(Duration::ZERO)).unwrap().unwrap(), b"first");
        assert_eq!(q.get(Some(Duration::ZERO)).unwrap().unwrap(), b"second");
    }

    #[test]
    fn get_on_empty_queue_returns_none_without_blocking() {
        let dir = TempDir::new().unwrap();
        let mut q = open(&dir, "empty");
        assert_eq!(q.get(Some(Duration::ZERO)).unwrap(), None);
    }

    #[test]
    fn bucket_rotates_one_generation_lagged_cleanup() {
        // Mirrors the scenario from the design docs: a small bucket_size, two puts that land in
        // separate buckets, and a get per put. Reclamation lags one generation behind the read
        // cursor (cleanup(bucket - 1), never cleanup(bucket) itself), so after the second get
        // bucket 0 is gone but bucket 1 — the one just read from — still exists.
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("rotate").to_string_lossy().into_owned();
        let config = QueueConfig::builder().bucket_size(8).compress(false).build().unwrap();
        let mut q = Queue::with_config(name, config).unwrap();

        q.put(b"aaaaa").unwrap();
        q.put(b"bbbbb").unwrap();

        assert_eq!(q.get(Some(Duration::ZERO)).unwrap().unwrap(), b"aaaaa");
        assert_eq!(q.get(Some(Duration::ZERO)).unwrap().unwrap(), b"bbbbb");

        let remaining = q.segment.list_buckets().unwrap();
        assert!(!remaining.contains(&0), "bucket 0 should have been reclaimed: {remaining:?}");
        assert!(remaining.contains(&1), "bucket 1 should still exist: {remaining:?}");
    }

    #[test]
    fn old_buckets_are_eventually_reclaimed_under_sustained_rotation() {
        // With enough rotations, every bucket two or more generations behind the read cursor is
        // gone; only the most recently finished bucket and the current (possibly empty) write/
        // read bucket remain.
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("rotate-many").to_string_lossy().into_owned();
        let config = QueueConfig::builder().bucket_size(32).compress(false).build().unwrap();
        let mut q = Queue::with_config(name, config).unwrap();

        for _ in 0..8 {
            q.put(b"0123456789").unwrap();
        }
        assert!(q.segment.list_buckets().unwrap().len() > 1);

        for _ in 0..8 {
            assert_eq!(q.get(Some(Duration::ZERO)).unwrap().unwrap(), b"0123456789");
        }

        let remaining = q.segment.list_buckets().unwrap();
        assert!(remaining.len() <= 2, "expected at most a lagged bucket and the current one: {remaining:?}");
    }

    #[test]
    fn reopening_after_put_recovers_pending_count() {
        let dir = TempDir::new().unwrap();
        let name = dir.path().join("recover").to_string_lossy().into_owned();
        {
            let mut q = Queue::open(&name).unwrap();
            q.put(b"a").unwrap();
            q.put(b"b").unwrap();
        }

        let mut q = Queue::open(&name).unwrap();
        assert_eq!(q.get(Some(Duration::ZERO)).unwrap().unwrap(), b"a");
        assert_eq!(q.get(Some(Duration::ZERO)).unwrap().unwrap(), b"b");
    }

    #[test]
    fn stop_wakes_a_blocked_get_without_a_record() {
        let dir = TempDir::new().unwrap();
        let mut q = open(&dir, "stop");
        q.stop();
        assert_eq!(q.get(None).unwrap(), None);
    }
}
