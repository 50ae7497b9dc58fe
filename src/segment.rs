//! The segmented on-disk log: a queue's records live in a sequence of numbered bucket files,
//! `<name>.0`, `<name>.1`, ... so that consumed buckets can be deleted outright instead of
//! requiring a compaction pass over one ever-growing file.
//!
//! This module only knows about bytes and bucket numbers; it has no opinion on *which* bucket is
//! currently being read or written, when to rotate, or when a bucket is safe to delete — that
//! policy lives in [`crate::queue`]. What it does guarantee is that every write is durable (an
//! `append` doesn't return until the bytes are fsynced) and that concurrent writers serialize
//! through an exclusive lock on the bucket file itself.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use snafu::ResultExt;

use crate::error::{LockBucketSnafu, OpenBucketSnafu, SegmentError, SyncBucketSnafu, WriteBucketSnafu};
use crate::flock::FileLock;

/// Addresses the family of bucket files sharing one queue name.
pub struct SegmentLog {
    name: String,
}

impl SegmentLog {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn bucket_path(&self, bucket: u64) -> PathBuf {
        PathBuf::from(format!("{}.{}", self.name, bucket))
    }

    /// Lists every bucket number currently present on disk, ascending. Used at startup to find
    /// the oldest unconsumed bucket and the current write bucket without trusting any cached
    /// state.
    pub fn list_buckets(&self) -> Result<Vec<u64>, SegmentError> {
        let name_path = Path::new(&self.name);
        let dir = name_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let prefix = format!(
            "{}.",
            name_path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default()
        );

        let mut buckets = Vec::new();
        let entries = fs::read_dir(dir).context(OpenBucketSnafu { path: dir.to_path_buf() })?;
        for entry in entries {
            let entry = entry.context(OpenBucketSnafu { path: dir.to_path_buf() })?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(suffix) = file_name.strip_prefix(prefix.as_str()) {
                if let Ok(n) = suffix.parse::<u64>() {
                    buckets.push(n);
                }
            }
        }
        buckets.sort_unstable();
        Ok(buckets)
    }

    /// Opens `bucket` for reading, seeking to `offset`. Creates the bucket file if it doesn't
    /// exist yet rather than erroring — a consumer rotating into the next bucket can legitimately
    /// get there before the producer that will eventually write to it, and an empty file just
    /// reads back as EOF, which the record codec already treats as "nothing here yet".
    pub fn open_read(&self, bucket: u64, offset: u64) -> Result<BucketReader, SegmentError> {
        let path = self.bucket_path(bucket);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .context(OpenBucketSnafu { path: path.clone() })?;
        file.seek(SeekFrom::Start(offset)).context(OpenBucketSnafu { path: path.clone() })?;
        Ok(BucketReader { file, bucket, path })
    }

    /// Opens (creating if necessary) `bucket` for appending.
    pub fn open_write(&self, bucket: u64) -> Result<BucketWriter, SegmentError> {
        let path = self.bucket_path(bucket);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .context(OpenBucketSnafu { path: path.clone() })?;
        let lock = FileLock::open(&path).context(LockBucketSnafu { path: path.clone() })?;
        Ok(BucketWriter { file, lock, bucket, path })
    }

    /// Removes bucket `bucket`, then `bucket - 1`, `bucket - 2`, ... for as long as each one
    /// still exists, stopping at the first one that's already gone. A second process racing to
    /// clean up the same buckets (two readers crossing the same bucket boundary around the same
    /// time) is expected, not an error: whichever unlink loses just finds nothing there and the
    /// sweep stops, leaving nothing for the winner to redo.
    pub fn cleanup(&self, bucket: u64) -> Result<(), SegmentError> {
        let mut n = bucket;
        loop {
            let path = self.bucket_path(n);
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!(bucket = n, "removed consumed bucket"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::trace!(bucket = n, "bucket already removed by a racing cleanup");
                    break;
                }
                Err(e) => return Err(e).context(OpenBucketSnafu { path }),
            }
            match n.checked_sub(1) {
                Some(next) => n = next,
                None => break,
            }
        }
        Ok(())
    }
}

/// A bucket opened for sequential reading from some offset.
pub struct BucketReader {
    file: File,
    bucket: u64,
    path: PathBuf,
}

impl BucketReader {
    pub fn bucket(&self) -> u64 {
        self.bucket
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current read offset within the bucket, i.e. where the next record starts.
    pub fn position(&mut self) -> io::Result<u64> {
        self.file.stream_position()
    }
}

impl Read for BucketReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// A bucket opened for appending, holding the lock that serializes concurrent writers.
pub struct BucketWriter {
    file: File,
    lock: FileLock,
    bucket: u64,
    path: PathBuf,
}

impl BucketWriter {
    pub fn bucket(&self) -> u64 {
        self.bucket
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64, SegmentError> {
        self.file
            .metadata()
            .map(|m| m.len())
            .context(OpenBucketSnafu { path: self.path.clone() })
    }

    /// Appends `bytes` and fsyncs before returning. Returns the bucket's new length, so the
    /// caller can decide whether to rotate without a second syscall.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64, SegmentError> {
        let _guard = self
            .lock
            .acquire()
            .map_err(|e| {
                tracing::error!(path = %self.path.display(), error = %e, "fatal: failed to lock write bucket");
                e
            })
            .context(LockBucketSnafu { path: self.path.clone() })?;
        self.file
            .write_all(bytes)
            .map_err(|e| {
                tracing::error!(path = %self.path.display(), error = %e, "fatal I/O error writing to bucket");
                e
            })
            .context(WriteBucketSnafu { path: self.path.clone() })?;
        self.file
            .flush()
            .map_err(|e| {
                tracing::error!(path = %self.path.display(), error = %e, "fatal I/O error flushing bucket");
                e
            })
            .context(WriteBucketSnafu { path: self.path.clone() })?;
        self.file
            .sync_data()
            .map_err(|e| {
                tracing::error!(path = %self.path.display(), error = %e, "fatal I/O error fsyncing bucket");
                e
            })
            .context(SyncBucketSnafu { path: self.path.clone() })?;
        self.file
            .metadata()
            .map(|m| m.len())
            .context(WriteBucketSnafu { path: self.path.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log(dir: &TempDir, label: &str) -> SegmentLog {
        SegmentLog::new(dir.path().join(label).to_string_lossy().into_owned())
    }

    #[test]
    fn write_then_read_back_same_bucket() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir, "q");

        let mut writer = log.open_write(0).unwrap();
        writer.append(b"hello").unwrap();
        writer.append(b"world").unwrap();

        let mut reader = log.open_read(0, 0).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"helloworld");
    }

    #[test]
    fn read_from_offset_skips_earlier_bytes() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir, "q");
        let mut writer = log.open_write(0).unwrap();
        writer.append(b"hello").unwrap();

        let mut reader = log.open_read(0, 3).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"lo");
    }

    #[test]
    fn list_buckets_finds_every_number_ascending() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir, "q");
        for n in [2, 0, 1] {
            log.open_write(n).unwrap().append(b"x").unwrap();
        }
        assert_eq!(log.list_buckets().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir, "q");
        log.open_write(0).unwrap().append(b"x").unwrap();

        log.cleanup(0).unwrap();
        assert!(log.list_buckets().unwrap().is_empty());
        // A second cleanup of an already-removed bucket must not error.
        log.cleanup(0).unwrap();
    }

    #[test]
    fn bucket_length_reflects_appends() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir, "q");
        let mut writer = log.open_write(0).unwrap();
        assert_eq!(writer.len().unwrap(), 0);
        writer.append(b"1234567890").unwrap();
        assert_eq!(writer.len().unwrap(), 10);
    }
}
