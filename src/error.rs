//! Error types for every subsystem in this crate.
//!
//! Each subsystem gets its own `snafu`-derived enum so that callers can match on the specific
//! failure mode without wading through a single monolithic error type. [`QueueError`] wraps all
//! of them for the public `Queue` API surface.

use std::io;
use std::path::PathBuf;

use snafu::Snafu;

/// Errors raised by the named-semaphore and shared-memory IPC primitives.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IpcError {
    #[snafu(display("failed to open or create semaphore {:?}: {}", name, source))]
    SemaphoreOpen { name: String, source: io::Error },

    #[snafu(display("semaphore {:?} operation failed: {}", name, source))]
    SemaphoreOp { name: String, source: io::Error },

    #[snafu(display("failed to open or create shared memory segment {:?}: {}", name, source))]
    SharedMemoryOpen { name: String, source: io::Error },

    #[snafu(display("shared memory segment {:?} is smaller than required ({} < {})", name, actual, required))]
    SharedMemoryTooSmall {
        name: String,
        actual: usize,
        required: usize,
    },
}

/// Errors raised while reading or writing the durable/live position state.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PositionError {
    #[snafu(display("failed to open position file {:?}: {}", path, source))]
    Open { path: PathBuf, source: io::Error },

    #[snafu(display("failed to lock position file {:?}: {}", path, source))]
    Lock { path: PathBuf, source: io::Error },

    #[snafu(display("failed to read or write position file {:?}: {}", path, source))]
    Io { path: PathBuf, source: io::Error },

    #[snafu(display("position IPC error: {}", source))]
    Ipc { source: IpcError },
}

/// Errors raised by the segmented log (bucket open/rotate/cleanup).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SegmentError {
    #[snafu(display("failed to open bucket {:?}: {}", path, source))]
    OpenBucket { path: PathBuf, source: io::Error },

    #[snafu(display("failed to acquire lock on bucket {:?}: {}", path, source))]
    LockBucket { path: PathBuf, source: io::Error },

    #[snafu(display("failed to write to bucket {:?}: {}", path, source))]
    WriteBucket { path: PathBuf, source: io::Error },

    #[snafu(display("failed to fsync bucket {:?}: {}", path, source))]
    SyncBucket { path: PathBuf, source: io::Error },
}

/// Outcome of attempting to decode one framed record at the current read offset.
#[derive(Debug)]
pub enum RecordError {
    /// The reader is at (or past) the end of the readable data; no record is here yet.
    Eof,
    /// The framing or checksum did not validate; the bytes at this offset are not a valid record.
    Corrupt { reason: &'static str },
    /// A hard I/O error occurred while reading.
    Io(io::Error),
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Eof => write!(f, "end of file"),
            RecordError::Corrupt { reason } => write!(f, "corrupt record: {reason}"),
            RecordError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RecordError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            RecordError::Eof
        } else {
            RecordError::Io(e)
        }
    }
}

/// Top-level error type returned from fatal [`crate::Queue`] operations.
///
/// An empty queue on `get` is not an error: [`crate::Queue::get`] reports it as `Ok(None)`, since
/// "no record arrived within the timeout" is an expected outcome, not a failure.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    #[snafu(display("position store error: {}", source))]
    Position { source: PositionError },

    #[snafu(display("segment log error: {}", source))]
    Segment { source: SegmentError },

    #[snafu(display("IPC error: {}", source))]
    Ipc { source: IpcError },

    #[snafu(display("record error: {}", source))]
    Record { source: io::Error },
}

impl From<PositionError> for QueueError {
    fn from(source: PositionError) -> Self {
        QueueError::Position { source }
    }
}

impl From<SegmentError> for QueueError {
    fn from(source: SegmentError) -> Self {
        QueueError::Segment { source }
    }
}

impl From<IpcError> for QueueError {
    fn from(source: IpcError) -> Self {
        QueueError::Ipc { source }
    }
}
