//! `diskqueue` is a persistent, multi-process FIFO queue backed by a segmented on-disk log.
//!
//! Producers and consumers — in the same process or different ones — open a [`Queue`] by name and
//! call [`Queue::put`] / [`Queue::get`]. Coordination between processes goes through named
//! semaphores and a small shared-memory mirror of the read position, not through any in-process
//! lock, so any number of processes on the same host can share one queue without a broker.
//!
//! Delivery is at-least-once: a crash between a consumer reading a record and the durable position
//! catching up can redeliver that record (bounded by [`config::QueueConfigBuilder::sync_age`]), but
//! a record is never dropped once `put` returns successfully.
//!
//! ```no_run
//! use diskqueue::Queue;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), diskqueue::QueueError> {
//! let mut queue = Queue::open("/var/run/myapp/jobs")?;
//! queue.put(b"job payload")?;
//!
//! if let Some(payload) = queue.get(Some(Duration::from_secs(1)))? {
//!     println!("got {} bytes", payload.len());
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod flock;
mod ipc;
mod position;
mod queue;
mod record;
mod segment;

pub use config::{BuildError, QueueConfig, QueueConfigBuilder, SemaphoreBackend};
pub use error::{IpcError, PositionError, QueueError, RecordError, SegmentError};
pub use queue::Queue;
