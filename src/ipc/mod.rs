//! Inter-process coordination primitives: named semaphores and a shared-memory segment.
//!
//! Everything here is `cfg(unix)` — named semaphores and POSIX/SysV shared memory are unix
//! concepts with no portable cross-platform equivalent this crate tries to paper over.

pub mod sem;
pub mod shm;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Derives a stable, process-independent key from a queue name and a component suffix, the same
/// way the engine derives distinct IPC identities for the pending-item semaphore, the
/// reader-serialization semaphore, and the shared-memory position mirror from one queue name.
pub(crate) fn stable_key(name: &str, suffix: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    suffix.hash(&mut hasher);
    hasher.finish()
}
