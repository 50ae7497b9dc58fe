//! Queue configuration: sensible defaults, `build()`-time validation, nothing that can silently
//! produce a broken configuration.

use std::time::Duration;

use snafu::Snafu;

pub use crate::ipc::sem::Backend as SemaphoreBackend;

/// Rotate a write bucket once it exceeds this many bytes.
pub const DEFAULT_BUCKET_SIZE: u64 = 10 * 1024 * 1024;

/// Number of successful reads between durable position flushes.
pub const DEFAULT_SYNC_AGE: u64 = 500;

/// Timeout for the reader-serialization semaphore, per the `get` protocol.
pub const DEFAULT_READER_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Tunables for a [`crate::Queue`].
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub(crate) bucket_size: u64,
    pub(crate) sync_age: u64,
    pub(crate) reader_lock_timeout: Duration,
    pub(crate) compress: bool,
    pub(crate) semaphore_backend: SemaphoreBackend,
}

impl QueueConfig {
    /// Starts a new builder with every tunable at its documented default.
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }

    /// A config with every tunable at its documented default.
    pub fn defaults() -> Self {
        QueueConfigBuilder::default()
            .build()
            .expect("default configuration is always valid")
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Builder for [`QueueConfig`].
#[derive(Clone, Debug)]
pub struct QueueConfigBuilder {
    bucket_size: u64,
    sync_age: u64,
    reader_lock_timeout: Duration,
    compress: bool,
    semaphore_backend: SemaphoreBackend,
}

impl Default for QueueConfigBuilder {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            sync_age: DEFAULT_SYNC_AGE,
            reader_lock_timeout: DEFAULT_READER_LOCK_TIMEOUT,
            compress: true,
            semaphore_backend: SemaphoreBackend::Auto,
        }
    }
}

impl QueueConfigBuilder {
    /// Sets the rotation threshold, in bytes, for write buckets.
    ///
    /// Defaults to 10 MiB.
    pub fn bucket_size(mut self, amount: u64) -> Self {
        self.bucket_size = amount;
        self
    }

    /// Sets how many successful reads occur between durable position flushes.
    ///
    /// Smaller values bound redelivery after a crash more tightly, at the cost of more `fsync`
    /// calls against the position file. Defaults to 500.
    pub fn sync_age(mut self, amount: u64) -> Self {
        self.sync_age = amount;
        self
    }

    /// Sets the timeout for acquiring the reader-serialization lock inside `get`.
    ///
    /// Defaults to 5 seconds.
    pub fn reader_lock_timeout(mut self, timeout: Duration) -> Self {
        self.reader_lock_timeout = timeout;
        self
    }

    /// Sets whether payloads are DEFLATE-compressed before being framed and written.
    ///
    /// Defaults to `true`. Disable this for payloads that are already compressed, encrypted, or
    /// small enough that compression overhead isn't worth it.
    pub fn compress(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    /// Forces a specific named-semaphore back-end instead of letting [`Queue::open`] probe for
    /// one at startup.
    ///
    /// Defaults to [`SemaphoreBackend::Auto`]. Use this on a host where you know only one IPC
    /// family is available and would rather fail immediately with a clear error than pay for (or
    /// silently succeed past) a probe that could only ever resolve one way.
    ///
    /// [`Queue::open`]: crate::Queue::open
    pub fn semaphore_backend(mut self, backend: SemaphoreBackend) -> Self {
        self.semaphore_backend = backend;
        self
    }

    /// Consumes this builder, validating every tunable.
    pub fn build(self) -> Result<QueueConfig, BuildError> {
        if self.bucket_size == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "bucket_size",
                reason: "cannot be zero".to_string(),
            });
        }

        if self.sync_age == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "sync_age",
                reason: "cannot be zero".to_string(),
            });
        }

        Ok(QueueConfig {
            bucket_size: self.bucket_size,
            sync_age: self.sync_age,
            reader_lock_timeout: self.reader_lock_timeout,
            compress: self.compress,
            semaphore_backend: self.semaphore_backend,
        })
    }
}
