//! A fixed-size POSIX shared memory segment, used to hold the live position mirror.
//!
//! We go through `shm_open` + `mmap` (via `memmap2`) rather than a plain file on disk because the
//! mirror is explicitly *not* meant to survive being fsynced or even written through the page
//! cache in the usual sense — it's read on every `get`, so it needs to be as cheap as a memory
//! read, and it's explicitly allowed to be lost across a reboot (the durable copy in `P.pos`
//! is what's recovered from).

use ffi::shm_open_rw;
use memmap2::{MmapMut, MmapOptions};
use snafu::ResultExt;

use crate::error::{IpcError, SharedMemoryOpenSnafu};

/// A shared memory segment of exactly `len` bytes, mapped read-write into this process.
pub struct SharedMemory {
    mmap: MmapMut,
    name: String,
}

impl SharedMemory {
    /// Attaches to (creating and zero-filling if absent) the POSIX shared memory object named
    /// `/name`, sized to exactly `len` bytes.
    pub fn open(name: &str, len: usize) -> Result<Self, IpcError> {
        // As in `ipc::sem`, `name` is a filesystem path plus a suffix and needs to be collapsed
        // to a short, slash-free key before it can serve as a POSIX shared-memory object name.
        let posix_name = format!("/dq{:x}", crate::ipc::stable_key(name, ""));
        let file = shm_open_rw(&posix_name, len)
            .map_err(|e| {
                tracing::error!(name = %posix_name, error = %e, "fatal: failed to open shared-memory segment");
                e
            })
            .context(SharedMemoryOpenSnafu { name: posix_name.clone() })?;

        let actual_len = file
            .metadata()
            .context(SharedMemoryOpenSnafu { name: posix_name.clone() })?
            .len() as usize;
        if actual_len < len {
            tracing::error!(name = %posix_name, actual_len, len, "fatal: shared-memory segment smaller than required");
            return Err(IpcError::SharedMemoryTooSmall {
                name: posix_name,
                actual: actual_len,
                required: len,
            });
        }

        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .map_mut(&file)
                .map_err(|e| {
                    tracing::error!(name = %posix_name, error = %e, "fatal: failed to mmap shared-memory segment");
                    e
                })
                .context(SharedMemoryOpenSnafu { name: posix_name.clone() })?
        };

        Ok(Self { mmap, name: posix_name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }
}

mod ffi {
    use std::ffi::CString;
    use std::fs::File;
    use std::io;
    use std::os::unix::io::FromRawFd;

    /// Opens (creating if necessary) a POSIX shared memory object and ensures it is at least
    /// `len` bytes, returning it as a [`File`] so the caller can `mmap` it with ordinary Rust
    /// tooling instead of juggling a raw fd.
    pub(super) fn shm_open_rw(name: &str, len: usize) -> io::Result<File> {
        let cname = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "shm name contains a NUL byte"))?;

        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        let file = unsafe { File::from_raw_fd(fd) };
        let current_len = file.metadata()?.len() as usize;
        if current_len < len {
            file.set_len(len as u64)?;
        }

        Ok(file)
    }
}
