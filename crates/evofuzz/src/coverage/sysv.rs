use std::io;

use crate::error::{Error, Result};

/// System-V shared memory segment, the flavor AFL-instrumented binaries
/// attach to by default. The identifier exported to the target is the
/// decimal segment id returned by `shmget`.
#[derive(Debug)]
pub(super) struct SysvShm {
    id: i32,
    ptr: *mut u8,
    size: usize,
    name: String,
    owner: bool,
}

// The raw pointer aliases a kernel-backed segment; access is serialized by
// the channel's mutex.
unsafe impl Send for SysvShm {}
unsafe impl Sync for SysvShm {}

impl SysvShm {
    pub(super) fn create(size: usize) -> Result<Self> {
        let id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                size,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if id < 0 {
            return Err(shm_error("shmget"));
        }
        Self::attach_id(id, size, true)
    }

    pub(super) fn attach(identifier: &str, size: usize) -> Result<Self> {
        let id: i32 = identifier.parse().map_err(|_| {
            Error::SharedMemory(format!("invalid System-V segment id `{identifier}`"))
        })?;
        Self::attach_id(id, size, false)
    }

    fn attach_id(id: i32, size: usize, owner: bool) -> Result<Self> {
        let ptr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if ptr as isize == -1 {
            if owner {
                unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
            }
            return Err(shm_error("shmat"));
        }
        Ok(Self {
            id,
            ptr: ptr.cast(),
            size,
            name: id.to_string(),
            owner,
        })
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn size(&self) -> usize {
        self.size
    }

    pub(super) fn ptr(&self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for SysvShm {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.ptr.cast());
            if self.owner {
                libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut());
            }
        }
    }
}

fn shm_error(op: &str) -> Error {
    Error::SharedMemory(format!("{op}: {}", io::Error::last_os_error()))
}
