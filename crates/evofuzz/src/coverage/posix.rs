use std::fs::File;

use memmap2::MmapRaw;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::error::{Error, Result};

/// POSIX shared memory object (`shm_open` + `mmap`), for targets whose
/// instrumentation was built with mmap-backed maps. The identifier exported
/// to the target is the object name, leading slash included.
#[derive(Debug)]
pub(super) struct PosixShm {
    name: String,
    map: MmapRaw,
    size: usize,
    owner: bool,
    // Keeps the object's descriptor alive for the mapping's lifetime.
    _file: File,
}

impl PosixShm {
    pub(super) fn create(identifier: Option<&str>, size: usize) -> Result<Self> {
        let name = match identifier {
            Some(given) if given.starts_with('/') => given.to_owned(),
            Some(given) => format!("/{given}"),
            None => format!("/evofuzz_{:08x}", rand::random::<u32>()),
        };
        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o600),
        )
        .map_err(|e| Error::SharedMemory(format!("shm_open {name}: {e}")))?;
        ftruncate(&fd, size as libc::off_t)
            .map_err(|e| Error::SharedMemory(format!("ftruncate {name}: {e}")))?;
        let file = File::from(fd);
        let map = MmapRaw::map_raw(&file)
            .map_err(|e| Error::SharedMemory(format!("mmap {name}: {e}")))?;
        Ok(Self {
            name,
            map,
            size,
            owner: true,
            _file: file,
        })
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn size(&self) -> usize {
        self.size
    }

    pub(super) fn ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }
}

impl Drop for PosixShm {
    fn drop(&mut self) {
        if self.owner {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}
