//! The coverage shared-memory channel.
//!
//! The instrumented target writes a non-zero byte into slot
//! `hash(prev_edge ⊕ cur_edge)` for every edge it executes. The fuzzer owns
//! the map, exports its identifier through [`SHM_ENV_VAR`], and folds
//! snapshots into a cumulative history bitmap: once a slot has been seen
//! non-zero, it stays set for the whole run, so "new coverage" is a cheap
//! popcount comparison even though individual runs overwrite map bytes.
//!
//! The target writes the map concurrently; snapshots are re-read until two
//! consecutive passes agree to defuse torn reads. There is no cross-process
//! memory barrier to rely on.

mod posix;
mod sysv;

use std::sync::{Mutex, PoisonError};

use crate::error::Result;

/// Map size exponent; the map holds `1 << MAP_SIZE_POW2` slots. Matches the
/// default of AFL-style instrumentation — the whole map fits the higher CPU
/// cache levels, and smaller maps raise the edge collision rate.
pub const MAP_SIZE_POW2: u32 = 16;
pub const DEFAULT_MAP_SIZE: usize = 1 << MAP_SIZE_POW2;

/// Environment variable the instrumentation reads the identifier from.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

const STABLE_READ_ATTEMPTS: usize = 8;

/// Which shared-memory API backs the map. The choice is process-global and
/// must match how the target's instrumentation was compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmFlavor {
    /// `shmget`/`shmat` — the AFL default.
    SysV,
    /// `shm_open`/`mmap` — instrumentation built with mmap support.
    Posix,
}

#[derive(Debug)]
enum Backing {
    SysV(sysv::SysvShm),
    Posix(posix::PosixShm),
}

impl Backing {
    fn name(&self) -> &str {
        match self {
            Backing::SysV(shm) => shm.name(),
            Backing::Posix(shm) => shm.name(),
        }
    }

    fn size(&self) -> usize {
        match self {
            Backing::SysV(shm) => shm.size(),
            Backing::Posix(shm) => shm.size(),
        }
    }

    fn ptr(&self) -> *mut u8 {
        match self {
            Backing::SysV(shm) => shm.ptr(),
            Backing::Posix(shm) => shm.ptr(),
        }
    }
}

#[derive(Debug)]
struct History {
    bits: Vec<u64>,
    count: usize,
    snap_a: Vec<u8>,
    snap_b: Vec<u8>,
}

/// Shared coverage map plus its sticky hit history.
#[derive(Debug)]
pub struct CoverageChannel {
    backing: Backing,
    state: Mutex<History>,
}

impl CoverageChannel {
    /// Acquire a map of `size` bytes. Without an identifier a fresh segment
    /// is created; with one, a System-V channel attaches to the existing
    /// segment while a POSIX channel creates (or reopens) the named object.
    pub fn open(flavor: ShmFlavor, identifier: Option<&str>, size: usize) -> Result<Self> {
        let backing = match (flavor, identifier) {
            (ShmFlavor::SysV, None) => Backing::SysV(sysv::SysvShm::create(size)?),
            (ShmFlavor::SysV, Some(id)) => Backing::SysV(sysv::SysvShm::attach(id, size)?),
            (ShmFlavor::Posix, id) => Backing::Posix(posix::PosixShm::create(id, size)?),
        };
        let state = Mutex::new(History {
            bits: vec![0u64; size.div_ceil(64)],
            count: 0,
            snap_a: vec![0u8; size],
            snap_b: vec![0u8; size],
        });
        let channel = Self {
            backing,
            state,
        };
        channel.reset();
        Ok(channel)
    }

    /// The identifier to export through [`SHM_ENV_VAR`].
    pub fn name(&self) -> &str {
        self.backing.name()
    }

    pub fn size(&self) -> usize {
        self.backing.size()
    }

    /// Zero the map. Called before a fresh target instance attaches so no
    /// stale hits from a previous incarnation are counted. The history is
    /// deliberately left untouched — it is sticky for the whole run.
    pub fn reset(&self) {
        let _guard = self.lock();
        let ptr = self.backing.ptr();
        let size = self.backing.size();
        unsafe {
            for i in 0..size / 8 {
                std::ptr::write_volatile(ptr.cast::<u64>().add(i), 0);
            }
            for i in (size / 8) * 8..size {
                std::ptr::write_volatile(ptr.add(i), 0);
            }
        }
    }

    /// Fold the current map into the history and return the total number of
    /// distinct slots ever seen non-zero.
    pub fn directed_branch_coverage(&self) -> usize {
        let mut state = self.lock();
        let History {
            bits,
            count,
            snap_a,
            snap_b,
        } = &mut *state;

        let ptr = self.backing.ptr();
        let size = self.backing.size();
        unsafe { copy_map(ptr, size, snap_a) };
        for _ in 0..STABLE_READ_ATTEMPTS {
            unsafe { copy_map(ptr, size, snap_b) };
            if snap_a == snap_b {
                break;
            }
            std::mem::swap(snap_a, snap_b);
        }

        for (i, byte) in snap_a.iter().enumerate() {
            if *byte != 0 {
                let word = &mut bits[i / 64];
                let mask = 1u64 << (i % 64);
                if *word & mask == 0 {
                    *word |= mask;
                    *count += 1;
                }
            }
        }
        *count
    }

    /// The history popcount without touching the map.
    pub fn history_popcount(&self) -> usize {
        self.lock().count
    }

    /// A stable copy of the raw map, for `shm.bin` dumps.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut state = self.lock();
        let History {
            snap_a,
            snap_b,
            ..
        } = &mut *state;
        let ptr = self.backing.ptr();
        let size = self.backing.size();
        unsafe { copy_map(ptr, size, snap_a) };
        for _ in 0..STABLE_READ_ATTEMPTS {
            unsafe { copy_map(ptr, size, snap_b) };
            if snap_a == snap_b {
                break;
            }
            std::mem::swap(snap_a, snap_b);
        }
        snap_a.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, History> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Word-wise volatile copy of the shared map into a local buffer.
unsafe fn copy_map(ptr: *const u8, size: usize, dst: &mut [u8]) {
    let words = size / 8;
    let word_ptr = ptr.cast::<u64>();
    for i in 0..words {
        let word = unsafe { std::ptr::read_volatile(word_ptr.add(i)) };
        dst[i * 8..(i + 1) * 8].copy_from_slice(&word.to_ne_bytes());
    }
    for i in words * 8..size {
        dst[i] = unsafe { std::ptr::read_volatile(ptr.add(i)) };
    }
}
