//! Seeded randomness for the engine.
//!
//! Two independent streams derive from the single `--seed` integer: the
//! *field* stream drives everything genetic (parent sampling, crossover
//! points, spot mutations, random field values) and the *scheduling* stream
//! drives everything else (identities, annealing acceptance, seed growth).
//! Keeping the streams apart means a protocol module that draws more or
//! fewer field values does not shift the scheduler's decisions.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

/// Offset applied to the field stream so both streams never collapse into
/// the same sequence for any seed.
const FIELD_STREAM_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

static TRACE: AtomicBool = AtomicBool::new(false);

/// Enable or disable RNG draw tracing on stderr (`--dtrace`).
pub fn set_trace(enabled: bool) {
    TRACE.store(enabled, Ordering::Relaxed);
}

/// Write one trace line per RNG draw site when tracing is enabled.
///
/// The line format is stable so two runs can be diffed draw-by-draw.
pub(crate) fn rng_trace(site: &str, step: u32, value: impl Display) {
    if TRACE.load(Ordering::Relaxed) {
        eprintln!("rng_trace, {site}, {step}, {value}");
    }
}

#[derive(Debug)]
pub struct FuzzRng {
    field: SmallRng,
    sched: SmallRng,
}

impl FuzzRng {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            field: SmallRng::seed_from_u64(seed ^ FIELD_STREAM_SALT),
            sched: SmallRng::seed_from_u64(seed),
        }
    }

    /// Uniform index in `[0, n)` from the field stream.
    pub fn gene_index(&mut self, n: usize) -> usize {
        debug_assert!(n > 0);
        self.field.gen_range(0..n)
    }

    /// Uniform float in `[0, 1)` from the field stream.
    pub fn gene_unit(&mut self) -> f64 {
        self.field.r#gen::<f64>()
    }

    pub fn gene_byte(&mut self) -> u8 {
        self.field.r#gen()
    }

    pub fn gene_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.field.fill(buf.as_mut_slice());
        buf
    }

    pub fn gene_u64(&mut self) -> u64 {
        self.field.r#gen()
    }

    /// Truncated-exponential index in `[0, n)`: resample `x = Exp(1) * n`
    /// until it lands below `n`, then floor. Low indices are favoured.
    pub fn truncated_exp_index(&mut self, n: usize) -> usize {
        debug_assert!(n > 0);
        loop {
            let unit: f64 = self.field.r#gen();
            let x = -(1.0 - unit).ln() * n as f64;
            rng_trace("truncated_exp_choice", 1, x);
            if x < n as f64 {
                return x as usize;
            }
        }
    }

    /// Fisher–Yates shuffle backed by the field stream.
    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        slice.shuffle(&mut self.field);
    }

    /// Uniform float in `[0, 1)` from the scheduling stream.
    pub fn sched_unit(&mut self) -> f64 {
        self.sched.r#gen::<f64>()
    }

    /// Uniform integer in `[lo, hi)` from the scheduling stream.
    pub fn sched_range(&mut self, lo: usize, hi: usize) -> usize {
        debug_assert!(lo < hi);
        self.sched.gen_range(lo..hi)
    }

    /// Fresh 128-bit identity from the scheduling stream.
    pub fn identity(&mut self) -> Uuid {
        let id = Uuid::from_u128(self.sched.r#gen());
        rng_trace("identity", 1, id);
        id
    }
}
