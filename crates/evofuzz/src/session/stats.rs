//! Read-only session counters for the status ticker thread.
//!
//! The fuzzing thread publishes after every iteration; any other thread may
//! read at any time without touching session internals.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SharedStats {
    iterations: AtomicU64,
    test_cases: AtomicU64,
    coverage: AtomicU64,
    crashes: AtomicU64,
    restarts: AtomicU64,
    suspects: AtomicU64,
    energy_micro: AtomicU64,
    energy_periods: AtomicU64,
    species: Mutex<String>,
}

impl SharedStats {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn publish(
        &self,
        iterations: u64,
        test_cases: u64,
        coverage: u64,
        crashes: u64,
        restarts: u64,
        suspects: u64,
        energy: f64,
        energy_periods: u64,
        species: &str,
    ) {
        self.iterations.store(iterations, Ordering::Relaxed);
        self.test_cases.store(test_cases, Ordering::Relaxed);
        self.coverage.store(coverage, Ordering::Relaxed);
        self.crashes.store(crashes, Ordering::Relaxed);
        self.restarts.store(restarts, Ordering::Relaxed);
        self.suspects.store(suspects, Ordering::Relaxed);
        self.energy_micro
            .store((energy * 1_000_000.0) as u64, Ordering::Relaxed);
        self.energy_periods.store(energy_periods, Ordering::Relaxed);
        if let Ok(mut guard) = self.species.lock() {
            if *guard != species {
                guard.clear();
                guard.push_str(species);
            }
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub fn test_cases(&self) -> u64 {
        self.test_cases.load(Ordering::Relaxed)
    }

    pub fn coverage(&self) -> u64 {
        self.coverage.load(Ordering::Relaxed)
    }

    pub fn crashes(&self) -> u64 {
        self.crashes.load(Ordering::Relaxed)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn suspects(&self) -> u64 {
        self.suspects.load(Ordering::Relaxed)
    }

    pub fn energy(&self) -> f64 {
        self.energy_micro.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn energy_periods(&self) -> u64 {
        self.energy_periods.load(Ordering::Relaxed)
    }

    pub fn species(&self) -> String {
        self.species
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}
