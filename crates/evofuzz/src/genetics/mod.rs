//! The evolutionary engine: individuals (packets as genomes) and the
//! priority-ordered populations they live in.

mod individual;
mod population;

pub use individual::{CaseOutcome, CrossoverFn, Genes, Individual, single_point_crossover};
pub use population::Population;
