//! Result persistence.
//!
//! Everything a run leaves behind lives under one result directory:
//! `run.json` metadata, `bugs.csv` (one row per suspect), `debug.csv`
//! (per-iteration rows, opt-in), raw suspect payloads under
//! `bug_payloads/<species>/<uuid>`, the populations' handshake payloads
//! under `transition_payloads/<species>/`, and optionally a final `shm.bin`
//! dump of the coverage map.
//!
//! CSV rows are flushed as they are written so an interrupted run still
//! leaves complete rows behind.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::transition::TransitionGraph;
use crate::utils::sanitize_label;

const BUGS_HEADER: &str = "bug_id,timestamp,iteration,test_id,individual,increased_coverage,\
caused_restart,cause_of_restart,exit_code,reported_coverage,population,population_size,\
energy,energy_period";
const DEBUG_HEADER: &str = "timestamp,iteration,test_id,individual,increased_coverage,\
caused_restart,cause_of_restart,exit_code,reported_coverage,population,population_size,\
energy,energy_period";

/// Run configuration as persisted into `run.json`.
#[derive(Debug, Serialize)]
pub struct RunMetadata {
    pub fuzzer: String,
    pub restarter: String,
    pub target_command: String,
    pub host: String,
    pub port: u16,
    pub transport: String,
    pub send_timeout: f64,
    pub recv_timeout: f64,
    pub pcap: String,
    pub seed: u64,
    pub alpha: f64,
    pub beta: f64,
    pub p_mutation: f64,
    pub population_limit: usize,
    pub time_budget: f64,
    pub shm_identifier: String,
    pub shm_size: usize,
    /// Species → initial population size.
    pub populations: BTreeMap<String, usize>,
}

/// One row of `bugs.csv`/`debug.csv` (sans the bug id).
#[derive(Debug, Clone)]
pub struct CaseRow {
    pub timestamp: String,
    pub iteration: u64,
    pub test_id: u64,
    pub individual: Uuid,
    pub increased_coverage: bool,
    pub caused_restart: bool,
    pub cause_of_restart: String,
    pub exit_code: i32,
    pub reported_coverage: usize,
    pub population: String,
    pub population_size: usize,
    pub energy: f64,
    pub energy_period: u64,
}

impl CaseRow {
    fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{:.6},{}",
            self.timestamp,
            self.iteration,
            self.test_id,
            self.individual,
            self.increased_coverage,
            self.caused_restart,
            self.cause_of_restart,
            self.exit_code,
            self.reported_coverage,
            sanitize_label(&self.population),
            self.population_size,
            self.energy,
            self.energy_period,
        )
    }
}

#[derive(Debug)]
pub struct Recorder {
    dir: PathBuf,
    bugs: BufWriter<File>,
    debug: Option<BufWriter<File>>,
    bug_count: u64,
}

impl Recorder {
    /// Create the result directory tree. Without an explicit directory the
    /// run lands in `evofuzz-results/<unix_timestamp>/`.
    pub fn create(output: Option<PathBuf>, debug: bool) -> Result<Self> {
        let dir = match output {
            Some(dir) => dir,
            None => {
                let stamp = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                PathBuf::from("evofuzz-results").join(stamp.to_string())
            }
        };
        fs::create_dir_all(dir.join("bug_payloads"))?;
        fs::create_dir_all(dir.join("transition_payloads"))?;

        let mut bugs = BufWriter::new(File::create(dir.join("bugs.csv"))?);
        writeln!(bugs, "{BUGS_HEADER}")?;
        bugs.flush()?;

        let debug = if debug {
            let mut file = BufWriter::new(File::create(dir.join("debug.csv"))?);
            writeln!(file, "{DEBUG_HEADER}")?;
            file.flush()?;
            Some(file)
        } else {
            None
        };

        Ok(Self {
            dir,
            bugs,
            debug,
            bug_count: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn bug_count(&self) -> u64 {
        self.bug_count
    }

    pub fn write_run_metadata(&self, metadata: &RunMetadata) -> Result<()> {
        let file = File::create(self.dir.join("run.json"))?;
        serde_json::to_writer_pretty(file, metadata)
            .map_err(|e| crate::Error::Io(std::io::Error::other(e)))?;
        Ok(())
    }

    /// Append one suspect row and store its payload bytes. Returns the
    /// assigned bug id.
    pub fn record_bug(&mut self, row: &CaseRow, payload: &[u8]) -> Result<u64> {
        self.bug_count += 1;
        writeln!(self.bugs, "{},{}", self.bug_count, row.to_csv())?;
        self.bugs.flush()?;

        let species_dir = self
            .dir
            .join("bug_payloads")
            .join(sanitize_label(&row.population));
        fs::create_dir_all(&species_dir)?;
        fs::write(species_dir.join(row.individual.to_string()), payload)?;
        Ok(self.bug_count)
    }

    /// Append one per-iteration row when `--debug` is active.
    pub fn record_debug(&mut self, row: &CaseRow) -> Result<()> {
        if let Some(file) = self.debug.as_mut() {
            writeln!(file, "{}", row.to_csv())?;
            file.flush()?;
        }
        Ok(())
    }

    /// Persist a population's pre/post payload sequences.
    pub fn persist_transition_payloads(
        &self,
        species: &str,
        graph: &TransitionGraph,
    ) -> Result<()> {
        if !graph.finalized() {
            return Ok(());
        }
        let dir = self
            .dir
            .join("transition_payloads")
            .join(sanitize_label(species));
        fs::create_dir_all(&dir)?;
        for (i, payload) in graph.pre_phase()?.iter().enumerate() {
            let name = format!("pre_{i}_{}", sanitize_label(payload.name()));
            fs::write(dir.join(name), payload.bytes())?;
        }
        for (i, payload) in graph.post_phase()?.iter().enumerate() {
            let name = format!("post_{i}_{}", sanitize_label(payload.name()));
            fs::write(dir.join(name), payload.bytes())?;
        }
        Ok(())
    }

    /// Write the final coverage map dump (`--dump_shm`).
    pub fn dump_shm(&self, map: &[u8]) -> Result<()> {
        fs::write(self.dir.join("shm.bin"), map)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.bugs.flush()?;
        if let Some(file) = self.debug.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}
