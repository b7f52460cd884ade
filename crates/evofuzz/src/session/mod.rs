//! The fuzzing session: populations, energy, scheduling, and the main loop.
//!
//! One session owns everything a run needs — populations, the coverage
//! channel, the target restarter, the RNG streams, the result recorder —
//! and drives the drain and fuzz phases. Every failure inside the loop is
//! classified into a retry or a `bugs.csv` row; nothing escapes the loop
//! except I/O trouble with the result directory itself.

mod stats;

pub use stats::SharedStats;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::coverage::CoverageChannel;
use crate::error::{Error, Result};
use crate::genetics::{CaseOutcome, Individual, Population};
use crate::net::{TargetConnection, Transport};
use crate::recorder::{CaseRow, Recorder, RunMetadata};
use crate::rng::FuzzRng;
use crate::target::Restarter;
use crate::testcase::TestCase;

/// Below this energy the scheduler rotates to the next population.
const ENERGY_THRESHOLD: f64 = 0.05;

/// Re-runs of one case against a healthy target before it is abandoned.
const MAX_CASE_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub fuzzer: String,
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub send_timeout: Duration,
    pub recv_timeout: Duration,
    pub pcap: PathBuf,
    pub seed: u64,
    /// Energy decay factor applied every iteration.
    pub alpha: f64,
    /// Energy boost divisor applied on a coverage gain.
    pub beta: f64,
    pub p_mutation: f64,
    pub population_limit: usize,
    /// Zero means unbounded.
    pub time_budget: Duration,
    /// Pause after a crash before the target is brought back.
    pub restart_sleep: Duration,
    /// Swallow post-phase transmission errors; a target that died on the
    /// fuzzed body routinely fails its tear-down payloads too.
    pub post_relax: bool,
    pub debug_rows: bool,
    pub dump_shm: bool,
    pub output_dir: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            fuzzer: String::new(),
            host: "127.0.0.1".to_owned(),
            port: 0,
            transport: Transport::Tcp,
            send_timeout: Duration::from_secs(5),
            recv_timeout: Duration::from_secs(5),
            pcap: PathBuf::new(),
            seed: 0,
            alpha: 0.995,
            beta: 0.950,
            p_mutation: 0.8,
            population_limit: 10_000,
            time_budget: Duration::ZERO,
            restart_sleep: Duration::from_secs(5),
            post_relax: true,
            debug_rows: false,
            dump_shm: false,
            output_dir: None,
        }
    }
}

/// Wall-clock budget accounting. Time only accumulates between `start` and
/// `stop`, so pauses at the prompt do not count against the budget.
#[derive(Debug)]
pub struct SessionClock {
    budget: Duration,
    spent: Duration,
    started: Option<Instant>,
}

impl SessionClock {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            spent: Duration::ZERO,
            started: None,
        }
    }

    pub fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.spent += started.elapsed();
        }
    }

    pub fn execution_time(&self) -> Duration {
        match self.started {
            Some(started) => self.spent + started.elapsed(),
            None => self.spent,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn exhausted(&self) -> bool {
        !self.budget.is_zero() && self.execution_time() >= self.budget
    }
}

#[derive(Debug)]
pub struct Session {
    opts: SessionOptions,
    populations: BTreeMap<String, Population>,
    /// Species names in sorted order; the rotation cycle.
    cycle: Vec<String>,
    cursor: usize,
    active_species: String,
    active_individual: Option<Individual>,
    active_case: Option<TestCase>,
    energy: f64,
    energy_periods: u64,
    reheats: u64,
    iteration: u64,
    case_count: u64,
    suspect_count: u64,
    clock: SessionClock,
    rng: FuzzRng,
    channel: CoverageChannel,
    restarter: Box<dyn Restarter>,
    recorder: Recorder,
    stats: Arc<SharedStats>,
    paused: Arc<AtomicBool>,
    prev_coverage: usize,
    pending_suspect: Option<(CaseRow, Vec<u8>)>,
}

impl Session {
    /// Assemble a session. The RNG must be the same pair of streams the
    /// populations were seeded with, or reproducibility is lost.
    pub fn new(
        opts: SessionOptions,
        populations: BTreeMap<String, Population>,
        rng: FuzzRng,
        channel: CoverageChannel,
        restarter: Box<dyn Restarter>,
        paused: Arc<AtomicBool>,
    ) -> Result<Self> {
        let cycle: Vec<String> = populations.keys().cloned().collect();
        let active_species = cycle
            .first()
            .cloned()
            .ok_or_else(|| Error::Capture("no populations to fuzz".to_owned()))?;

        let recorder = Recorder::create(opts.output_dir.clone(), opts.debug_rows)?;
        let metadata = RunMetadata {
            fuzzer: opts.fuzzer.clone(),
            restarter: restarter.name().to_owned(),
            target_command: restarter.command().to_owned(),
            host: opts.host.clone(),
            port: opts.port,
            transport: opts.transport.to_string(),
            send_timeout: opts.send_timeout.as_secs_f64(),
            recv_timeout: opts.recv_timeout.as_secs_f64(),
            pcap: opts.pcap.display().to_string(),
            seed: opts.seed,
            alpha: opts.alpha,
            beta: opts.beta,
            p_mutation: opts.p_mutation,
            population_limit: opts.population_limit,
            time_budget: opts.time_budget.as_secs_f64(),
            shm_identifier: channel.name().to_owned(),
            shm_size: channel.size(),
            populations: populations
                .iter()
                .map(|(species, population)| (species.clone(), population.len()))
                .collect(),
        };
        recorder.write_run_metadata(&metadata)?;
        for (species, population) in &populations {
            recorder.persist_transition_payloads(species, population.graph())?;
        }

        let clock = SessionClock::new(opts.time_budget);
        Ok(Self {
            opts,
            populations,
            cycle,
            cursor: 0,
            active_species,
            active_individual: None,
            active_case: None,
            energy: 1.0,
            energy_periods: 0,
            reheats: 0,
            iteration: 0,
            case_count: 0,
            suspect_count: 0,
            clock,
            rng,
            channel,
            restarter,
            recorder,
            stats: Arc::new(SharedStats::default()),
            paused,
            prev_coverage: 0,
            pending_suspect: None,
        })
    }

    pub fn stats(&self) -> Arc<SharedStats> {
        Arc::clone(&self.stats)
    }

    pub fn result_dir(&self) -> PathBuf {
        self.recorder.dir().to_path_buf()
    }

    pub fn energy(&self) -> f64 {
        self.energy
    }

    pub fn energy_periods(&self) -> u64 {
        self.energy_periods
    }

    pub fn reheat_count(&self) -> u64 {
        self.reheats
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn suspect_count(&self) -> u64 {
        self.suspect_count
    }

    pub fn population(&self, species: &str) -> Option<&Population> {
        self.populations.get(species)
    }

    fn cooldown(&mut self) -> f64 {
        self.energy *= self.opts.alpha;
        self.energy
    }

    fn reheat(&mut self) -> f64 {
        self.reheats += 1;
        self.energy = (self.energy / self.opts.beta).min(1.0);
        self.energy
    }

    /// Run drain and fuzz phases until the budget or a pause stops them.
    pub fn run_all(&mut self) -> Result<()> {
        info!(dir = %self.recorder.dir().display(), "session starting");
        self.clock.start();
        self.channel.reset();
        if !self.restarter.restart(true) {
            warn!("initial target start failed; expecting connection failures");
        }
        self.drain()?;
        while self.cont() {
            self.iteration += 1;
            self.schedule_population();
            self.generate_individual();
            let mut retry = false;
            let mut attempts = 0;
            loop {
                let outcome = self.evaluate_individual(retry);
                retry = self.process_outcome(outcome, true);
                attempts += 1;
                if !retry || self.paused.load(Ordering::Relaxed) || self.clock.exhausted() {
                    break;
                }
                if attempts > MAX_CASE_RETRIES {
                    debug!(iteration = self.iteration, "case abandoned after retries");
                    break;
                }
            }
            self.update_bugs()?;
            self.record_debug_row()?;
            self.publish_stats();
        }
        self.teardown()
    }

    /// Execute every seed individual once, in sorted species order, to build
    /// the initial coverage history. Populations are not reordered here.
    fn drain(&mut self) -> Result<()> {
        info!("draining seed individuals");
        for species in self.cycle.clone() {
            let seeds: Vec<Individual> = self.populations[&species].seed_individuals().to_vec();
            for seed in seeds {
                if self.paused.load(Ordering::Relaxed) || self.clock.exhausted() {
                    return Ok(());
                }
                self.iteration += 1;
                self.active_species = species.clone();
                self.active_individual = Some(seed);
                let outcome = self.evaluate_individual(false);
                self.process_outcome(outcome, false);
                self.update_bugs()?;
                self.record_debug_row()?;
                self.publish_stats();
            }
        }
        self.active_species = self.cycle[0].clone();
        info!(coverage = self.prev_coverage, "drain phase finished");
        Ok(())
    }

    /// Budget/pause checkpoint at the head of every loop iteration.
    fn cont(&mut self) -> bool {
        self.clock.stop();
        if self.clock.exhausted() {
            warn!("time budget exhausted");
            self.paused.store(true, Ordering::Relaxed);
        }
        let go = !self.clock.exhausted() && !self.paused.load(Ordering::Relaxed);
        if go {
            self.clock.start();
        }
        go
    }

    fn schedule_population(&mut self) {
        if self.energy <= ENERGY_THRESHOLD {
            self.cursor += 1;
            if self.cursor >= self.cycle.len() {
                self.cursor = 0;
                self.energy_periods += 1;
                let species = self.cycle[0].clone();
                if let Some(population) = self.populations.get_mut(&species) {
                    population.reseed(self.opts.population_limit);
                }
                debug!(period = self.energy_periods, "population cycle wrapped");
            }
            self.active_species = self.cycle[self.cursor].clone();
            self.energy = 1.0;
        }
        self.cooldown();
    }

    fn generate_individual(&mut self) {
        if let Some(population) = self.populations.get_mut(&self.active_species) {
            self.active_individual = Some(population.new_child(&mut self.rng));
        }
    }

    /// Run one test case. Without `retry` a fresh case wraps the active
    /// individual; with it, the existing case is re-run.
    fn evaluate_individual(&mut self, retry: bool) -> Result<()> {
        if !retry {
            let Some(individual) = self.active_individual.take() else {
                return Err(Error::TestCaseAborted("no active individual".to_owned()));
            };
            self.case_count += 1;
            self.active_case = Some(TestCase::new(self.case_count, individual));
        }
        if self.paused.load(Ordering::Relaxed) {
            return Err(Error::Paused);
        }

        if self.restarter.healthy() {
            self.restarter.resume();
        } else {
            self.channel.reset();
            self.restarter.restart(true);
        }

        let (pre, post, recv_after_send) = {
            let Some(case) = self.active_case.as_ref() else {
                return Err(Error::TestCaseAborted("no active test case".to_owned()));
            };
            let Some(population) = self.populations.get(case.individual.species()) else {
                return Err(Error::TestCaseAborted(format!(
                    "no population for species `{}`",
                    case.individual.species()
                )));
            };
            (
                population.graph().pre_phase()?.to_vec(),
                population.graph().post_phase()?.to_vec(),
                population.recv_after_send,
            )
        };

        let mut conn = TargetConnection::new(
            &self.opts.host,
            self.opts.port,
            self.opts.transport,
            self.opts.send_timeout,
            self.opts.recv_timeout,
        );
        let Some(case) = self.active_case.as_mut() else {
            return Err(Error::TestCaseAborted("no active test case".to_owned()));
        };
        case.run(&mut conn, &pre, &post, recv_after_send, self.opts.post_relax)
    }

    /// Classify a test case outcome. Returns whether the case should be
    /// re-run. With `evolve` set, successful outcomes feed back into the
    /// active population (the fuzz phase); the drain phase passes `false`.
    fn process_outcome(&mut self, outcome: Result<()>, evolve: bool) -> bool {
        let healthy = self.restarter.healthy();
        let benign = outcome
            .as_ref()
            .err()
            .is_some_and(Error::is_benign_interruption);

        // Suspicion needs an unhealthy target. Transmission errors against a
        // live target are logged and retried; only paused/connection-failed
        // never incriminate anyone.
        if !healthy && !benign {
            self.file_suspect(outcome);
            return false;
        }

        if let Err(err) = outcome {
            if let Some(case) = self.active_case.as_mut() {
                case.add_error(&err);
                case.cause = Some(err.kind_label());
            }
            debug!(%err, "iteration interrupted");
            // A pause is not retried; the loop head sees the flag.
            return !matches!(err, Error::Paused);
        }

        // Executed against a healthy target: rate the coverage delta.
        let (snapshot, change) = {
            let Some(case) = self.active_case.as_mut() else {
                return false;
            };
            let snapshot = case.coverage_snapshot(&self.channel);
            let change = snapshot != self.prev_coverage;
            case.coverage_increase = change;
            case.individual.latest_case = Some(CaseOutcome {
                case_id: case.id,
                coverage_increase: change,
            });
            (snapshot, change)
        };
        self.prev_coverage = snapshot;

        if evolve {
            if change {
                self.reheat();
                debug!(coverage = snapshot, energy = self.energy, "new edges found");
            }
            let add = change || self.rng.sched_unit() <= self.energy;
            let heat = self.energy;
            let child = match self.active_case.as_ref() {
                Some(case) => case.individual.clone(),
                None => return false,
            };
            let species = child.species().to_owned();
            if let Some(population) = self.populations.get_mut(&species) {
                population.update(child, heat, add);
                population.shrink(self.opts.population_limit);
            }
        }
        false
    }

    /// The target is implicated: kill it, attribute the exit code to the
    /// current case, queue the suspect row, and bring a fresh instance up.
    fn file_suspect(&mut self, outcome: Result<()>) {
        let exit_code = self.restarter.kill(false);
        if let Some(case) = self.active_case.as_mut() {
            case.needed_restart = true;
            case.exit_code = Some(exit_code);
            match &outcome {
                Err(err) => {
                    case.add_error(err);
                    case.cause = Some(err.kind_label());
                }
                Ok(()) => case.cause = Some("target_crashed"),
            }
            let _ = case.coverage_snapshot(&self.channel);
        }
        if let Some((row, payload)) = self.build_case_row() {
            warn!(
                test = row.test_id,
                exit_code, cause = %row.cause_of_restart, "suspect filed"
            );
            self.pending_suspect = Some((row, payload));
        }
        if let Some(case) = self.active_case.as_ref() {
            self.prev_coverage = case.reported_coverage();
        }

        std::thread::sleep(self.opts.restart_sleep);
        self.channel.reset();
        if !self.restarter.restart(false) {
            warn!("target could not be restarted after the crash");
        }
    }

    fn build_case_row(&self) -> Option<(CaseRow, Vec<u8>)> {
        let case = self.active_case.as_ref()?;
        let species = case.individual.species().to_owned();
        let population_size = self
            .populations
            .get(&species)
            .map_or(0, Population::len);
        let row = CaseRow {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            iteration: self.iteration,
            test_id: case.id,
            individual: case.individual.identity(),
            increased_coverage: case.coverage_increase,
            caused_restart: case.needed_restart,
            cause_of_restart: case.cause.unwrap_or("").to_owned(),
            exit_code: case.exit_code.unwrap_or(0),
            reported_coverage: case.reported_coverage(),
            population: species,
            population_size,
            energy: self.energy,
            energy_period: self.energy_periods,
        };
        Some((row, case.individual.serialize()))
    }

    /// Flush the queued suspect, if any, into `bugs.csv` and the payload
    /// store.
    fn update_bugs(&mut self) -> Result<()> {
        if let Some((row, payload)) = self.pending_suspect.take() {
            self.suspect_count += 1;
            let bug_id = self.recorder.record_bug(&row, &payload)?;
            info!(bug_id, individual = %row.individual, "bug row recorded");
        }
        Ok(())
    }

    fn record_debug_row(&mut self) -> Result<()> {
        if !self.opts.debug_rows {
            return Ok(());
        }
        if let Some((row, _)) = self.build_case_row() {
            self.recorder.record_debug(&row)?;
        }
        Ok(())
    }

    fn publish_stats(&self) {
        self.stats.publish(
            self.iteration,
            self.case_count,
            self.channel.history_popcount() as u64,
            self.restarter.crashes(),
            self.restarter.restarts(),
            self.suspect_count,
            self.energy,
            self.energy_periods,
            &self.active_species,
        );
    }

    fn teardown(&mut self) -> Result<()> {
        self.clock.stop();
        self.restarter.kill(true);
        if self.opts.dump_shm {
            self.recorder.dump_shm(&self.channel.snapshot())?;
        }
        self.recorder.flush()?;
        self.publish_stats();
        info!(
            iterations = self.iteration,
            test_cases = self.case_count,
            suspects = self.suspect_count,
            coverage = self.channel.history_popcount(),
            reheats = self.reheats,
            execution_time = ?self.clock.execution_time(),
            "session finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::{Session, SessionClock, SessionOptions};
    use crate::coverage::{CoverageChannel, ShmFlavor};
    use crate::genetics::{Individual, Population, single_point_crossover};
    use crate::packet::capture::{SeedRecord, SeedTransport};
    use crate::protocols::{ProtocolFuzzer, raw::Raw};
    use crate::rng::FuzzRng;
    use crate::target::Restarter;

    /// Scripted stand-in for a managed target.
    #[derive(Debug)]
    struct ScriptedRestarter {
        healthy: bool,
        exit_code: i32,
        crashes: u64,
        restarts: u64,
        /// Health value after the next restart.
        revive: bool,
    }

    impl ScriptedRestarter {
        fn new(healthy: bool) -> Self {
            Self {
                healthy,
                exit_code: -6,
                crashes: 0,
                restarts: 0,
                revive: true,
            }
        }
    }

    impl Restarter for ScriptedRestarter {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn restart(&mut self, planned: bool) -> bool {
            if !planned {
                self.restarts += 1;
            }
            self.healthy = self.revive;
            self.healthy
        }

        fn kill(&mut self, ignore: bool) -> i32 {
            if !ignore {
                self.crashes += 1;
            }
            self.healthy = false;
            self.exit_code
        }

        fn healthy(&mut self) -> bool {
            self.healthy
        }

        fn assert_healthy(&mut self, _force_kill: bool) -> (bool, i32) {
            (false, 0)
        }

        fn restarts(&self) -> u64 {
            self.restarts
        }

        fn crashes(&self) -> u64 {
            self.crashes
        }

        fn command(&self) -> &str {
            "scripted-target"
        }
    }

    fn seed_record(payload: &[u8]) -> SeedRecord {
        SeedRecord {
            transport: SeedTransport::Tcp,
            dst_port: 7,
            payload: payload.to_vec(),
        }
    }

    fn raw_populations(rng: &mut FuzzRng) -> BTreeMap<String, Population> {
        let mut population = Population::new(single_point_crossover, 0.8);
        for payload in [b"alpha".as_slice(), b"bravo", b"charlie"] {
            let packet = Raw.decode(&seed_record(payload)).unwrap();
            population.add(Individual::new(packet, rng), true);
        }
        let mut populations = BTreeMap::from([("raw".to_owned(), population)]);
        Raw.wire_transitions(&mut populations).unwrap();
        populations
    }

    fn test_session(healthy_target: bool, dir: PathBuf) -> Session {
        let mut rng = FuzzRng::from_seed(0);
        let populations = raw_populations(&mut rng);
        let channel = CoverageChannel::open(ShmFlavor::SysV, None, 4096).unwrap();
        let opts = SessionOptions {
            fuzzer: "raw".to_owned(),
            port: 1,
            restart_sleep: Duration::ZERO,
            output_dir: Some(dir),
            ..SessionOptions::default()
        };
        Session::new(
            opts,
            populations,
            rng,
            channel,
            Box::new(ScriptedRestarter::new(healthy_target)),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn clock_accumulates_only_between_start_and_stop() {
        let mut clock = SessionClock::new(Duration::from_millis(40));
        assert!(!clock.exhausted());
        clock.start();
        std::thread::sleep(Duration::from_millis(50));
        clock.stop();
        assert!(clock.exhausted());
        assert!(clock.execution_time() >= Duration::from_millis(40));

        let mut unbounded = SessionClock::new(Duration::ZERO);
        unbounded.start();
        unbounded.stop();
        assert!(!unbounded.exhausted());
    }

    #[test]
    fn energy_clamps_under_reheat_and_cooldown() {
        let tmp = tempfile::tempdir().unwrap();
        let mut session = test_session(true, tmp.path().join("run"));
        for _ in 0..10_000 {
            session.cooldown();
            assert!(session.energy() > 0.0);
        }
        for _ in 0..10_000 {
            session.reheat();
            assert!(session.energy() <= 1.0);
        }
        assert!((session.energy() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn scheduler_rotates_and_reseeds_on_wrap() {
        let tmp = tempfile::tempdir().unwrap();
        let mut session = test_session(true, tmp.path().join("run"));
        let periods_before = session.energy_periods();
        // Force rotation: drop energy below the threshold. With one
        // population the cycle wraps immediately and reseeds.
        session.energy = 0.01;
        session.schedule_population();
        assert_eq!(session.energy_periods(), periods_before + 1);
        // Energy was reset to 1.0 and one cooldown applied.
        assert!((session.energy() - session.opts.alpha).abs() < 1e-9);
    }

    #[test]
    fn healthy_run_with_unreachable_port_retries_benignly() {
        let tmp = tempfile::tempdir().unwrap();
        let mut session = test_session(true, tmp.path().join("run"));
        session.iteration = 1;
        session.generate_individual();
        let outcome = session.evaluate_individual(false);
        // Port 1 refuses connections: benign, retry requested, no suspect.
        assert!(outcome.is_err());
        let retry = session.process_outcome(outcome, true);
        assert!(retry);
        assert!(session.pending_suspect.is_none());
    }

    #[test]
    fn unhealthy_target_files_a_suspect() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("run");
        let mut session = test_session(true, dir.clone());
        session.iteration = 1;
        session.generate_individual();
        // The connection is refused, but the case exists afterwards.
        let _ = session.evaluate_individual(false);
        // Script a crash: the target died and the failure was not benign.
        session.restarter.kill(true);
        let retry = session.process_outcome(Err(crate::Error::RecvTimeout), true);
        assert!(!retry, "suspects are not retried");
        assert!(session.pending_suspect.is_some());
        session.update_bugs().unwrap();
        assert_eq!(session.suspect_count(), 1);

        let bugs = std::fs::read_to_string(dir.join("bugs.csv")).unwrap();
        let lines: Vec<&str> = bugs.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("true"), "caused_restart must be set");
        assert!(lines[1].contains("-6"), "exit code must be attributed");
        // The payload file exists under the species directory.
        let payload_dir = dir.join("bug_payloads").join("raw");
        assert_eq!(std::fs::read_dir(payload_dir).unwrap().count(), 1);
    }

    #[test]
    fn run_json_lists_populations() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("run");
        let _session = test_session(true, dir.clone());
        let parsed: serde_json::Value =
            serde_json::from_reader(std::fs::File::open(dir.join("run.json")).unwrap()).unwrap();
        assert_eq!(parsed["fuzzer"], "raw");
        assert_eq!(parsed["populations"]["raw"], 3);
        assert_eq!(parsed["restarter"], "scripted");
    }

    #[test]
    fn child_generation_is_reproducible_across_sessions() {
        let serialize_children = |dir: PathBuf| {
            let mut session = test_session(true, dir);
            (0..32)
                .map(|_| {
                    session.generate_individual();
                    session.active_individual.take().unwrap().serialize()
                })
                .collect::<Vec<_>>()
        };
        let tmp = tempfile::tempdir().unwrap();
        let first = serialize_children(tmp.path().join("a"));
        let second = serialize_children(tmp.path().join("b"));
        assert_eq!(first, second);
    }

    #[test]
    fn paused_session_stops_at_loop_head() {
        let tmp = tempfile::tempdir().unwrap();
        let mut session = test_session(true, tmp.path().join("run"));
        session.paused.store(true, std::sync::atomic::Ordering::Relaxed);
        session.run_all().unwrap();
        // Only teardown ran; no iterations.
        assert_eq!(session.iteration(), 0);
        assert_eq!(session.suspect_count(), 0);
    }
}
