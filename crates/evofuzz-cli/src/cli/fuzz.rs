use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use evofuzz::coverage::{CoverageChannel, DEFAULT_MAP_SIZE, SHM_ENV_VAR, ShmFlavor};
use evofuzz::net::Transport;
use evofuzz::protocols;
use evofuzz::rng::FuzzRng;
use evofuzz::session::{Session, SessionOptions, SharedStats};
use evofuzz::target;
use tracing::info;

use super::GlobalOptions;

const TICKER_INTERVAL: Duration = Duration::from_secs(2);

/// Run an evolutionary fuzzing session against a network target.
#[derive(Debug, clap::Parser)]
pub(super) struct FuzzCommand {
    /// Destination host of the target under test.
    host: String,

    /// Destination port.
    port: u16,

    /// Transport used to deliver payloads (tcp, udp, tcp+tls).
    #[clap(long, short = 'p', default_value = "tcp", value_parser = parse_transport)]
    transport: Transport,

    /// send() timeout in seconds.
    #[clap(long, default_value_t = 5.0)]
    send_timeout: f64,

    /// recv() timeout in seconds.
    #[clap(long, default_value_t = 1.0)]
    recv_timeout: f64,

    /// Protocol module that decodes and shapes the seed packets.
    #[clap(long = "fuzzer", short = 'f')]
    fuzzer: String,

    /// Seed packet capture to build the populations from.
    #[clap(long)]
    pcap: PathBuf,

    /// PRNG seed for reproducible runs.
    #[clap(long, default_value_t = 0)]
    seed: u64,

    /// Energy cooldown factor applied every iteration.
    #[clap(long, default_value_t = 0.995)]
    alpha: f64,

    /// Energy reheat divisor applied on coverage gains.
    #[clap(long, default_value_t = 0.950)]
    beta: f64,

    /// Probability of a spot mutation after crossover.
    #[clap(long, default_value_t = 0.8)]
    p_mutation: f64,

    /// Maximum number of individuals per population.
    #[clap(long, default_value_t = 10_000)]
    population_limit: usize,

    /// Wall-clock budget in seconds; 0 fuzzes until interrupted.
    #[clap(long, default_value_t = 0.0)]
    time_budget: f64,

    /// Result directory (default: evofuzz-results/<unix timestamp>).
    #[clap(long, short = 'o')]
    output: Option<PathBuf>,

    /// Reuse an existing shared-memory identifier instead of creating one.
    #[clap(long)]
    shm_id: Option<String>,

    /// Use POSIX shared memory (targets built with mmap-backed
    /// instrumentation) instead of System-V.
    #[clap(long)]
    shm_posix: bool,

    /// Dump the final coverage map to shm.bin on exit.
    #[clap(long)]
    dump_shm: bool,

    /// Write a debug.csv row for every iteration.
    #[clap(long)]
    debug: bool,

    /// Disable the periodic status line.
    #[clap(long)]
    batch: bool,

    /// Restarter module, optionally followed by the target command line:
    /// `--restart afl_fork './server 2404'`.
    #[clap(long, num_args = 1..=2, value_names = ["MODULE", "COMMAND"])]
    restart: Vec<String>,

    /// Seconds to sleep after a crash before the target is restarted.
    #[clap(long, default_value_t = 5.0)]
    restart_sleep: f64,
}

impl FuzzCommand {
    pub(super) fn run(self, _global_options: GlobalOptions) -> anyhow::Result<()> {
        if !self.pcap.is_file() {
            bail!("seed capture {} does not exist", self.pcap.display());
        }

        let fuzzer = protocols::lookup(&self.fuzzer).context("Resolving protocol module")?;
        let mut rng = FuzzRng::from_seed(self.seed);
        let populations =
            protocols::build_populations(fuzzer.as_ref(), &self.pcap, self.p_mutation, &mut rng)
                .context("Building populations from the capture")?;

        let flavor = if self.shm_posix {
            ShmFlavor::Posix
        } else {
            ShmFlavor::SysV
        };
        let channel = CoverageChannel::open(flavor, self.shm_id.as_deref(), DEFAULT_MAP_SIZE)
            .context("Allocating the coverage map")?;
        info!(identifier = channel.name(), size = channel.size(), "coverage channel ready");

        let (module, command) = match self.restart.as_slice() {
            [] => ("external", String::new()),
            [module] => (module.as_str(), String::new()),
            [module, command, ..] => (module.as_str(), command.clone()),
        };
        let restarter = target::create(module, &command, SHM_ENV_VAR, channel.name())
            .context("Creating restarter module")?;

        let paused = Arc::new(AtomicBool::new(false));
        {
            let paused = Arc::clone(&paused);
            ctrlc::set_handler(move || {
                paused.store(true, Ordering::Relaxed);
            })
            .context("Installing SIGINT handler")?;
        }

        let opts = SessionOptions {
            fuzzer: self.fuzzer.clone(),
            host: self.host.clone(),
            port: self.port,
            transport: self.transport,
            send_timeout: Duration::from_secs_f64(self.send_timeout),
            recv_timeout: Duration::from_secs_f64(self.recv_timeout),
            pcap: self.pcap.clone(),
            seed: self.seed,
            alpha: self.alpha,
            beta: self.beta,
            p_mutation: self.p_mutation,
            population_limit: self.population_limit,
            time_budget: Duration::from_secs_f64(self.time_budget),
            restart_sleep: Duration::from_secs_f64(self.restart_sleep),
            debug_rows: self.debug,
            dump_shm: self.dump_shm,
            output_dir: self.output.clone(),
            ..SessionOptions::default()
        };
        let mut session = Session::new(opts, populations, rng, channel, restarter, paused)
            .context("Assembling session")?;

        let finished = Arc::new(AtomicBool::new(false));
        let ticker = (!self.batch).then(|| spawn_ticker(session.stats(), Arc::clone(&finished)));

        let result = session.run_all();

        finished.store(true, Ordering::Relaxed);
        if let Some(handle) = ticker {
            let _ = handle.join();
        }
        result.context("Running session")?;

        info!(
            results = %session.result_dir().display(),
            suspects = session.suspect_count(),
            "fuzzing finished"
        );
        Ok(())
    }
}

fn parse_transport(s: &str) -> Result<Transport, String> {
    s.parse()
}

/// Status line printer; only ever reads the shared counters.
fn spawn_ticker(stats: Arc<SharedStats>, finished: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut last_tick = Instant::now();
        while !finished.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(100));
            if last_tick.elapsed() < TICKER_INTERVAL {
                continue;
            }
            last_tick = Instant::now();
            info!(
                iterations = stats.iterations(),
                test_cases = stats.test_cases(),
                coverage = stats.coverage(),
                suspects = stats.suspects(),
                restarts = stats.restarts(),
                energy = stats.energy(),
                period = stats.energy_periods(),
                population = %stats.species(),
                "status"
            );
        }
    })
}
