mod fuzz;
mod seeds;

use anyhow::Context;
use fuzz::FuzzCommand;
use seeds::SeedsCommand;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, clap::Parser)]
#[command(version, about, styles = clap::builder::Styles::styled())]
pub struct Cli {
    #[clap(flatten)]
    global_options: GlobalOptions,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    pub(super) fn run(self) -> anyhow::Result<()> {
        setup_logger(&self.global_options).context("Initializing logging")?;
        evofuzz::rng::set_trace(self.global_options.dtrace);
        match self.command {
            Command::Fuzz(cmd) => cmd.run(self.global_options),
            Command::Seeds(cmd) => cmd.run(self.global_options),
        }
    }
}

#[derive(Debug, clap::Parser)]
pub(super) struct GlobalOptions {
    #[clap(long, default_value = "info")]
    default_log_level: LevelFilter,

    /// Trace every RNG draw to stderr, for diffing two runs.
    #[clap(long, global = true)]
    dtrace: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run an evolutionary fuzzing session against a network target.
    Fuzz(Box<FuzzCommand>),
    /// Inspect the populations a seed capture would produce.
    Seeds(SeedsCommand),
}

fn setup_logger(global_opts: &GlobalOptions) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(global_opts.default_log_level.into())
        .from_env()
        .context("Parsing the log filter from the environment")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(fmt::time::ChronoLocal::new("%H:%M:%S%.3f".to_owned()))
        .with_target(false)
        .init();
    Ok(())
}
