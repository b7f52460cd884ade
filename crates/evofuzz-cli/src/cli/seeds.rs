use std::path::PathBuf;

use anyhow::Context;
use evofuzz::protocols;
use evofuzz::rng::FuzzRng;
use itertools::Itertools;

use super::GlobalOptions;

/// Inspect the populations a seed capture would produce, without fuzzing.
#[derive(Debug, clap::Parser)]
pub(super) struct SeedsCommand {
    /// Protocol module to decode the capture with.
    #[clap(long = "fuzzer", short = 'f')]
    fuzzer: String,

    /// Seed packet capture.
    #[clap(long)]
    pcap: PathBuf,

    /// PRNG seed (affects the initial shuffle and singleton growth).
    #[clap(long, default_value_t = 0)]
    seed: u64,

    /// Also hex-dump every seed individual.
    #[clap(long, short = 'v')]
    verbose: bool,
}

impl SeedsCommand {
    pub(super) fn run(self, _global_options: GlobalOptions) -> anyhow::Result<()> {
        let fuzzer = protocols::lookup(&self.fuzzer).context("Resolving protocol module")?;
        let mut rng = FuzzRng::from_seed(self.seed);
        let populations =
            protocols::build_populations(fuzzer.as_ref(), &self.pcap, 0.8, &mut rng)
                .context("Building populations from the capture")?;

        for (species, population) in &populations {
            let chromosomes = population
                .member(0)
                .packet()
                .schema()
                .sorted_names()
                .join(", ");
            println!(
                "{species}: {} members ({} from the capture), pre/post payloads: {}/{}",
                population.len(),
                population.seed_individuals().len(),
                population.graph().pre_phase().map_or(0, |p| p.len()),
                population.graph().post_phase().map_or(0, |p| p.len()),
            );
            println!("  chromosomes: {chromosomes}");
            if self.verbose {
                for individual in population.seed_individuals() {
                    println!("  {}:", individual.identity());
                    for line in evofuzz::hexdump(&individual.serialize()).lines() {
                        println!("    {line}");
                    }
                }
            }
        }
        Ok(())
    }
}
