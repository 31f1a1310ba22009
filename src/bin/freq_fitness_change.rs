use anyhow::Result;
use clap::Parser;
use forward_freqs::neutral::infinite_sites;
use forward_freqs::output::{write_allele_frequencies, write_population_fitness};
use forward_freqs::*;
use rand::SeedableRng;
use rand::rngs::SmallRng;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(about = "Allele-frequency trajectories with carrier fitness, plus population fitness")]
struct Args {
    /// Population written by `simulate`
    infile: String,
    /// SQLite database for the allele-frequency table
    outfile: String,
    /// SQLite database for the population-fitness table
    fitness_outfile: String,
    /// Neutral mutation rate per unit genome length per generation
    neutral_mu: f64,
    seed: u64,
}

// ── Main ─────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();

    let mut pop = Population::load(&args.infile)?;
    let mut rng = SmallRng::seed_from_u64(args.seed);

    eprintln!("mutations before: {}", pop.num_mutations());
    let added = infinite_sites(&mut rng, &mut pop, args.neutral_mu)?;
    eprintln!("mutations after: {}", pop.num_mutations());
    eprintln!("{added} neutral variants added");

    let options = ExtractionOptions {
        carrier_fitness: true,
    };
    let tables = count_frequencies(&pop, added, options)?;
    eprintln!(
        "{} allele-frequency rows, {} fitness rows",
        tables.alleles.len(),
        tables.fitness.len()
    );
    write_allele_frequencies(&args.outfile, &tables.alleles)?;
    write_population_fitness(&args.fitness_outfile, &tables.fitness)?;
    Ok(())
}
