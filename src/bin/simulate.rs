use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use forward_freqs::*;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(about = "Wright-Fisher simulation with ancestral sampling in the second half of the run")]
struct Args {
    /// Diploid population size N
    #[arg(short = 'N', long)]
    popsize: usize,
    /// Expected selected mutations per gamete
    #[arg(short, long)]
    mu: f64,
    /// Expected crossovers per gamete
    #[arg(short, long)]
    recrate: f64,
    #[arg(long)]
    seed: u64,
    #[arg(short, long)]
    outfile: String,
    /// Mean 2Ns of the gamma DFE
    #[arg(short = 'M', long, default_value_t = -1.0, allow_negative_numbers = true)]
    mean: f64,
    /// Shape of the gamma DFE
    #[arg(short = 'S', long, default_value_t = 1.0)]
    shape: f64,
    /// Proportion of beneficial mutations
    #[arg(short = 'P', long, default_value_t = 0.0)]
    proportion: f64,
    #[arg(long, default_value_t = DEFAULT_SIMPLIFY_INTERVAL)]
    simplify_interval: usize,
    /// Individuals preserved per sampling generation (default: N)
    #[arg(long)]
    ancient_samples: Option<usize>,
}

// ── Main ─────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();

    let dfe = Dfe {
        mean: args.mean,
        shape: args.shape,
        proportion: args.proportion,
    };
    let mut params = Parameters::new(args.popsize, args.mu, args.recrate, args.seed, dfe);
    params.simplify_interval = args.simplify_interval;
    if let Some(n) = args.ancient_samples {
        params.ancient_sample_size = n;
    }
    eprintln!("{:?}", params);

    eprintln!("{} Starting the simulation", Utc::now());
    let mut sim = WrightFisher::initialize(params)?;
    sim.run()?;
    let mut pop = sim.finalize()?;
    eprintln!("{} End simulation", Utc::now());

    eprintln!("num_nodes: {}", pop.tables.nodes().num_rows());
    eprintln!("num_mutations: {}", pop.num_mutations());
    eprintln!("num_fixations: {}", pop.state.fixations.len());
    eprintln!("num_timepoints: {}", pop.sample_timepoints().len());

    eprintln!("{} Dumping to {}", Utc::now(), args.outfile);
    pop.dump(&args.outfile)?;
    eprintln!("{} End dump", Utc::now());
    Ok(())
}
