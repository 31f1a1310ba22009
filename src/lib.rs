pub mod error;
pub mod frequencies;
pub mod neutral;
pub mod output;
pub mod population;

use anyhow::{Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand::distr::weighted::WeightedIndex;
use rand::distr::{Distribution, Uniform};
use rand::prelude::*;
use rand::rngs::SmallRng;
use rand_distr::{Gamma, Poisson};
use std::collections::{HashMap, HashSet};
use std::ops::Range;

pub use error::InvariantViolation;
pub use frequencies::{
    AlleleFreq, ExtractionOptions, FixationSet, FrequencyTables, ObservationWindow,
    PopulationFitness, count_frequencies,
};
pub use population::{
    FixationRecord, IndividualRecord, MutationRecord, Population, PopulationState,
    SampleTimepoint, SampledIndividual,
};

// ── Model constants ───────────────────────────────────────────────────────────

pub const GENOME_LENGTH: f64 = 1.0;
pub const FITNESS_SCALING: f64 = 2.0;
/// Scaled selection coefficient (2Ns) of beneficial mutations.
pub const TWONS: f64 = 1000.0;
/// Run length, in units of N generations.
pub const SIMLEN: usize = 20;
/// Ancestral sampling starts at BURNIN × N generations.
pub const BURNIN: usize = 10;
pub const DEFAULT_SIMPLIFY_INTERVAL: usize = 1000;

// ── Distribution of fitness effects ──────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct Dfe {
    /// Mean 2Ns of the gamma component. Negative means deleterious.
    pub mean: f64,
    /// Shape of the gamma component.
    pub shape: f64,
    /// Proportion of new mutations drawn from the beneficial component.
    pub proportion: f64,
}

impl Default for Dfe {
    fn default() -> Self {
        Self {
            mean: -1.0,
            shape: 1.0,
            proportion: 0.0,
        }
    }
}

/// Effect of a freshly drawn selected mutation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrawnEffect {
    pub effect: f64,
    pub dominance: f64,
    pub label: u16,
}

/// A generator of selected mutations over the whole genome.
/// Effects are given as 2Ns and divided by `scaling` when drawn.
#[derive(Clone, Debug)]
pub enum SelectedRegion {
    Gamma {
        weight: f64,
        sign: f64,
        dist: Gamma<f64>,
        dominance: f64,
        scaling: f64,
        label: u16,
    },
    Constant {
        weight: f64,
        twons: f64,
        dominance: f64,
        scaling: f64,
        label: u16,
    },
}

impl SelectedRegion {
    pub fn gamma(
        weight: f64,
        mean: f64,
        shape: f64,
        dominance: f64,
        scaling: f64,
        label: u16,
    ) -> Result<Self> {
        Ok(Self::Gamma {
            weight,
            sign: mean.signum(),
            dist: Gamma::new(shape, mean.abs() / shape)?,
            dominance,
            scaling,
            label,
        })
    }

    pub fn weight(&self) -> f64 {
        match self {
            Self::Gamma { weight, .. } | Self::Constant { weight, .. } => *weight,
        }
    }

    pub fn draw(&self, rng: &mut SmallRng) -> DrawnEffect {
        match self {
            Self::Gamma {
                sign,
                dist,
                dominance,
                scaling,
                label,
                ..
            } => DrawnEffect {
                effect: sign * dist.sample(rng) / scaling,
                dominance: *dominance,
                label: *label,
            },
            Self::Constant {
                twons,
                dominance,
                scaling,
                label,
                ..
            } => DrawnEffect {
                effect: twons / scaling,
                dominance: *dominance,
                label: *label,
            },
        }
    }
}

// ── Parameters ────────────────────────────────────────────────────────────────
#[derive(Clone, Debug)]
pub struct Parameters {
    pub random_seed: u64,
    pub popsize: usize,
    pub sequence_length: f64,
    pub runtime: usize,
    /// Expected crossovers per gamete.
    pub recombination_rate: f64,
    /// Expected new selected mutations per gamete.
    pub mutation_rate: f64,
    /// Simplify every this many generations (0 = only at finalize).
    pub simplify_interval: usize,
    pub dfe: Dfe,
    pub fitness_scaling: f64,
    /// Individuals preserved per sampling timepoint.
    pub ancient_sample_size: usize,
}

impl Parameters {
    pub fn new(
        popsize: usize,
        mutation_rate: f64,
        recombination_rate: f64,
        random_seed: u64,
        dfe: Dfe,
    ) -> Self {
        Self {
            random_seed,
            popsize,
            sequence_length: GENOME_LENGTH,
            runtime: SIMLEN * popsize,
            recombination_rate,
            mutation_rate,
            simplify_interval: DEFAULT_SIMPLIFY_INTERVAL,
            dfe,
            fitness_scaling: FITNESS_SCALING,
            ancient_sample_size: popsize,
        }
    }

    /// Gamma-distributed deleterious component (label 1) mixed with a
    /// fixed-effect beneficial component (label 2).
    pub fn selected_regions(&self) -> Result<Vec<SelectedRegion>> {
        let scaling = 2.0 * self.popsize as f64;
        let dominance = self.fitness_scaling / 2.0;
        let p = self.dfe.proportion;
        Ok(vec![
            SelectedRegion::gamma(
                1.0 - p,
                self.dfe.mean,
                self.dfe.shape,
                dominance,
                scaling,
                1,
            )?,
            SelectedRegion::Constant {
                weight: p,
                twons: TWONS,
                dominance,
                scaling,
                label: 2,
            },
        ])
    }

    /// Generations at which ancestral samples are preserved: the second half
    /// of the run, excluding the final (living) generation.
    pub fn sampling_generations(&self) -> Range<usize> {
        BURNIN * self.popsize..self.runtime
    }
}

// ── Mutation bookkeeping ─────────────────────────────────────────────────────

/// Per-genome mutation set kept **sorted by genomic position**.
/// Each entry is `(position, mutation key)`.
pub type IndMuts = Vec<(f64, usize)>;

/// Every selected mutation ever created, indexed by key.
#[derive(Clone, Debug, Default)]
pub struct MutationRegistry {
    pub records: Vec<MutationRecord>,
}

impl MutationRegistry {
    pub fn next_key(&self) -> usize {
        self.records.len()
    }

    pub fn push(&mut self, record: MutationRecord) -> usize {
        debug_assert_eq!(record.key, self.records.len());
        let key = self.records.len();
        self.records.push(record);
        key
    }

    pub fn get(&self, key: usize) -> &MutationRecord {
        &self.records[key]
    }
}

/// Multiplicative fitness of a diploid over its segregating mutations. A
/// heterozygous site contributes `1 + h s`, a homozygous one `1 + scaling * s`.
/// Never negative.
pub fn diploid_fitness(genomes: &[IndMuts; 2], registry: &MutationRegistry, scaling: f64) -> f64 {
    let het = |key: usize| {
        let r = registry.get(key);
        1.0 + r.dominance * r.effect
    };
    let hom = |key: usize| 1.0 + scaling * registry.get(key).effect;

    let (a, b) = (&genomes[0], &genomes[1]);
    let (mut i, mut j) = (0, 0);
    let mut w = 1.0f64;
    while i < a.len() && j < b.len() {
        if a[i].1 == b[j].1 {
            w *= hom(a[i].1);
            i += 1;
            j += 1;
        } else if a[i].0 < b[j].0 {
            w *= het(a[i].1);
            i += 1;
        } else {
            w *= het(b[j].1);
            j += 1;
        }
    }
    w *= a[i..].iter().map(|&(_, k)| het(k)).product::<f64>();
    w *= b[j..].iter().map(|&(_, k)| het(k)).product::<f64>();
    w.max(0.0)
}

// ── Ancestral sampling ───────────────────────────────────────────────────────

/// Preserves uniformly random distinct individuals at each timepoint.
pub struct RandomAncientSamples {
    rng: SmallRng,
    sample_size: usize,
    timepoints: Range<usize>,
}

impl RandomAncientSamples {
    pub fn new(seed: u64, sample_size: usize, timepoints: Range<usize>) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            sample_size,
            timepoints,
        }
    }

    /// Sorted individual indices to preserve, or `None` off-schedule.
    pub fn sample(&mut self, generation: usize, popsize: usize) -> Option<Vec<usize>> {
        if !self.timepoints.contains(&generation) {
            return None;
        }
        if self.sample_size >= popsize {
            return Some((0..popsize).collect());
        }
        let mut chosen =
            rand::seq::index::sample(&mut self.rng, popsize, self.sample_size).into_vec();
        chosen.sort_unstable();
        Some(chosen)
    }
}

// ── Gametes ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct NewMutation {
    pub position: f64,
    pub effect: DrawnEffect,
}

#[derive(Clone, Debug)]
pub struct Gamete {
    /// Index of the transmitting parent in the current generation.
    pub parent: usize,
    /// Parental genome slot copied before the first breakpoint.
    pub first: usize,
    pub breakpoints: Vec<f64>,
    pub inherited_muts: IndMuts,
    /// New mutations NOT yet in the registry or the tables.
    pub new_muts: Vec<NewMutation>,
}

// ── Helpers ───────────────────────────────────────────────────────────────────

pub fn rotate_edges(bookmark: &tskit::types::Bookmark, tables: &mut tskit::TableCollection) {
    let num_edges = tables.edges().num_rows().as_usize();
    let mid = bookmark.edges().as_usize();
    if mid == 0 || mid == num_edges {
        return;
    }
    unsafe {
        let p = (*tables.as_mut_ptr()).edges;
        std::slice::from_raw_parts_mut(p.left, num_edges).rotate_left(mid);
        std::slice::from_raw_parts_mut(p.right, num_edges).rotate_left(mid);
        std::slice::from_raw_parts_mut(p.parent, num_edges).rotate_left(mid);
        std::slice::from_raw_parts_mut(p.child, num_edges).rotate_left(mid);
    }
}

// ── Simulator ─────────────────────────────────────────────────────────────────
pub struct WrightFisher {
    pub params: Parameters,
    pub tables: tskit::TableCollection,
    pub rng: SmallRng,
    pub birth_time: i64,
    pub bookmark: tskit::types::Bookmark,
    pub population_id: tskit::PopulationId,

    pub registry: MutationRegistry,
    pub regions: Vec<SelectedRegion>,
    /// `nodes[i]` = the two genome nodes of living individual i.
    pub nodes: Vec<[tskit::NodeId; 2]>,
    /// `genomes[i][slot]` = segregating mutations on that genome.
    pub genomes: Vec<[IndMuts; 2]>,
    pub fitness: Vec<f64>,
    pub fixations: Vec<FixationRecord>,

    pub sampler: RandomAncientSamples,
    /// Ancestral samples; node ids are kept current across simplification.
    pub preserved: Vec<SampledIndividual>,

    // Cached distributions (λ = rate × seq_len).
    rec_poisson: Option<Poisson<f64>>,
    mut_poisson: Option<Poisson<f64>>,
    region_picker: Option<WeightedIndex<f64>>,
}

impl WrightFisher {
    // ── Construction ──────────────────────────────────────────────────────────

    pub fn initialize(params: Parameters) -> Result<Self> {
        if params.popsize == 0 {
            bail!("population size must be positive");
        }
        let mut tables = tskit::TableCollection::new(params.sequence_length)?;
        let population_id = tables.add_population()?;

        let parental_time = params.runtime as f64;
        let nodes = (0..params.popsize)
            .map(|_| {
                Ok([
                    tables.add_node(0, parental_time, population_id, -1)?,
                    tables.add_node(0, parental_time, population_id, -1)?,
                ])
            })
            .collect::<Result<Vec<_>>>()?;

        let rng = SmallRng::seed_from_u64(params.random_seed);
        let sampler = RandomAncientSamples::new(
            params.random_seed,
            params.ancient_sample_size,
            params.sampling_generations(),
        );
        let birth_time = params.runtime as i64 - 1;

        let rec_poisson = if params.recombination_rate * params.sequence_length > 0.0 {
            Some(Poisson::new(
                params.recombination_rate * params.sequence_length,
            )?)
        } else {
            None
        };
        let mut_poisson = if params.mutation_rate * params.sequence_length > 0.0 {
            Some(Poisson::new(params.mutation_rate * params.sequence_length)?)
        } else {
            None
        };

        let regions = params.selected_regions()?;
        let region_picker = if mut_poisson.is_some() {
            Some(WeightedIndex::new(regions.iter().map(|r| r.weight()))?)
        } else {
            None
        };

        Ok(Self {
            genomes: vec![[IndMuts::new(), IndMuts::new()]; params.popsize],
            fitness: vec![1.0; params.popsize],
            nodes,
            params,
            tables,
            rng,
            birth_time,
            bookmark: tskit::types::Bookmark::default(),
            population_id,
            registry: MutationRegistry::default(),
            regions,
            fixations: Vec::new(),
            sampler,
            preserved: Vec::new(),
            rec_poisson,
            mut_poisson,
            region_picker,
        })
    }

    // ── Fitness ───────────────────────────────────────────────────────────────

    pub fn individual_fitness(&self, genomes: &[IndMuts; 2]) -> f64 {
        diploid_fitness(genomes, &self.registry, self.params.fitness_scaling)
    }

    // ── Fixed-mutation removal ────────────────────────────────────────────────

    /// Records mutations carried by every living genome as fixations and
    /// removes them from the genomes. A fixed mutation multiplies every
    /// individual's fitness by the same factor, so dropping it leaves
    /// relative fitness unchanged.
    pub fn remove_fixed_mutations(&mut self, generation: usize) {
        let total = 2 * self.genomes.len();
        if total == 0 {
            return;
        }

        let mut counts: HashMap<usize, usize> = HashMap::new();
        for ind in &self.genomes {
            for genome in ind {
                for &(_, key) in genome {
                    *counts.entry(key).or_insert(0) += 1;
                }
            }
        }

        let mut fixed: Vec<usize> = counts
            .into_iter()
            .filter(|&(_, count)| count == total)
            .map(|(key, _)| key)
            .collect();
        if fixed.is_empty() {
            return;
        }
        fixed.sort_unstable();

        for &key in &fixed {
            let r = self.registry.get(key);
            self.fixations.push(FixationRecord {
                key,
                origin: r.origin,
                fixed_at: generation,
                position: r.position,
                effect: r.effect,
                label: r.label,
            });
        }

        let fixed: HashSet<usize> = fixed.into_iter().collect();
        for ind in &mut self.genomes {
            for genome in ind.iter_mut() {
                genome.retain(|&(_, key)| !fixed.contains(&key));
            }
        }
    }

    // ── Core reproductive step ────────────────────────────────────────────────

    pub fn sample_gamete(&mut self, parent: usize) -> Result<Gamete> {
        let seq_len = self.params.sequence_length;
        let first = self.rng.random_range(0..2usize);

        // ── Recombination breakpoints ─────────────────────────────────────────
        let num_bp = match &self.rec_poisson {
            Some(dist) => dist.sample(&mut self.rng) as usize,
            None => 0,
        };
        let breakpoints = if num_bp > 0 {
            let bp_dist = Uniform::new(0.0f64, seq_len)?;
            let mut bps: Vec<f64> = (0..num_bp)
                .map(|_| bp_dist.sample(&mut self.rng))
                .filter(|&x| x > 0.0)
                .collect();
            bps.sort_unstable_by(f64::total_cmp);
            bps.dedup();
            bps
        } else {
            vec![]
        };

        // ── Mutation inheritance ──────────────────────────────────────────────
        let mut inherited_muts: IndMuts = Vec::new();
        let mut cur = first;
        let mut start = 0.0f64;

        for &x in &breakpoints {
            let muts = &self.genomes[parent][cur];
            let lo = muts.partition_point(|&(pos, _)| pos < start);
            let hi = muts.partition_point(|&(pos, _)| pos < x);
            inherited_muts.extend_from_slice(&muts[lo..hi]);
            cur = 1 - cur;
            start = x;
        }
        let muts = &self.genomes[parent][cur];
        let lo = muts.partition_point(|&(pos, _)| pos < start);
        inherited_muts.extend_from_slice(&muts[lo..]);

        // ── New mutations ─────────────────────────────────────────────────────
        let mut new_muts: Vec<NewMutation> = Vec::new();
        if let (Some(dist), Some(picker)) = (&self.mut_poisson, &self.region_picker) {
            let num_new = dist.sample(&mut self.rng) as usize;
            let pos_dist = Uniform::new(0.0f64, seq_len)?;
            for _ in 0..num_new {
                let position = pos_dist.sample(&mut self.rng);
                let region = &self.regions[picker.sample(&mut self.rng)];
                let effect = region.draw(&mut self.rng);
                new_muts.push(NewMutation { position, effect });
            }
        }

        Ok(Gamete {
            parent,
            first,
            breakpoints,
            inherited_muts,
            new_muts,
        })
    }

    pub fn commit_gamete(
        &mut self,
        birth_time: f64,
        generation: usize,
        gamete: Gamete,
    ) -> Result<(tskit::NodeId, IndMuts)> {
        let seq_len = self.params.sequence_length;
        let parent_nodes = self.nodes[gamete.parent];

        let child = self
            .tables
            .add_node(0, birth_time, self.population_id, -1)?;

        // Register new mutations on the child genome.
        let mut child_muts = gamete.inherited_muts;
        for m in gamete.new_muts {
            let record = MutationRecord {
                key: self.registry.next_key(),
                position: m.position,
                origin: generation,
                effect: m.effect.effect,
                dominance: m.effect.dominance,
                label: m.effect.label,
                neutral: false,
            };
            let site = self.tables.add_site(m.position, None)?;
            self.tables.add_mutation_with_metadata(
                site,
                child,
                tskit::MutationId::NULL,
                birth_time,
                None,
                &record,
            )?;
            let key = self.registry.push(record);
            let at = child_muts.partition_point(|&(p, _)| p < m.position);
            child_muts.insert(at, (m.position, key));
        }

        // Replay edges.
        let mut cur_node = parent_nodes[gamete.first];
        let mut other_node = parent_nodes[1 - gamete.first];
        let mut start = 0.0f64;

        for &x in &gamete.breakpoints {
            self.tables.add_edge(start, x, cur_node, child)?;
            std::mem::swap(&mut cur_node, &mut other_node);
            start = x;
        }
        self.tables.add_edge(start, seq_len, cur_node, child)?;

        Ok((child, child_muts))
    }

    // ── Generation loop ───────────────────────────────────────────────────────

    pub fn step(&mut self, generation: usize) -> Result<()> {
        let birth_time = self.birth_time as f64;
        let n = self.params.popsize;

        // ── Phase 1: parents ∝ fitness, one gamete each ──────────────────────
        let parent_dist = WeightedIndex::new(&self.fitness)?;
        let offspring: Vec<[Gamete; 2]> = (0..n)
            .map(|_| {
                let pa = parent_dist.sample(&mut self.rng);
                let pb = parent_dist.sample(&mut self.rng);
                Ok([self.sample_gamete(pa)?, self.sample_gamete(pb)?])
            })
            .collect::<Result<_>>()?;

        // ── Phase 2: commit to tables ─────────────────────────────────────────
        let mut nodes = Vec::with_capacity(n);
        let mut genomes = Vec::with_capacity(n);
        for [g0, g1] in offspring {
            let (n0, m0) = self.commit_gamete(birth_time, generation, g0)?;
            let (n1, m1) = self.commit_gamete(birth_time, generation, g1)?;
            nodes.push([n0, n1]);
            genomes.push([m0, m1]);
        }
        self.nodes = nodes;
        self.genomes = genomes;

        // ── Phase 3: fixations, then fitness of the new generation ───────────
        self.remove_fixed_mutations(generation);
        let fitness: Vec<f64> = self
            .genomes
            .iter()
            .map(|g| self.individual_fitness(g))
            .collect();
        self.fitness = fitness;

        // ── Phase 4: ancestral sampling ───────────────────────────────────────
        if let Some(chosen) = self.sampler.sample(generation, n) {
            for i in chosen {
                self.preserved.push(SampledIndividual {
                    generation,
                    fitness: self.fitness[i],
                    nodes: self.nodes[i],
                });
            }
        }

        // ── Phase 5: periodic simplification ─────────────────────────────────
        let si = self.params.simplify_interval;
        if si > 0 && generation % si == 0 {
            self.simplify(tskit::SimplificationOptions::default())?;
        }

        self.birth_time -= 1;
        Ok(())
    }

    /// Preserved nodes first, then living nodes not already preserved.
    pub fn sample_nodes(&self) -> Vec<tskit::NodeId> {
        let mut seen: HashSet<i32> = HashSet::new();
        self.preserved
            .iter()
            .flat_map(|ind| ind.nodes)
            .chain(self.nodes.iter().flatten().copied())
            .filter(|&node| seen.insert(i32::from(node)))
            .collect()
    }

    fn simplify(&mut self, options: tskit::SimplificationOptions) -> Result<()> {
        let samples = self.sample_nodes();

        self.tables
            .sort(&self.bookmark, tskit::TableSortOptions::default())?;
        rotate_edges(&self.bookmark, &mut self.tables);

        match self.tables.simplify(&samples, options, true)? {
            Some(idmap) => {
                for ind in self.preserved.iter_mut() {
                    for node in ind.nodes.iter_mut() {
                        *node = idmap[usize::try_from(*node)?];
                    }
                }
                for pair in self.nodes.iter_mut() {
                    for node in pair.iter_mut() {
                        *node = idmap[usize::try_from(*node)?];
                    }
                }
            }
            None => bail!("simplification returned no node map"),
        }

        self.bookmark.set_edges(self.tables.edges().num_rows());
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let bar = ProgressBar::new(self.params.runtime as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}",
            )
            .expect("Failed to set progress bar style")
            .progress_chars("##-"),
        );
        for g in 1..=self.params.runtime {
            self.step(g)?;
            bar.inc(1);
            if g % 100 == 0 {
                bar.set_message(format!(
                    "{} fixations, {} preserved",
                    self.fixations.len(),
                    self.preserved.len()
                ));
            }
        }
        bar.finish();
        Ok(())
    }

    // ── Finalization ──────────────────────────────────────────────────────────

    pub fn finalize(mut self) -> Result<Population> {
        self.simplify(tskit::SimplificationOptions::KEEP_INPUT_ROOTS)?;
        self.tables.build_index()?;

        let generation = self.params.runtime;
        let alive = self
            .nodes
            .iter()
            .zip(&self.fitness)
            .map(|(&nodes, &fitness)| SampledIndividual {
                generation,
                fitness,
                nodes,
            });
        let individuals: Vec<SampledIndividual> =
            self.preserved.iter().copied().chain(alive).collect();

        let state = PopulationState {
            popsize: self.params.popsize,
            generation,
            next_mutation_key: self.registry.next_key(),
            fixations: self.fixations,
        };
        Population::new(self.tables, state, individuals)
    }
}
