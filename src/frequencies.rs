//! Allele-frequency trajectories from a recorded genealogy.
//!
//! For every ancestral sampling timepoint the genealogy is simplified down to
//! the individuals preserved at that generation. The local trees then give
//! each mutation's derived allele count directly: under infinite sites the
//! number of sample leaves below a mutation is its frequency.

use anyhow::{Result, bail};
use std::collections::{HashMap, HashSet};
use streaming_iterator::StreamingIterator;

use crate::BURNIN;
use crate::error::InvariantViolation;
use crate::population::{
    FixationRecord, MutationRecord, Population, SampleTimepoint, SampledIndividual,
    mutation_record,
};

/// Width, in generations, of the window in which fixations are tracked.
pub const FIXATION_WINDOW: usize = 200;

// ── Fixation bookkeeping ─────────────────────────────────────────────────────

/// Inclusive range of generations `[BURNIN × N, BURNIN × N + 200]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObservationWindow {
    pub start: usize,
    pub end: usize,
}

impl ObservationWindow {
    pub fn for_popsize(popsize: usize) -> Self {
        let start = BURNIN * popsize;
        Self {
            start,
            end: start + FIXATION_WINDOW,
        }
    }

    pub fn contains(&self, generation: usize) -> bool {
        (self.start..=self.end).contains(&generation)
    }
}

/// Mutations known to have fixed inside the observation window, keyed by
/// `(origin generation, position)`.
#[derive(Clone, Debug, Default)]
pub struct FixationSet {
    entries: HashSet<(usize, u64)>,
}

impl FixationSet {
    /// Union of
    /// (a) selected fixations completed inside the window that arose no
    ///     earlier than its start, and
    /// (b) neutral mutations carried by all `2N` living genomes whose origin
    ///     lies inside the window. Neutral fixation times are never
    ///     simulated, so the origin stands in for them.
    pub fn build<'a>(
        fixations: &[FixationRecord],
        neutral_counts: impl IntoIterator<Item = (&'a MutationRecord, usize)>,
        popsize: usize,
        window: ObservationWindow,
    ) -> Self {
        let mut set = Self::default();
        for f in fixations {
            if window.contains(f.fixed_at) && f.origin >= window.start {
                set.insert(f.origin, f.position);
            }
        }
        for (record, count) in neutral_counts {
            if record.neutral && count == 2 * popsize && window.contains(record.origin) {
                set.insert(record.origin, record.position);
            }
        }
        set
    }

    pub fn insert(&mut self, origin: usize, position: f64) {
        self.entries.insert((origin, position.to_bits()));
    }

    pub fn contains(&self, origin: usize, position: f64) -> bool {
        self.entries.contains(&(origin, position.to_bits()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A mutation at count `2N` that is not a tracked fixation fixed before the
/// window opened. Its fixation cannot be observed, so it must not be reported
/// as segregating.
pub fn fixed_before_window(dac: usize, popsize: usize, fixation: bool) -> bool {
    dac == 2 * popsize && !fixation
}

// ── Output rows ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct AlleleFreq {
    pub generation: usize,
    pub position: f64,
    pub origin: usize,
    pub dac: usize,
    pub fixation: bool,
    pub neutral: bool,
    pub label: u16,
    pub esize: f64,
    /// Mean fitness over carrying genomes, when requested.
    pub w: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PopulationFitness {
    pub generation: usize,
    pub mean_fitness: f64,
    pub var_fitness: f64,
}

impl PopulationFitness {
    /// Mean and population variance of `w` over exactly these individuals.
    pub fn from_individuals(generation: usize, individuals: &[SampledIndividual]) -> Self {
        let n = individuals.len() as f64;
        if individuals.is_empty() {
            return Self {
                generation,
                mean_fitness: 0.0,
                var_fitness: 0.0,
            };
        }
        let mean = individuals.iter().map(|i| i.fitness).sum::<f64>() / n;
        let var = individuals
            .iter()
            .map(|i| (i.fitness - mean).powi(2))
            .sum::<f64>()
            / n;
        Self {
            generation,
            mean_fitness: mean,
            var_fitness: var,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrequencyTables {
    pub alleles: Vec<AlleleFreq>,
    pub fitness: Vec<PopulationFitness>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ExtractionOptions {
    /// Compute the mean fitness of each mutation's carriers.
    pub carrier_fitness: bool,
}

// ── Leaf → individual mapping ────────────────────────────────────────────────

/// Which sampled individual, and which of its two genomes, a leaf is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafSlot {
    pub individual: usize,
    pub slot: usize,
}

/// Maps simplified leaf ids back to the sampled individuals they belong to.
#[derive(Clone, Debug, Default)]
pub struct LeafMap {
    slots: HashMap<i32, LeafSlot>,
}

impl LeafMap {
    /// `idmap[old node]` is the node's id after simplification.
    pub fn new(
        generation: usize,
        individuals: &[SampledIndividual],
        idmap: &[tskit::NodeId],
    ) -> Result<Self, InvariantViolation> {
        let mut slots = HashMap::with_capacity(2 * individuals.len());
        for (individual, ind) in individuals.iter().enumerate() {
            for (slot, &old) in ind.nodes.iter().enumerate() {
                let old = i32::from(old);
                let new = usize::try_from(old)
                    .ok()
                    .and_then(|i| idmap.get(i))
                    .copied()
                    .filter(|&n| n != tskit::NodeId::NULL)
                    .ok_or(InvariantViolation::UnmappedSample {
                        generation,
                        node: old,
                    })?;
                slots.insert(i32::from(new), LeafSlot { individual, slot });
            }
        }
        Ok(Self { slots })
    }

    pub fn get(&self, leaf: tskit::NodeId) -> Option<LeafSlot> {
        self.slots.get(&i32::from(leaf)).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// ── Per-timepoint genealogy ──────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct SimplifiedMutation {
    pub record: MutationRecord,
    /// Position of the mutation's site in the simplified tables.
    pub position: f64,
    pub node: tskit::NodeId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MutationObservation {
    pub record: MutationRecord,
    pub position: f64,
    pub dac: usize,
    pub carrier_fitness: Option<f64>,
}

/// The genealogy restricted to one timepoint's samples.
pub struct TimepointGenealogy {
    pub generation: usize,
    pub treeseq: tskit::TreeSequence,
    /// In table order, which is ascending position.
    pub mutations: Vec<SimplifiedMutation>,
    pub leaves: LeafMap,
    pub individuals: Vec<SampledIndividual>,
}

impl TimepointGenealogy {
    pub fn simplify(tables: &tskit::TableCollection, timepoint: &SampleTimepoint) -> Result<Self> {
        let generation = timepoint.generation;
        let mut tables = tables.deepcopy()?;
        let samples = timepoint.nodes();
        let idmap: Vec<tskit::NodeId> =
            match tables.simplify(&samples, tskit::SimplificationOptions::default(), true)? {
                Some(idmap) => idmap.to_vec(),
                None => bail!("generation {generation}: simplification returned no node map"),
            };
        let leaves = LeafMap::new(generation, &timepoint.individuals, &idmap)?;
        tables.build_index()?;

        let table = tables.mutations();
        let sites = tables.sites();
        let num_mutations = table.num_rows().as_usize();
        let mut mutations = Vec::with_capacity(num_mutations);
        for row in 0..num_mutations {
            let id = tskit::MutationId::from(i32::try_from(row)?);
            let missing = |what| InvariantViolation::MissingColumn {
                generation,
                row,
                what,
            };
            let site = table.site(id).ok_or_else(|| missing("a site"))?;
            let node = table.node(id).ok_or_else(|| missing("a node"))?;
            let position = sites
                .position(site)
                .map(f64::from)
                .ok_or_else(|| missing("a site position"))?;
            let record = mutation_record(table, row)?;
            if position != record.position {
                return Err(InvariantViolation::PositionMismatch {
                    generation,
                    key: record.key,
                    site_position: position,
                    record_position: record.position,
                }
                .into());
            }
            mutations.push(SimplifiedMutation {
                record,
                position,
                node,
            });
        }

        let treeseq = tables.tree_sequence(tskit::TreeSequenceFlags::default())?;
        Ok(Self {
            generation,
            treeseq,
            mutations,
            leaves,
            individuals: timepoint.individuals.clone(),
        })
    }

    /// Walks the local trees left to right, assigning each mutation to the
    /// tree whose interval covers its position.
    pub fn observe(&self, carrier_fitness: bool) -> Result<Vec<MutationObservation>> {
        let generation = self.generation;
        let mut observations = Vec::with_capacity(self.mutations.len());
        let mut visited = 0usize;

        let mut tree_iter = self.treeseq.tree_iterator(tskit::TreeFlags::SAMPLE_LISTS)?;
        while let Some(tree) = tree_iter.next() {
            let (left, right) = tree.interval();
            let (left, right) = (f64::from(left), f64::from(right));

            while visited < self.mutations.len() && self.mutations[visited].position < right {
                let m = &self.mutations[visited];
                if m.position < left {
                    return Err(InvariantViolation::OutsideTree {
                        generation,
                        key: m.record.key,
                        position: m.position,
                        left,
                        right,
                    }
                    .into());
                }

                let mut dac = 0usize;
                let mut w_sum = 0.0f64;
                for leaf in tree.samples(m.node)? {
                    dac += 1;
                    if carrier_fitness {
                        let slot = self.leaves.get(leaf).ok_or(
                            InvariantViolation::UnknownLeaf {
                                generation,
                                leaf: i32::from(leaf),
                            },
                        )?;
                        w_sum += self.individuals[slot.individual].fitness;
                    }
                }

                observations.push(MutationObservation {
                    record: m.record.clone(),
                    position: m.position,
                    dac,
                    carrier_fitness: (carrier_fitness && dac > 0).then(|| w_sum / dac as f64),
                });
                visited += 1;
            }
        }

        if visited != self.mutations.len() {
            return Err(InvariantViolation::MutationCount {
                generation,
                visited,
                expected: self.mutations.len(),
            }
            .into());
        }
        Ok(observations)
    }
}

// ── Aggregation ──────────────────────────────────────────────────────────────

/// Derived allele counts of every mutation among the living genomes.
pub fn mutation_counts(pop: &Population) -> Result<Vec<(MutationRecord, usize)>> {
    let genealogy = TimepointGenealogy::simplify(&pop.tables, &pop.alive())?;
    Ok(genealogy
        .observe(false)?
        .into_iter()
        .map(|obs| (obs.record, obs.dac))
        .collect())
}

pub fn fixation_set(
    pop: &Population,
    num_neutral: usize,
    window: ObservationWindow,
) -> Result<FixationSet> {
    let counts = if num_neutral > 0 {
        mutation_counts(pop)?
    } else {
        Vec::new()
    };
    Ok(FixationSet::build(
        &pop.state.fixations,
        counts.iter().map(|(r, c)| (r, *c)),
        pop.popsize(),
        window,
    ))
}

/// Allele-frequency rows for every (timepoint, segregating mutation) pair and
/// one population-fitness row per timepoint, in ascending generation order.
/// Within a timepoint, rows follow the order the trees are walked.
pub fn count_frequencies(
    pop: &Population,
    num_neutral: usize,
    options: ExtractionOptions,
) -> Result<FrequencyTables> {
    let window = ObservationWindow::for_popsize(pop.popsize());
    let fixations = fixation_set(pop, num_neutral, window)?;
    eprintln!("{} tracked fixations", fixations.len());

    let mut out = FrequencyTables::default();
    for timepoint in pop.sample_timepoints() {
        let genealogy = TimepointGenealogy::simplify(&pop.tables, &timepoint)?;
        out.fitness.push(PopulationFitness::from_individuals(
            timepoint.generation,
            &timepoint.individuals,
        ));

        for obs in genealogy.observe(options.carrier_fitness)? {
            let fixation = fixations.contains(obs.record.origin, obs.position);
            if fixed_before_window(obs.dac, pop.popsize(), fixation) {
                continue;
            }
            out.alleles.push(AlleleFreq {
                generation: timepoint.generation,
                position: obs.position,
                origin: obs.record.origin,
                dac: obs.dac,
                fixation,
                neutral: obs.record.neutral,
                label: obs.record.label,
                esize: obs.record.effect,
                w: obs.carrier_fitness,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neutral(origin: usize, position: f64) -> MutationRecord {
        MutationRecord {
            key: 0,
            position,
            origin,
            effect: 0.0,
            dominance: 0.0,
            label: 0,
            neutral: true,
        }
    }

    fn fixation(origin: usize, fixed_at: usize, position: f64) -> FixationRecord {
        FixationRecord {
            key: 0,
            origin,
            fixed_at,
            position,
            effect: 0.01,
            label: 2,
        }
    }

    fn individual(fitness: f64, a: i32, b: i32) -> SampledIndividual {
        SampledIndividual {
            generation: 0,
            fitness,
            nodes: [tskit::NodeId::from(a), tskit::NodeId::from(b)],
        }
    }

    #[test]
    fn window_is_inclusive() {
        let w = ObservationWindow::for_popsize(100);
        assert_eq!(w.start, 1000);
        assert_eq!(w.end, 1200);
        assert!(w.contains(1000));
        assert!(w.contains(1200));
        assert!(!w.contains(999));
        assert!(!w.contains(1201));
    }

    #[test]
    fn selected_fixations_need_window_and_late_origin() {
        let window = ObservationWindow::for_popsize(100);
        let fixations = vec![
            fixation(1010, 1150, 0.1),
            fixation(990, 1100, 0.2),
            fixation(1100, 1250, 0.3),
        ];
        let set = FixationSet::build(&fixations, std::iter::empty(), 100, window);
        assert_eq!(set.len(), 1);
        assert!(set.contains(1010, 0.1));
        assert!(!set.contains(990, 0.2));
        assert!(!set.contains(1100, 0.3));
    }

    #[test]
    fn neutral_fixations_are_backfilled_from_origin() {
        let window = ObservationWindow::for_popsize(100);
        let inside = neutral(1050, 0.4);
        let outside = neutral(1300, 0.5);
        let segregating = neutral(1060, 0.6);
        let counts = vec![(&inside, 200), (&outside, 200), (&segregating, 150)];
        let set = FixationSet::build(&[], counts, 100, window);
        assert!(set.contains(1050, 0.4));
        assert!(!set.contains(1300, 0.5));
        assert!(!set.contains(1060, 0.6));
    }

    #[test]
    fn selected_counts_never_enter_through_the_neutral_path() {
        let window = ObservationWindow::for_popsize(10);
        let mut selected = neutral(105, 0.7);
        selected.neutral = false;
        let set = FixationSet::build(&[], vec![(&selected, 20)], 10, window);
        assert!(set.is_empty());
    }

    #[test]
    fn suppression_only_hits_untracked_fixed_mutations() {
        assert!(fixed_before_window(8, 4, false));
        assert!(!fixed_before_window(8, 4, true));
        assert!(!fixed_before_window(7, 4, false));
        // Carried by every genome of a partial sample, still segregating.
        assert!(!fixed_before_window(2, 4, false));
    }

    #[test]
    fn population_fitness_mean_and_variance() {
        let inds = vec![
            individual(1.0, 0, 1),
            individual(0.5, 2, 3),
            individual(0.8, 4, 5),
            individual(0.9, 6, 7),
        ];
        let f = PopulationFitness::from_individuals(12, &inds);
        assert_eq!(f.generation, 12);
        assert!((f.mean_fitness - 0.8).abs() < 1e-12);
        assert!((f.var_fitness - 0.035).abs() < 1e-12);
    }

    #[test]
    fn leaf_map_names_individual_and_slot() {
        let inds = vec![individual(1.0, 10, 11), individual(0.5, 12, 13)];
        let mut idmap = vec![tskit::NodeId::NULL; 14];
        for (new, old) in (10..14).enumerate() {
            idmap[old] = tskit::NodeId::from(new as i32);
        }
        let leaves = LeafMap::new(3, &inds, &idmap).unwrap();
        assert_eq!(leaves.len(), 4);
        assert_eq!(
            leaves.get(tskit::NodeId::from(3)),
            Some(LeafSlot {
                individual: 1,
                slot: 1
            })
        );
        assert_eq!(
            leaves.get(tskit::NodeId::from(0)),
            Some(LeafSlot {
                individual: 0,
                slot: 0
            })
        );
        assert_eq!(leaves.get(tskit::NodeId::from(7)), None);
    }

    #[test]
    fn unmapped_sample_is_a_violation() {
        let inds = vec![individual(1.0, 0, 5)];
        let idmap = vec![tskit::NodeId::from(0), tskit::NodeId::NULL];
        let err = LeafMap::new(9, &inds, &idmap).unwrap_err();
        assert_eq!(
            err,
            InvariantViolation::UnmappedSample {
                generation: 9,
                node: 5
            }
        );
    }
}
