use anyhow::{Context, Result, anyhow, bail};
use std::collections::BTreeMap;

// ── Record metadata ───────────────────────────────────────────────────────────

/// Per-mutation metadata stored on the tskit mutation table.
#[derive(
    Clone,
    Debug,
    PartialEq,
    serde::Serialize,
    serde::Deserialize,
    tskit::metadata::tskit_derive::MutationMetadata,
)]
#[serializer("serde_json")]
pub struct MutationRecord {
    /// Stable identifier, unchanged by simplification.
    pub key: usize,
    pub position: f64,
    /// Generation in which the mutation arose.
    pub origin: usize,
    /// Selection coefficient `s`.
    pub effect: f64,
    pub dominance: f64,
    pub label: u16,
    pub neutral: bool,
}

/// A selected mutation that reached frequency 1 in the living population.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FixationRecord {
    pub key: usize,
    pub origin: usize,
    /// Generation in which the fixation was detected and the mutation removed.
    pub fixed_at: usize,
    pub position: f64,
    pub effect: f64,
    pub label: u16,
}

/// Metadata on each individual-table row. Its two genomes are the nodes whose
/// individual column points at the row.
#[derive(
    Clone,
    Debug,
    PartialEq,
    serde::Serialize,
    serde::Deserialize,
    tskit::metadata::tskit_derive::IndividualMetadata,
)]
#[serializer("serde_json")]
pub struct IndividualRecord {
    pub generation: usize,
    pub fitness: f64,
}

/// Population-level state, stored as metadata on the single population row.
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    serde::Serialize,
    serde::Deserialize,
    tskit::metadata::tskit_derive::PopulationMetadata,
)]
#[serializer("serde_json")]
pub struct PopulationState {
    pub popsize: usize,
    /// Generation of the living individuals (tskit time 0).
    pub generation: usize,
    pub next_mutation_key: usize,
    pub fixations: Vec<FixationRecord>,
}

// ── Sampled individuals ───────────────────────────────────────────────────────

/// A diploid individual owns exactly two genome nodes: slot 0 and slot 1.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampledIndividual {
    pub generation: usize,
    pub fitness: f64,
    pub nodes: [tskit::NodeId; 2],
}

/// All individuals preserved at one generation.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleTimepoint {
    pub generation: usize,
    pub individuals: Vec<SampledIndividual>,
}

impl SampleTimepoint {
    /// Sample nodes in individual order, slot 0 before slot 1.
    pub fn nodes(&self) -> Vec<tskit::NodeId> {
        self.individuals
            .iter()
            .flat_map(|ind| ind.nodes)
            .collect()
    }

    pub fn num_genomes(&self) -> usize {
        2 * self.individuals.len()
    }
}

// ── Individual table ─────────────────────────────────────────────────────────

/// Rewrites the individual table and points each sampled node at its owner.
/// Every other node is left without an individual.
fn write_individuals(
    tables: &mut tskit::TableCollection,
    individuals: &[SampledIndividual],
) -> Result<()> {
    let num_nodes = tables.nodes().num_rows().as_usize();
    let mut owner = vec![-1i32; num_nodes];
    let mut table = tskit::IndividualTable::default();
    for ind in individuals {
        let record = IndividualRecord {
            generation: ind.generation,
            fitness: ind.fitness,
        };
        let id = i32::from(table.add_row_with_metadata(0, None, None, &record)?);
        for node in ind.nodes {
            let i = usize::try_from(i32::from(node))
                .ok()
                .filter(|&i| i < num_nodes)
                .ok_or_else(|| anyhow!("sampled node {node:?} is not in the node table"))?;
            if owner[i] != -1 {
                bail!("node {node:?} belongs to individuals {} and {id}", owner[i]);
            }
            owner[i] = id;
        }
    }
    tables.set_individuals(&table)?;

    if num_nodes > 0 {
        unsafe {
            let p = (*tables.as_mut_ptr()).nodes;
            std::slice::from_raw_parts_mut(p.individual, num_nodes).copy_from_slice(&owner);
        }
    }
    Ok(())
}

/// Individuals in table order. Slot 0 is the lower node id.
fn read_individuals(tables: &tskit::TableCollection) -> Result<Vec<SampledIndividual>> {
    let table = tables.individuals();
    let num_individuals = table.num_rows().as_usize();
    let mut nodes: Vec<Vec<tskit::NodeId>> = vec![Vec::new(); num_individuals];
    for row in 0..tables.nodes().num_rows().as_usize() {
        let node = tskit::NodeId::from(i32::try_from(row)?);
        if let Some(owner) = tables.nodes().individual(node) {
            if let Ok(i) = usize::try_from(i32::from(owner)) {
                match nodes.get_mut(i) {
                    Some(genomes) => genomes.push(node),
                    None => bail!("node {row} points at missing individual {i}"),
                }
            }
        }
    }

    let mut individuals = Vec::with_capacity(num_individuals);
    for (row, genomes) in nodes.into_iter().enumerate() {
        let id = tskit::IndividualId::from(i32::try_from(row)?);
        let record = table
            .metadata::<IndividualRecord>(id)
            .ok_or_else(|| anyhow!("individual {row} has no metadata"))??;
        let nodes: [tskit::NodeId; 2] = genomes
            .try_into()
            .map_err(|g: Vec<tskit::NodeId>| anyhow!("individual {row} owns {} nodes", g.len()))?;
        individuals.push(SampledIndividual {
            generation: record.generation,
            fitness: record.fitness,
            nodes,
        });
    }
    Ok(individuals)
}

// ── Population ────────────────────────────────────────────────────────────────

pub struct Population {
    pub tables: tskit::TableCollection,
    pub state: PopulationState,
    /// Ancestral samples and living individuals, in individual-table order.
    pub individuals: Vec<SampledIndividual>,
}

impl Population {
    /// Wraps finished tables, writing `state` into the population table and
    /// `individuals` into the individual table.
    pub fn new(
        mut tables: tskit::TableCollection,
        state: PopulationState,
        individuals: Vec<SampledIndividual>,
    ) -> Result<Self> {
        write_individuals(&mut tables, &individuals)?;
        let mut pop = Self {
            tables,
            state,
            individuals,
        };
        pop.store_state()?;
        Ok(pop)
    }

    pub fn load(path: &str) -> Result<Self> {
        let tables = tskit::TableCollection::new_from_file(path)
            .with_context(|| format!("failed to read population from {path}"))?;
        let state = tables
            .populations()
            .metadata::<PopulationState>(tskit::PopulationId::from(0))
            .ok_or_else(|| anyhow!("{path} carries no population state"))??;
        let individuals = read_individuals(&tables)?;
        Ok(Self {
            tables,
            state,
            individuals,
        })
    }

    pub fn dump(&mut self, path: &str) -> Result<()> {
        self.store_state()?;
        self.tables
            .dump(path, tskit::TableOutputOptions::default())
            .with_context(|| format!("failed to write population to {path}"))?;
        Ok(())
    }

    fn store_state(&mut self) -> Result<()> {
        let mut populations = tskit::PopulationTable::default();
        let _ = populations.add_row_with_metadata(&self.state)?;
        self.tables.set_populations(&populations)?;
        Ok(())
    }

    pub fn popsize(&self) -> usize {
        self.state.popsize
    }

    pub fn num_mutations(&self) -> usize {
        self.tables.mutations().num_rows().as_usize()
    }

    /// Converts a tskit node time into a forward generation number.
    pub fn generation_at(&self, time: f64) -> usize {
        (self.state.generation as f64 - time).round() as usize
    }

    /// Ancestral sampling timepoints in ascending generation order.
    /// The living generation is not included.
    pub fn sample_timepoints(&self) -> Vec<SampleTimepoint> {
        let mut by_generation: BTreeMap<usize, Vec<SampledIndividual>> = BTreeMap::new();
        for ind in &self.individuals {
            if ind.generation != self.state.generation {
                by_generation.entry(ind.generation).or_default().push(*ind);
            }
        }
        by_generation
            .into_iter()
            .map(|(generation, individuals)| SampleTimepoint {
                generation,
                individuals,
            })
            .collect()
    }

    pub fn alive(&self) -> SampleTimepoint {
        SampleTimepoint {
            generation: self.state.generation,
            individuals: self
                .individuals
                .iter()
                .filter(|ind| ind.generation == self.state.generation)
                .copied()
                .collect(),
        }
    }
}

pub fn mutation_record(mutations: &tskit::MutationTable, row: usize) -> Result<MutationRecord> {
    let id = tskit::MutationId::from(i32::try_from(row)?);
    let record = mutations
        .metadata::<MutationRecord>(id)
        .ok_or_else(|| anyhow!("mutation {row} has no metadata"))??;
    Ok(record)
}
