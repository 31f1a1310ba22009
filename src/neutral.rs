use anyhow::{Result, bail};
use rand::distr::{Distribution, Uniform};
use rand::prelude::*;
use rand::rngs::SmallRng;
use rand_distr::Poisson;
use std::collections::HashSet;

use crate::population::{MutationRecord, Population};

struct PendingMutation {
    position: f64,
    node: tskit::NodeId,
    origin: usize,
}

fn node_time(nodes: &tskit::NodeTable, node: tskit::NodeId) -> Result<f64> {
    match nodes.time(node) {
        Some(t) => Ok(f64::from(t)),
        None => bail!("node {node:?} has no time"),
    }
}

/// Places neutral mutations on the recorded genealogy after the fact.
///
/// Each edge receives Poisson(`mu × span × branch length`) mutations at
/// positions uniform over its span, never reusing an existing site position.
/// A mutation's origin is a uniform generation along the branch, strictly
/// after the parent's generation and no later than the child's. Returns the
/// number of mutations added; the tables are re-sorted when any were.
pub fn infinite_sites(rng: &mut SmallRng, pop: &mut Population, mu: f64) -> Result<usize> {
    if mu <= 0.0 {
        return Ok(0);
    }

    let sites = pop.tables.sites();
    let mut taken: HashSet<u64> = HashSet::new();
    for row in 0..sites.num_rows().as_usize() {
        if let Some(p) = sites.position(tskit::SiteId::from(i32::try_from(row)?)) {
            taken.insert(f64::from(p).to_bits());
        }
    }

    let edges = pop.tables.edges();
    let nodes = pop.tables.nodes();
    let mut pending: Vec<PendingMutation> = Vec::new();

    for row in 0..edges.num_rows().as_usize() {
        let e = tskit::EdgeId::from(i32::try_from(row)?);
        let (left, right, parent, child) =
            match (edges.left(e), edges.right(e), edges.parent(e), edges.child(e)) {
                (Some(l), Some(r), Some(p), Some(c)) => (f64::from(l), f64::from(r), p, c),
                _ => bail!("edge {row} is incomplete"),
            };
        let parent_time = node_time(nodes, parent)?;
        let child_time = node_time(nodes, child)?;

        let lambda = mu * (right - left) * (parent_time - child_time);
        if lambda <= 0.0 {
            continue;
        }
        let num_new = Poisson::new(lambda)?.sample(rng) as usize;
        if num_new == 0 {
            continue;
        }

        let pos_dist = Uniform::new(left, right)?;
        let parent_gen = pop.generation_at(parent_time);
        let child_gen = pop.generation_at(child_time);
        if parent_gen >= child_gen {
            bail!(
                "edge {row}: parent at generation {parent_gen} is not older than child at generation {child_gen}"
            );
        }
        for _ in 0..num_new {
            let position = loop {
                let x = pos_dist.sample(rng);
                if taken.insert(x.to_bits()) {
                    break x;
                }
            };
            let origin = rng.random_range(parent_gen + 1..=child_gen);
            pending.push(PendingMutation {
                position,
                node: child,
                origin,
            });
        }
    }

    let added = pending.len();
    for m in pending {
        let record = MutationRecord {
            key: pop.state.next_mutation_key,
            position: m.position,
            origin: m.origin,
            effect: 0.0,
            dominance: 0.0,
            label: 0,
            neutral: true,
        };
        pop.state.next_mutation_key += 1;
        let time = (pop.state.generation - m.origin) as f64;
        let site = pop.tables.add_site(m.position, None)?;
        pop.tables.add_mutation_with_metadata(
            site,
            m.node,
            tskit::MutationId::NULL,
            time,
            None,
            &record,
        )?;
    }

    if added > 0 {
        pop.tables.full_sort(tskit::TableSortOptions::default())?;
        pop.tables.build_index()?;
    }
    Ok(added)
}
