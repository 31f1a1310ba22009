//! Frequency extraction on a hand-built genealogy with known answers.
//!
//! Eight leaves (generation 20) belong to four individuals with fitness
//! 1.0, 0.5, 0.8 and 0.9. Two local trees:
//!
//! ```text
//!   [0, 0.5):  8 -> {0,1,2,3}   9 -> {4,5,6,7}
//!   [0.5, 1):  8 -> {0,1,4,5}   9 -> {2,3,6,7}
//! ```
//!
//! Node 10 is the root over 8 and 9. Nodes 8 and 9 are also the two genomes
//! of a single individual sampled at generation 19.

use forward_freqs::*;

const FITNESS: [f64; 4] = [1.0, 0.5, 0.8, 0.9];
const POPSIZE: usize = 4;

struct Placed {
    position: f64,
    node: i32,
    time: f64,
    origin: usize,
}

fn record(key: usize, m: &Placed) -> MutationRecord {
    MutationRecord {
        key,
        position: m.position,
        origin: m.origin,
        effect: -0.01,
        dominance: 1.0,
        label: 1,
        neutral: false,
    }
}

fn placements() -> Vec<Placed> {
    vec![
        Placed {
            position: 0.25,
            node: 8,
            time: 2.5,
            origin: 18,
        },
        Placed {
            position: 0.5,
            node: 2,
            time: 1.5,
            origin: 19,
        },
        Placed {
            position: 0.75,
            node: 8,
            time: 2.5,
            origin: 18,
        },
        Placed {
            position: 0.9,
            node: 10,
            time: 3.5,
            origin: 50,
        },
    ]
}

fn individual(generation: usize, fitness: f64, a: i32, b: i32) -> SampledIndividual {
    SampledIndividual {
        generation,
        fitness,
        nodes: [tskit::NodeId::from(a), tskit::NodeId::from(b)],
    }
}

fn build(fixations: Vec<FixationRecord>, corrupt_position: bool) -> Population {
    let mut tables = tskit::TableCollection::new(1.0).unwrap();
    let pop = tables.add_population().unwrap();
    for _ in 0..8 {
        tables.add_node(0, 1.0, pop, -1).unwrap();
    }
    let n8 = tables.add_node(0, 2.0, pop, -1).unwrap();
    let n9 = tables.add_node(0, 2.0, pop, -1).unwrap();
    let root = tables.add_node(0, 3.0, pop, -1).unwrap();

    let leaf = |i: i32| tskit::NodeId::from(i);
    for (l, r, p, c) in [
        (0.0, 1.0, n8, 0),
        (0.0, 1.0, n8, 1),
        (0.0, 0.5, n8, 2),
        (0.0, 0.5, n8, 3),
        (0.5, 1.0, n8, 4),
        (0.5, 1.0, n8, 5),
        (0.0, 0.5, n9, 4),
        (0.0, 0.5, n9, 5),
        (0.5, 1.0, n9, 2),
        (0.5, 1.0, n9, 3),
        (0.0, 1.0, n9, 6),
        (0.0, 1.0, n9, 7),
    ] {
        tables.add_edge(l, r, p, leaf(c)).unwrap();
    }
    tables.add_edge(0.0, 1.0, root, n8).unwrap();
    tables.add_edge(0.0, 1.0, root, n9).unwrap();

    for (key, m) in placements().iter().enumerate() {
        let mut md = record(key, m);
        if corrupt_position && key == 2 {
            md.position = 0.7;
        }
        let site = tables.add_site(m.position, None).unwrap();
        tables
            .add_mutation_with_metadata(
                site,
                tskit::NodeId::from(m.node),
                tskit::MutationId::NULL,
                m.time,
                None,
                &md,
            )
            .unwrap();
    }
    tables
        .full_sort(tskit::TableSortOptions::default())
        .unwrap();

    let mut individuals = vec![individual(19, 2.0, 8, 9)];
    for (i, &w) in FITNESS.iter().enumerate() {
        let first = 2 * i as i32;
        individuals.push(individual(20, w, first, first + 1));
    }
    let state = PopulationState {
        popsize: POPSIZE,
        generation: 21,
        next_mutation_key: 4,
        fixations,
    };
    Population::new(tables, state, individuals).unwrap()
}

fn carrier_options() -> ExtractionOptions {
    ExtractionOptions {
        carrier_fitness: true,
    }
}

fn rows_at(tables: &FrequencyTables, generation: usize) -> Vec<&AlleleFreq> {
    tables
        .alleles
        .iter()
        .filter(|r| r.generation == generation)
        .collect()
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-12
}

#[test]
fn derived_counts_match_leaves_below_each_mutation() {
    let pop = build(vec![], false);
    let out = count_frequencies(&pop, 0, ExtractionOptions::default()).unwrap();

    let rows = rows_at(&out, 20);
    let observed: Vec<(f64, usize)> = rows.iter().map(|r| (r.position, r.dac)).collect();
    assert_eq!(observed, vec![(0.25, 4), (0.5, 1), (0.75, 4)]);
    assert!(rows.iter().all(|r| r.w.is_none()));
    assert!(rows.iter().all(|r| !r.fixation && !r.neutral));
    assert!(rows.iter().all(|r| r.label == 1 && close(r.esize, -0.01)));
}

#[test]
fn mean_carrier_fitness_is_averaged_over_genomes() {
    let pop = build(vec![], false);
    let out = count_frequencies(&pop, 0, carrier_options()).unwrap();

    let rows = rows_at(&out, 20);
    let w: Vec<f64> = rows.iter().map(|r| r.w.unwrap()).collect();
    assert_eq!(w.len(), 3);
    assert!(close(w[0], 0.75));
    assert!(close(w[1], 0.5));
    assert!(close(w[2], 0.9));
}

#[test]
fn untracked_fixed_mutation_is_suppressed_only_at_2n() {
    let pop = build(vec![], false);
    let out = count_frequencies(&pop, 0, carrier_options()).unwrap();

    let root: Vec<&AlleleFreq> = out.alleles.iter().filter(|r| r.position == 0.9).collect();
    assert_eq!(root.len(), 1);
    assert_eq!(root[0].generation, 19);
    assert_eq!(root[0].dac, 2);
    assert!(!root[0].fixation);
}

#[test]
fn tracked_fixation_is_reported_at_full_frequency() {
    let fixation = FixationRecord {
        key: 3,
        origin: 50,
        fixed_at: 60,
        position: 0.9,
        effect: -0.01,
        label: 1,
    };
    let pop = build(vec![fixation], false);
    let out = count_frequencies(&pop, 0, carrier_options()).unwrap();

    let fixed: Vec<&AlleleFreq> = out.alleles.iter().filter(|r| r.position == 0.9).collect();
    assert_eq!(fixed.len(), 2);
    assert!(fixed.iter().all(|r| r.fixation));
    assert_eq!(fixed[0].generation, 19);
    assert_eq!(fixed[0].dac, 2);
    assert!(close(fixed[0].w.unwrap(), 2.0));
    assert_eq!(fixed[1].generation, 20);
    assert_eq!(fixed[1].dac, 8);
    assert!(close(fixed[1].w.unwrap(), 0.8));
}

#[test]
fn earlier_timepoint_sees_only_ancestral_mutations() {
    let pop = build(vec![], false);
    let out = count_frequencies(&pop, 0, carrier_options()).unwrap();

    assert_eq!(out.alleles[0].generation, 19);
    let rows = rows_at(&out, 19);
    let observed: Vec<(f64, usize)> = rows.iter().map(|r| (r.position, r.dac)).collect();
    // One sampled individual out of N = 4: carrying both genomes is not 2N.
    assert_eq!(observed, vec![(0.25, 1), (0.75, 1), (0.9, 2)]);
    assert!(rows.iter().all(|r| close(r.w.unwrap(), 2.0)));
    assert!(rows.iter().all(|r| !r.fixation));
}

#[test]
fn population_fitness_per_timepoint() {
    let pop = build(vec![], false);
    let out = count_frequencies(&pop, 0, ExtractionOptions::default()).unwrap();

    assert_eq!(out.fitness.len(), 2);
    assert_eq!(out.fitness[0].generation, 19);
    assert!(close(out.fitness[0].mean_fitness, 2.0));
    assert!(close(out.fitness[0].var_fitness, 0.0));
    assert_eq!(out.fitness[1].generation, 20);
    assert!(close(out.fitness[1].mean_fitness, 0.8));
    assert!(close(out.fitness[1].var_fitness, 0.035));
}

#[test]
fn position_disagreement_is_fatal() {
    let pop = build(vec![], true);
    let err = count_frequencies(&pop, 0, ExtractionOptions::default()).unwrap_err();
    match err.downcast_ref::<InvariantViolation>() {
        Some(InvariantViolation::PositionMismatch {
            key,
            site_position,
            record_position,
            ..
        }) => {
            assert_eq!(*key, 2);
            assert_eq!(*site_position, 0.75);
            assert_eq!(*record_position, 0.7);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

// ── Neutral fixations inferred from the living generation ──────────────────
//
// N = 2, window [20, 220], living generation 30.
//
// ```text
//   8 (gen 24) -> {4, 5, 6, 7} (gen 27) ; 4 -> 0, 5 -> 1, 6 -> 2, 7 -> 3 (gen 30)
// ```
//
// Nodes 4..7 are the two individuals sampled at generation 27 and nodes
// 0..3 the two living individuals. Neutral mutations on the root at 0.3
// (origin 22, inside the window) and 0.6 (origin 15, outside), and one on
// node 4 at 0.8 that stays segregating.

fn neutral_record(key: usize, position: f64, origin: usize) -> MutationRecord {
    MutationRecord {
        key,
        position,
        origin,
        effect: 0.0,
        dominance: 0.0,
        label: 0,
        neutral: true,
    }
}

fn build_with_living() -> Population {
    let mut tables = tskit::TableCollection::new(1.0).unwrap();
    let pop = tables.add_population().unwrap();
    let living: Vec<tskit::NodeId> = (0..4)
        .map(|_| tables.add_node(0, 0.0, pop, -1).unwrap())
        .collect();
    let sampled: Vec<tskit::NodeId> = (0..4)
        .map(|_| tables.add_node(0, 3.0, pop, -1).unwrap())
        .collect();
    let root = tables.add_node(0, 6.0, pop, -1).unwrap();
    for (&s, &l) in sampled.iter().zip(&living) {
        tables.add_edge(0.0, 1.0, root, s).unwrap();
        tables.add_edge(0.0, 1.0, s, l).unwrap();
    }

    for (key, (position, node, time, origin)) in [
        (0.3, root, 8.0, 22),
        (0.6, root, 15.0, 15),
        (0.8, sampled[0], 4.0, 26),
    ]
    .into_iter()
    .enumerate()
    {
        let site = tables.add_site(position, None).unwrap();
        tables
            .add_mutation_with_metadata(
                site,
                node,
                tskit::MutationId::NULL,
                time,
                None,
                &neutral_record(key, position, origin),
            )
            .unwrap();
    }
    tables
        .full_sort(tskit::TableSortOptions::default())
        .unwrap();

    let individuals = vec![
        individual(27, 1.0, 4, 5),
        individual(27, 0.9, 6, 7),
        individual(30, 1.0, 0, 1),
        individual(30, 0.8, 2, 3),
    ];
    let state = PopulationState {
        popsize: 2,
        generation: 30,
        next_mutation_key: 3,
        fixations: vec![],
    };
    Population::new(tables, state, individuals).unwrap()
}

#[test]
fn living_counts_flag_neutral_fixations_inside_the_window() {
    let pop = build_with_living();
    let out = count_frequencies(&pop, 3, carrier_options()).unwrap();

    let observed: Vec<(f64, usize, bool)> = out
        .alleles
        .iter()
        .map(|r| (r.position, r.dac, r.fixation))
        .collect();
    assert_eq!(observed, vec![(0.3, 4, true), (0.8, 1, false)]);
    assert!(out.alleles.iter().all(|r| r.neutral && r.generation == 27));
}

#[test]
fn without_neutral_variants_the_living_generation_is_not_consulted() {
    let pop = build_with_living();
    let out = count_frequencies(&pop, 0, carrier_options()).unwrap();

    let observed: Vec<f64> = out.alleles.iter().map(|r| r.position).collect();
    assert_eq!(observed, vec![0.8]);
}
