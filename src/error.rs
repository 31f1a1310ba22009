use thiserror::Error;

/// A broken invariant between the mutation tables and the tree structure.
///
/// These are never recovered from: they mean either the aggregation logic or
/// the genealogy it was handed is inconsistent, and any output written past
/// this point would be wrong.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvariantViolation {
    #[error(
        "generation {generation}: mutation {key} at position {position} lies outside tree interval [{left}, {right})"
    )]
    OutsideTree {
        generation: usize,
        key: usize,
        position: f64,
        left: f64,
        right: f64,
    },

    #[error(
        "generation {generation}: mutation {key} has site position {site_position} but record position {record_position}"
    )]
    PositionMismatch {
        generation: usize,
        key: usize,
        site_position: f64,
        record_position: f64,
    },

    #[error("generation {generation}: visited {visited} mutations but the simplified table holds {expected}")]
    MutationCount {
        generation: usize,
        visited: usize,
        expected: usize,
    },

    #[error("generation {generation}: mutation row {row} is missing {what}")]
    MissingColumn {
        generation: usize,
        row: usize,
        what: &'static str,
    },

    #[error("generation {generation}: sample node {node} is absent from the simplified genealogy")]
    UnmappedSample { generation: usize, node: i32 },

    #[error("generation {generation}: leaf {leaf} does not belong to any sampled individual")]
    UnknownLeaf { generation: usize, leaf: i32 },
}
