//! Score-based archival.
//!
//! When a graph outgrows its token budget the lowest-value nodes are
//! archived: hidden from reads but kept, along with every edge that points
//! at them. Archived nodes that lose all links to active nodes are deleted
//! after a grace period.

mod compactor;
pub mod scorer;

pub use compactor::{
    ArchivalConfig, ArchivalController, CompactionReport, MaintenanceReport, OrphanReport,
};
pub use scorer::{eligible_inputs, percentile_ranks, score_nodes, NodeScore, ScoreInput};
