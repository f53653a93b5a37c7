//! Versioned node/edge store for one scope.
//!
//! A scope is either the single user-level graph or one project graph. Each
//! graph is sized and compacted on its own.
//!
//! ## Example
//!
//! ```rust,ignore
//! use kg_core::graph::{Graph, NodeContent, EdgeContent, Scope};
//! use chrono::Utc;
//!
//! let mut graph = Graph::new(Scope::User);
//! graph.put_node(NodeContent::new("auth-flow", "JWT issued by the gateway"), None, Utc::now())?;
//! graph.put_edge(EdgeContent::new("auth-flow", "src/gateway.rs", "implemented-in"), None, Utc::now())?;
//!
//! let view = graph.read_active();
//! assert_eq!(view.memory_traces().len(), 1); // src/gateway.rs is not a node
//! ```

pub mod estimate;
mod state;
mod types;

pub use state::Graph;
pub use types::{
    ChangeSet, Edge, EdgeContent, EdgeKey, GraphData, GraphStats, GraphView, Level, Node,
    NodeContent, PutOutcome, Scope, Tombstone, TombstoneKey, TombstoneKind, normalize_project_key,
};
