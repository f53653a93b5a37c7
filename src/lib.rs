//! # kg-core
//!
//! A persistent knowledge graph shared by concurrent agent sessions, kept
//! under a strict token budget.
//!
//! ## Core Components
//!
//! - **Graph**: versioned nodes, edges and deletion tombstones for one scope
//! - **Archival**: percentile-product scoring, compaction and orphan reclamation
//! - **Session**: registration and watermark-based diff sync
//! - **Persistence**: atomic JSON snapshots with tiered backups
//! - **Store**: routing, per-graph locks and the autosave loop
//!
//! ## Example
//!
//! ```rust,ignore
//! use kg_core::{Level, NodeContent, Store, StoreConfig};
//!
//! let store = Store::open(StoreConfig::from_env()?)?;
//! let maintenance = store.spawn_maintenance();
//!
//! let me = store.register_session()?;
//! store
//!     .put_node(Level::User, None, NodeContent::new("prefers-rg", "Use ripgrep, not grep"), Some(&me))
//!     .await?;
//!
//! let diff = store.sync(Level::User, None, &me).await?;
//! println!("{} changes from other sessions", diff.total_changes());
//!
//! store.shutdown().await?;
//! maintenance.stop().await;
//! ```

pub mod archival;
pub mod clock;
pub mod config;
pub mod error;
pub mod graph;
pub mod persistence;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use archival::{ArchivalConfig, ArchivalController, CompactionReport, MaintenanceReport};
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use graph::{
    ChangeSet, Edge, EdgeContent, EdgeKey, Graph, GraphView, Level, Node, NodeContent, PutOutcome,
    Scope, Tombstone,
};
pub use persistence::{GraphFile, LoadReport};
pub use session::{SessionId, SyncResponse};
#[cfg(feature = "tokio-runtime")]
pub use store::MaintenanceHandle;
pub use store::{PingReport, ScopeStatus, Store};
