//! Session registry and diff-based sync.
//!
//! Each caller registers once and then polls `sync` to receive what other
//! callers changed since its last poll. There is no central transaction log:
//! every entity carries its own `updated_at` and `origin_session`, and
//! deletions are kept as tombstones for a bounded window.

mod registry;
mod sync;
mod types;

pub use registry::SessionRegistry;
pub use sync::sync_graph;
pub use types::{Session, SessionId, SyncResponse};
