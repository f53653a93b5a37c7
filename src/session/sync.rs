//! Diff computation for session sync.
//!
//! A sync returns every mutation stamped after the session's watermark for
//! the graph's scope, minus the session's own writes, then moves the
//! watermark forward. Callers must hold the graph lock for the whole call:
//! the new watermark is taken from the shared clock while no mutation can
//! interleave, so every later mutation is stamped strictly after it and is
//! delivered by exactly one future sync.

use tracing::debug;

use super::registry::SessionRegistry;
use super::types::{SessionId, SyncResponse};
use crate::clock::Clock;
use crate::error::Result;
use crate::graph::Graph;

/// Compute and deliver the changes `session` has not yet seen in `graph`.
pub fn sync_graph(
    graph: &Graph,
    registry: &SessionRegistry,
    session: &SessionId,
    clock: &Clock,
) -> Result<SyncResponse> {
    let scope = graph.scope().clone();

    registry.with_session(session, |state| {
        let since = state.watermark(&scope);
        let changes = graph.changes_since(since, Some(session));
        let watermark = clock.now();

        state.watermarks.insert(scope.clone(), watermark);
        state.last_seen_at = state.last_seen_at.max(watermark);

        debug!(
            session = %session,
            scope = %scope,
            nodes = changes.nodes.len(),
            edges = changes.edges.len(),
            tombstones = changes.tombstones.len(),
            "sync delivered"
        );

        SyncResponse {
            scope: scope.clone(),
            since_watermark: since,
            watermark,
            changes,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::graph::{EdgeContent, NodeContent, Scope, TombstoneKind};

    fn setup() -> (Graph, SessionRegistry, Clock) {
        (Graph::new(Scope::User), SessionRegistry::new(), Clock::new())
    }

    #[test]
    fn test_sync_exclusivity() {
        let (mut graph, registry, clock) = setup();
        let a = registry.register(clock.now()).unwrap();
        let b = registry.register(clock.now()).unwrap();

        graph
            .put_node(NodeContent::new("x", "from A"), Some(&a), clock.now())
            .unwrap();

        let first = sync_graph(&graph, &registry, &b, &clock).unwrap();
        assert_eq!(first.changes.nodes.len(), 1);
        assert_eq!(first.changes.nodes[0].id, "x");

        let second = sync_graph(&graph, &registry, &b, &clock).unwrap();
        assert!(second.changes.is_empty());
        assert_eq!(second.since_watermark, first.watermark);

        let own = sync_graph(&graph, &registry, &a, &clock).unwrap();
        assert!(own.changes.is_empty());
    }

    #[test]
    fn test_sync_delivers_archive_recall_and_tombstones() {
        let (mut graph, registry, clock) = setup();
        let writer = registry.register(clock.now()).unwrap();
        let reader = registry.register(clock.now()).unwrap();

        graph
            .put_node(NodeContent::new("keep", "k"), Some(&writer), clock.now())
            .unwrap();
        graph
            .put_node(NodeContent::new("gone", "g"), Some(&writer), clock.now())
            .unwrap();
        graph
            .put_edge(EdgeContent::new("gone", "keep", "r"), Some(&writer), clock.now())
            .unwrap();
        sync_graph(&graph, &registry, &reader, &clock).unwrap();

        assert!(graph.archive_node("keep", clock.now()));
        graph.delete_node("gone", Some(&writer), clock.now()).unwrap();

        let diff = sync_graph(&graph, &registry, &reader, &clock).unwrap();
        assert_eq!(diff.changes.nodes.len(), 1);
        assert!(diff.changes.nodes[0].archived);
        let kinds: Vec<TombstoneKind> = diff.changes.tombstones.iter().map(|t| t.kind()).collect();
        assert_eq!(kinds, vec![TombstoneKind::Edge, TombstoneKind::Node]);

        // System archival has no origin, so the writer sees it too.
        let writer_diff = sync_graph(&graph, &registry, &writer, &clock).unwrap();
        assert_eq!(writer_diff.changes.nodes.len(), 1);
        assert!(writer_diff.changes.tombstones.is_empty());

        graph.recall("keep", None, clock.now()).unwrap();
        let after_recall = sync_graph(&graph, &registry, &reader, &clock).unwrap();
        assert_eq!(after_recall.changes.nodes.len(), 1);
        assert!(!after_recall.changes.nodes[0].archived);
    }

    #[test]
    fn test_watermarks_are_per_scope() {
        let registry = SessionRegistry::new();
        let clock = Clock::new();
        let session = registry.register(clock.now()).unwrap();

        let mut user = Graph::new(Scope::User);
        let mut project = Graph::new(Scope::Project("/work/app".into()));
        user.put_node(NodeContent::new("u", "u"), None, clock.now()).unwrap();
        project.put_node(NodeContent::new("p", "p"), None, clock.now()).unwrap();

        assert_eq!(sync_graph(&user, &registry, &session, &clock).unwrap().total_changes(), 1);
        assert_eq!(sync_graph(&project, &registry, &session, &clock).unwrap().total_changes(), 1);
        assert_eq!(sync_graph(&user, &registry, &session, &clock).unwrap().total_changes(), 0);
    }

    #[test]
    fn test_changes_before_registration_not_delivered() {
        let (mut graph, registry, clock) = setup();
        graph.put_node(NodeContent::new("early", "e"), None, clock.now()).unwrap();
        let session = registry.register(clock.now()).unwrap();

        assert!(sync_graph(&graph, &registry, &session, &clock)
            .unwrap()
            .changes
            .is_empty());
    }

    #[test]
    fn test_unknown_session_rejected() {
        let (graph, registry, clock) = setup();
        let err = sync_graph(&graph, &registry, &SessionId::from("ghost"), &clock).unwrap_err();
        assert!(matches!(err, Error::UnknownSession(_)));
    }
}
