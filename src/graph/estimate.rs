//! Token estimation for graph content.
//!
//! A rough heuristic (~4 chars per token plus a fixed per-entity overhead).
//! It only has to be monotone in payload size: it drives the compaction
//! trigger, not billing.

use super::types::{Edge, Node};

/// Fixed overhead per active node (id, framing, field names).
pub const BASE_NODE_TOKENS: usize = 20;

/// Fixed overhead per edge.
pub const BASE_EDGE_TOKENS: usize = 15;

/// Characters per token.
pub const CHARS_PER_TOKEN: usize = 4;

fn chars(items: &[String]) -> usize {
    items.iter().map(|s| s.chars().count()).sum()
}

/// Estimated tokens for one node (counted only while active).
pub fn node_tokens(node: &Node) -> usize {
    let payload = node.gist.chars().count() + chars(&node.notes) + chars(&node.touches);
    BASE_NODE_TOKENS + payload / CHARS_PER_TOKEN
}

/// Estimated tokens for one edge.
pub fn edge_tokens(edge: &Edge) -> usize {
    let payload = edge.rel.chars().count() + chars(&edge.notes);
    BASE_EDGE_TOKENS + payload / CHARS_PER_TOKEN
}

/// Total for a graph: active nodes plus every edge.
pub fn estimate<'a, N, E>(nodes: N, edges: E) -> usize
where
    N: IntoIterator<Item = &'a Node>,
    E: IntoIterator<Item = &'a Edge>,
{
    let node_total: usize = nodes
        .into_iter()
        .filter(|n| n.is_active())
        .map(node_tokens)
        .sum();
    let edge_total: usize = edges.into_iter().map(edge_tokens).sum();
    node_total + edge_total
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn node(gist: &str, notes: &[&str], touches: &[&str], archived: bool) -> Node {
        let now = Utc::now();
        Node {
            id: "n".into(),
            gist: gist.into(),
            touches: touches.iter().map(|s| s.to_string()).collect(),
            notes: notes.iter().map(|s| s.to_string()).collect(),
            created_at: now,
            updated_at: now,
            version: 1,
            origin_session: None,
            archived,
            archived_at: None,
            orphaned_since: None,
        }
    }

    fn edge(rel: &str, notes: &[&str]) -> Edge {
        let now = Utc::now();
        Edge {
            from: "a".into(),
            to: "b".into(),
            rel: rel.into(),
            notes: notes.iter().map(|s| s.to_string()).collect(),
            created_at: now,
            updated_at: now,
            version: 1,
            origin_session: None,
        }
    }

    #[test]
    fn test_node_tokens() {
        assert_eq!(node_tokens(&node("", &[], &[], false)), 20);
        // 8 + 4 + 4 chars = 16 / 4 = 4
        assert_eq!(node_tokens(&node("12345678", &["abcd"], &["x.rs"], false)), 24);
    }

    #[test]
    fn test_edge_tokens() {
        assert_eq!(edge_tokens(&edge("uses", &[])), 16);
        assert_eq!(edge_tokens(&edge("uses", &["abcdefgh"])), 18);
    }

    #[test]
    fn test_archived_nodes_not_counted() {
        let nodes = vec![node("a".repeat(40).as_str(), &[], &[], false), node("b", &[], &[], true)];
        let edges = vec![edge("rel", &[])];
        assert_eq!(estimate(&nodes, &edges), 30 + 15);
    }

    #[test]
    fn test_estimate_is_monotone_in_payload() {
        let small = node("short", &[], &[], false);
        let large = node("short", &["a much longer annotation here"], &["file.rs"], false);
        assert!(node_tokens(&large) >= node_tokens(&small));
    }
}
