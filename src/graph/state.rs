//! Mutable node/edge collection for a single scope.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::estimate;
use super::types::*;
use crate::error::{Error, Result};
use crate::session::SessionId;

/// Node/edge/tombstone state of one scope.
///
/// Nodes and edges live in two independent maps keyed by id and by
/// `(from, to, rel)`; relationships are looked up by key, never through
/// references between entries.
#[derive(Debug, Clone)]
pub struct Graph {
    scope: Scope,
    nodes: BTreeMap<String, Node>,
    edges: BTreeMap<EdgeKey, Edge>,
    /// Ordered by `deleted_at`
    tombstones: Vec<Tombstone>,
    dirty: bool,
    last_saved_at: Option<DateTime<Utc>>,
    /// Incremented on every change that needs persisting
    mutation_seq: u64,
}

impl Graph {
    /// Create an empty graph.
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            tombstones: Vec::new(),
            dirty: false,
            last_saved_at: None,
            mutation_seq: 0,
        }
    }

    /// Rebuild a graph from persisted data. Later duplicates win.
    pub fn from_data(scope: Scope, data: GraphData) -> Self {
        let mut graph = Self::new(scope);
        for node in data.nodes {
            graph.nodes.insert(node.id.clone(), node);
        }
        for edge in data.edges {
            graph.edges.insert(edge.key(), edge);
        }
        graph.tombstones = data.tombstones;
        graph.tombstones.sort_by_key(|t| t.deleted_at);
        graph
    }

    /// Copy of the persisted content.
    pub fn to_data(&self) -> GraphData {
        GraphData {
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
            tombstones: self.tombstones.clone(),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn edge(&self, key: &EdgeKey) -> Option<&Edge> {
        self.edges.get(key)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn tombstones(&self) -> &[Tombstone] {
        &self.tombstones
    }

    /// Latest timestamp recorded anywhere in the graph.
    pub fn latest_stamp(&self) -> Option<DateTime<Utc>> {
        let nodes = self.nodes.values().map(|n| n.updated_at);
        let edges = self.edges.values().map(|e| e.updated_at);
        let tombs = self.tombstones.iter().map(|t| t.deleted_at);
        nodes.chain(edges).chain(tombs).max()
    }

    // ==================== Mutations ====================

    /// Create or fully replace a node's content.
    ///
    /// Always reactivates the node: a write means the knowledge is in use.
    pub fn put_node(
        &mut self,
        content: NodeContent,
        origin: Option<&SessionId>,
        now: DateTime<Utc>,
    ) -> Result<PutOutcome> {
        content.validate()?;
        let NodeContent {
            id,
            gist,
            touches,
            notes,
        } = content;

        let outcome = match self.nodes.get_mut(&id) {
            Some(node) => {
                node.gist = gist;
                node.touches = touches;
                node.notes = notes;
                node.updated_at = now;
                node.version += 1;
                node.origin_session = origin.cloned();
                node.archived = false;
                node.archived_at = None;
                node.orphaned_since = None;
                PutOutcome::Updated
            }
            None => {
                let prior_version = self.take_node_tombstone(&id);
                let node = Node {
                    id: id.clone(),
                    gist,
                    touches,
                    notes,
                    created_at: now,
                    updated_at: now,
                    version: prior_version + 1,
                    origin_session: origin.cloned(),
                    archived: false,
                    archived_at: None,
                    orphaned_since: None,
                };
                self.nodes.insert(id.clone(), node);
                PutOutcome::Created
            }
        };

        self.touch();
        debug!(scope = %self.scope, node = %id, ?outcome, "put node");
        Ok(outcome)
    }

    /// Create or fully replace an edge. Endpoints are not checked against nodes.
    pub fn put_edge(
        &mut self,
        content: EdgeContent,
        origin: Option<&SessionId>,
        now: DateTime<Utc>,
    ) -> Result<PutOutcome> {
        content.key.validate()?;
        let EdgeContent { key, notes } = content;

        let outcome = match self.edges.get_mut(&key) {
            Some(edge) => {
                edge.notes = notes;
                edge.updated_at = now;
                edge.version += 1;
                edge.origin_session = origin.cloned();
                PutOutcome::Updated
            }
            None => {
                let prior_version = self.take_edge_tombstone(&key);
                let edge = Edge {
                    from: key.from.clone(),
                    to: key.to.clone(),
                    rel: key.rel.clone(),
                    notes,
                    created_at: now,
                    updated_at: now,
                    version: prior_version + 1,
                    origin_session: origin.cloned(),
                };
                self.edges.insert(key.clone(), edge);
                PutOutcome::Created
            }
        };

        self.touch();
        debug!(scope = %self.scope, edge = %key, ?outcome, "put edge");
        Ok(outcome)
    }

    /// Delete a node and every edge touching it. Returns the removed edge count.
    pub fn delete_node(
        &mut self,
        id: &str,
        origin: Option<&SessionId>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if !self.nodes.contains_key(id) {
            return Err(Error::not_found(&self.scope, id));
        }

        let edge_keys: Vec<EdgeKey> = self
            .edges
            .keys()
            .filter(|k| k.touches_endpoint(id))
            .cloned()
            .collect();
        for key in &edge_keys {
            self.purge_edge(key, origin, now);
        }
        self.purge_node(id, origin, now);

        debug!(scope = %self.scope, node = %id, removed_edges = edge_keys.len(), "deleted node");
        Ok(edge_keys.len())
    }

    /// Delete one edge.
    pub fn delete_edge(
        &mut self,
        key: &EdgeKey,
        origin: Option<&SessionId>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.purge_edge(key, origin, now).is_none() {
            return Err(Error::not_found(&self.scope, key.to_string()));
        }
        debug!(scope = %self.scope, edge = %key, "deleted edge");
        Ok(())
    }

    /// Bring a node back into active context.
    ///
    /// Idempotent: recalling an active node still refreshes its recency.
    pub fn recall(
        &mut self,
        id: &str,
        origin: Option<&SessionId>,
        now: DateTime<Utc>,
    ) -> Result<Node> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::not_found(&self.scope, id))?;

        let was_archived = node.archived;
        node.archived = false;
        node.archived_at = None;
        node.orphaned_since = None;
        node.updated_at = now;
        node.version += 1;
        node.origin_session = origin.cloned();
        let recalled = node.clone();

        self.touch();
        debug!(scope = %self.scope, node = %id, was_archived, "recalled node");
        Ok(recalled)
    }

    /// Mark an active node archived. Its edges are left untouched.
    ///
    /// Returns `false` if the node is missing or already archived.
    pub fn archive_node(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        if node.archived {
            return false;
        }
        node.archived = true;
        node.archived_at = Some(now);
        node.updated_at = now;
        node.version += 1;
        node.origin_session = None;
        self.touch();
        true
    }

    /// Set or clear the orphan marker on an archived node.
    ///
    /// Internal bookkeeping: marks the graph dirty but is not a versioned
    /// mutation, so sync does not report it.
    pub(crate) fn set_orphaned_since(&mut self, id: &str, since: Option<DateTime<Utc>>) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) if node.orphaned_since != since => {
                node.orphaned_since = since;
                self.touch();
                true
            }
            _ => false,
        }
    }

    /// Remove a node and record a tombstone. Edges are not touched.
    pub(crate) fn purge_node(
        &mut self,
        id: &str,
        origin: Option<&SessionId>,
        now: DateTime<Utc>,
    ) -> Option<Node> {
        let node = self.nodes.remove(id)?;
        self.push_tombstone(Tombstone {
            key: TombstoneKey::Node { id: id.to_string() },
            deleted_at: now,
            version: node.version + 1,
            origin_session: origin.cloned(),
        });
        Some(node)
    }

    /// Remove an edge and record a tombstone.
    pub(crate) fn purge_edge(
        &mut self,
        key: &EdgeKey,
        origin: Option<&SessionId>,
        now: DateTime<Utc>,
    ) -> Option<Edge> {
        let edge = self.edges.remove(key)?;
        self.push_tombstone(Tombstone {
            key: TombstoneKey::Edge(key.clone()),
            deleted_at: now,
            version: edge.version + 1,
            origin_session: origin.cloned(),
        });
        Some(edge)
    }

    /// Drop tombstones recorded before `cutoff`. Returns how many were dropped.
    pub fn prune_tombstones(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tombstones.len();
        self.tombstones.retain(|t| t.deleted_at >= cutoff);
        let pruned = before - self.tombstones.len();
        if pruned > 0 {
            self.touch();
        }
        pruned
    }

    fn push_tombstone(&mut self, tombstone: Tombstone) {
        // Stamps come from a monotone clock, so appending keeps the order.
        self.tombstones.push(tombstone);
        self.touch();
    }

    /// Remove the tombstone for a node id, returning the version it recorded.
    fn take_node_tombstone(&mut self, id: &str) -> u64 {
        let mut version = 0;
        self.tombstones.retain(|t| {
            if t.is_node(id) {
                version = version.max(t.version);
                false
            } else {
                true
            }
        });
        version
    }

    fn take_edge_tombstone(&mut self, key: &EdgeKey) -> u64 {
        let mut version = 0;
        self.tombstones.retain(|t| {
            if t.is_edge(key) {
                version = version.max(t.version);
                false
            } else {
                true
            }
        });
        version
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.mutation_seq += 1;
    }

    // ==================== Reads ====================

    /// All non-archived nodes and every edge, regardless of endpoint state.
    pub fn read_active(&self) -> GraphView {
        GraphView {
            nodes: self.nodes.values().filter(|n| n.is_active()).cloned().collect(),
            edges: self.edges.values().cloned().collect(),
        }
    }

    /// Token estimate of what `read_active` would return.
    pub fn estimate_size(&self) -> usize {
        estimate::estimate(self.nodes.values(), self.edges.values())
    }

    /// Ids of active nodes.
    pub fn active_ids(&self) -> BTreeSet<&str> {
        self.nodes
            .values()
            .filter(|n| n.is_active())
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Number of edge endpoints equal to `id` (a self-loop counts twice).
    pub fn degree(&self, id: &str) -> usize {
        self.edges
            .keys()
            .map(|k| usize::from(k.from == id) + usize::from(k.to == id))
            .sum()
    }

    /// Mutations stamped after `watermark` that `exclude` did not make.
    pub fn changes_since(
        &self,
        watermark: DateTime<Utc>,
        exclude: Option<&SessionId>,
    ) -> ChangeSet {
        let foreign = |origin: &Option<SessionId>| match (origin, exclude) {
            (Some(origin), Some(exclude)) => origin != exclude,
            _ => true,
        };

        ChangeSet {
            nodes: self
                .nodes
                .values()
                .filter(|n| n.updated_at > watermark && foreign(&n.origin_session))
                .cloned()
                .collect(),
            edges: self
                .edges
                .values()
                .filter(|e| e.updated_at > watermark && foreign(&e.origin_session))
                .cloned()
                .collect(),
            tombstones: self
                .tombstones
                .iter()
                .filter(|t| t.deleted_at > watermark && foreign(&t.origin_session))
                .cloned()
                .collect(),
        }
    }

    pub fn stats(&self) -> GraphStats {
        let archived = self.nodes.values().filter(|n| n.archived).count();
        GraphStats {
            active_node_count: self.nodes.len() - archived,
            archived_node_count: archived,
            edge_count: self.edges.len(),
            tombstone_count: self.tombstones.len(),
            estimated_tokens: self.estimate_size(),
            dirty: self.dirty,
            last_saved_at: self.last_saved_at,
        }
    }

    // ==================== Persistence bookkeeping ====================

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mutation_seq(&self) -> u64 {
        self.mutation_seq
    }

    pub fn last_saved_at(&self) -> Option<DateTime<Utc>> {
        self.last_saved_at
    }

    /// Record a successful save of the state observed at `seq`.
    ///
    /// The dirty flag is only cleared if nothing changed since that snapshot.
    pub fn mark_saved(&mut self, seq: u64, at: DateTime<Utc>) -> bool {
        self.last_saved_at = Some(at);
        if self.mutation_seq == seq {
            self.dirty = false;
            true
        } else {
            false
        }
    }
}
