//! Archival controller: keeps a graph under its token budget.
//!
//! Node lifecycle: `active -> archived -> deleted`, with `archived -> active`
//! through recall or a fresh put. Archival never touches edges, so an
//! archived node stays discoverable as the endpoint of a memory trace.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::scorer::{eligible_inputs, score_nodes};
use crate::config::StoreConfig;
use crate::graph::{estimate, EdgeKey, Graph};

/// Budgets and windows for archival.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivalConfig {
    /// Compaction runs only above this estimate.
    pub max_tokens: usize,
    /// Compaction stops once the estimate is at or below this.
    pub target_tokens: usize,
    pub protect_window: Duration,
    pub orphan_grace: Duration,
    pub tombstone_retention: Duration,
}

impl Default for ArchivalConfig {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

impl From<&StoreConfig> for ArchivalConfig {
    fn from(config: &StoreConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            target_tokens: config.compaction_target(),
            protect_window: config.protect_window(),
            orphan_grace: config.orphan_grace(),
            tombstone_retention: config.tombstone_retention(),
        }
    }
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub before_tokens: usize,
    pub after_tokens: usize,
    pub target_tokens: usize,
    /// Archived node ids, in archival order
    pub archived: Vec<String>,
}

impl CompactionReport {
    /// Whether the pass ended at or under the target.
    pub fn reached_target(&self) -> bool {
        self.after_tokens <= self.target_tokens
    }
}

/// Outcome of orphan bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrphanReport {
    pub newly_orphaned: Vec<String>,
    pub reconnected: Vec<String>,
    pub reclaimed_nodes: Vec<String>,
    pub reclaimed_edges: usize,
}

/// Outcome of a full maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub compaction: CompactionReport,
    pub orphans: OrphanReport,
    pub pruned_tombstones: usize,
}

/// Applies scoring and orphan rules to a graph.
#[derive(Debug, Clone, Default)]
pub struct ArchivalController {
    config: ArchivalConfig,
}

impl ArchivalController {
    pub fn new(config: ArchivalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ArchivalConfig {
        &self.config
    }

    /// Archive lowest-scored eligible nodes until the graph fits its budget.
    ///
    /// Does nothing unless the estimate exceeds `max_tokens`. Stops at the
    /// target or when eligible nodes run out; protected nodes are never
    /// touched, so the target may legitimately be missed.
    pub fn compact(&self, graph: &mut Graph, now: DateTime<Utc>) -> CompactionReport {
        let before = graph.estimate_size();
        let mut report = CompactionReport {
            before_tokens: before,
            after_tokens: before,
            target_tokens: self.config.target_tokens,
            archived: Vec::new(),
        };

        if before <= self.config.max_tokens {
            return report;
        }

        info!(
            scope = %graph.scope(),
            tokens = before,
            limit = self.config.max_tokens,
            "compacting graph"
        );

        let ranked = score_nodes(&eligible_inputs(graph, now, self.config.protect_window));
        if ranked.is_empty() {
            debug!(scope = %graph.scope(), "no nodes eligible for archiving (all protected)");
            return report;
        }

        let mut size = before;
        for scored in ranked {
            if size <= self.config.target_tokens {
                break;
            }
            let cost = match graph.node(&scored.id) {
                Some(node) if node.is_active() => estimate::node_tokens(node),
                _ => continue,
            };
            if graph.archive_node(&scored.id, now) {
                // Archival only removes this node's contribution.
                size -= cost;
                debug!(
                    scope = %graph.scope(),
                    node = %scored.id,
                    score = scored.score,
                    tokens = cost,
                    "archived node"
                );
                report.archived.push(scored.id);
            }
        }

        report.after_tokens = graph.estimate_size();
        info!(
            scope = %graph.scope(),
            archived = report.archived.len(),
            tokens = report.after_tokens,
            "compaction complete"
        );
        report
    }

    /// Start or clear the orphan clock on archived nodes.
    ///
    /// An archived node is orphaned when no edge links it to an active node.
    pub fn refresh_orphans(&self, graph: &mut Graph, now: DateTime<Utc>) -> OrphanReport {
        let reachable = reachable_from_active(graph);
        let mut report = OrphanReport::default();

        let archived: Vec<(String, bool)> = graph
            .nodes()
            .filter(|n| n.archived)
            .map(|n| (n.id.clone(), n.orphaned_since.is_some()))
            .collect();

        for (id, marked) in archived {
            match (reachable.contains(&id), marked) {
                (true, true) => {
                    graph.set_orphaned_since(&id, None);
                    debug!(scope = %graph.scope(), node = %id, "node reconnected, orphan clock cleared");
                    report.reconnected.push(id);
                }
                (false, false) => {
                    graph.set_orphaned_since(&id, Some(now));
                    debug!(scope = %graph.scope(), node = %id, "node orphaned, grace period started");
                    report.newly_orphaned.push(id);
                }
                _ => {}
            }
        }
        report
    }

    /// Permanently delete archived nodes orphaned for longer than the grace period.
    ///
    /// Edges whose endpoints are all reclaimed or absent go with them; edges
    /// still anchored on a surviving node are kept as memory traces.
    pub fn reclaim_orphans(&self, graph: &mut Graph, now: DateTime<Utc>, report: &mut OrphanReport) {
        let expired: BTreeSet<String> = graph
            .nodes()
            .filter(|n| n.archived)
            .filter(|n| matches!(n.orphaned_since, Some(since) if now - since > self.config.orphan_grace))
            .map(|n| n.id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }

        let dangling: Vec<EdgeKey> = graph
            .edges()
            .map(|e| e.key())
            .filter(|k| expired.contains(&k.from) || expired.contains(&k.to))
            .filter(|k| {
                let gone = |id: &str| expired.contains(id) || graph.node(id).is_none();
                gone(&k.from) && gone(&k.to)
            })
            .collect();

        for key in &dangling {
            graph.purge_edge(key, None, now);
        }
        for id in &expired {
            graph.purge_node(id, None, now);
            info!(scope = %graph.scope(), node = %id, "deleted orphaned node");
        }

        report.reclaimed_edges += dangling.len();
        report.reclaimed_nodes.extend(expired);
    }

    /// Compaction, orphan bookkeeping and tombstone pruning, in that order.
    pub fn run(&self, graph: &mut Graph, now: DateTime<Utc>) -> MaintenanceReport {
        let compaction = self.compact(graph, now);
        let mut orphans = self.refresh_orphans(graph, now);
        self.reclaim_orphans(graph, now, &mut orphans);
        let pruned_tombstones = graph.prune_tombstones(now - self.config.tombstone_retention);
        if pruned_tombstones > 0 {
            debug!(scope = %graph.scope(), pruned = pruned_tombstones, "pruned tombstones");
        }

        MaintenanceReport {
            compaction,
            orphans,
            pruned_tombstones,
        }
    }
}

/// Ids on the far side of an edge from an active node.
fn reachable_from_active(graph: &Graph) -> BTreeSet<String> {
    let active = graph.active_ids();
    let mut reachable = BTreeSet::new();
    for edge in graph.edges() {
        if edge.from != edge.to {
            if active.contains(edge.from.as_str()) {
                reachable.insert(edge.to.clone());
            }
            if active.contains(edge.to.as_str()) {
                reachable.insert(edge.from.clone());
            }
        }
    }
    reachable
}
