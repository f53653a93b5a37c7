//! Percentile-product scoring for archival decisions.
//!
//! Higher score = more valuable = kept longer. Each node is ranked against the
//! other eligible nodes on three dimensions and the three percentile ranks are
//! multiplied, so a node at the bottom of any single dimension is strongly
//! suppressed no matter how it fares on the others.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::Graph;

/// Immutable snapshot of the facts scoring needs about one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreInput {
    pub id: String,
    pub updated_at: DateTime<Utc>,
    /// Edge endpoints on this node plus its `touches`
    pub connectedness: usize,
    /// Characters of gist plus notes
    pub richness: usize,
}

/// Score of one eligible node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeScore {
    pub id: String,
    pub updated_at: DateTime<Utc>,
    pub recency_pct: f64,
    pub connectedness_pct: f64,
    pub richness_pct: f64,
    /// Product of the three percentiles, in `[0, 1]`
    pub score: f64,
}

/// Snapshot the nodes eligible for archival.
///
/// Eligible means active and last updated at least `protect_window` ago.
/// Nodes inside the window are left out entirely.
pub fn eligible_inputs(graph: &Graph, now: DateTime<Utc>, protect_window: Duration) -> Vec<ScoreInput> {
    graph
        .nodes()
        .filter(|n| n.is_active() && now - n.updated_at >= protect_window)
        .map(|n| ScoreInput {
            id: n.id.clone(),
            updated_at: n.updated_at,
            connectedness: graph.degree(&n.id) + n.touches.len(),
            richness: n.content_chars(),
        })
        .collect()
}

/// Score every input, lowest score first.
///
/// Ties on score are broken by older `updated_at`, then by id, so the
/// archival order is deterministic.
pub fn score_nodes(inputs: &[ScoreInput]) -> Vec<NodeScore> {
    let recency = percentile_ranks(&inputs.iter().map(|i| i.updated_at).collect::<Vec<_>>());
    let connectedness = percentile_ranks(&inputs.iter().map(|i| i.connectedness).collect::<Vec<_>>());
    let richness = percentile_ranks(&inputs.iter().map(|i| i.richness).collect::<Vec<_>>());

    let mut scores: Vec<NodeScore> = inputs
        .iter()
        .enumerate()
        .map(|(idx, input)| NodeScore {
            id: input.id.clone(),
            updated_at: input.updated_at,
            recency_pct: recency[idx],
            connectedness_pct: connectedness[idx],
            richness_pct: richness[idx],
            score: recency[idx] * connectedness[idx] * richness[idx],
        })
        .collect();

    scores.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then(a.updated_at.cmp(&b.updated_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    scores
}

/// Percentile rank of each value among `values`, in `[0, 1]`.
///
/// Ascending position / (n - 1); tied values share the mean of their
/// positions. A single value ranks 0.5.
pub fn percentile_ranks<K: Ord>(values: &[K]) -> Vec<f64> {
    let n = values.len();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![0.5];
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].cmp(&values[b]));

    let denom = (n - 1) as f64;
    let mut ranks = vec![0.0; n];
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // positions start..end share one mid-rank
        let mid = (start + end - 1) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = mid / denom;
        }
        start = end;
    }
    ranks
}
