//! Core types for the knowledge graph.

use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::SessionId;

/// Graph level addressed by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// The single user-wide graph
    User,
    /// A graph scoped to one project directory
    Project,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::User => write!(f, "user"),
            Level::Project => write!(f, "project"),
        }
    }
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Level::User),
            "project" => Ok(Level::Project),
            other => Err(Error::validation(format!(
                "invalid level '{other}', must be one of (user, project)"
            ))),
        }
    }
}

/// A resolved graph address: the user graph or one project graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "level", content = "project_key", rename_all = "lowercase")]
pub enum Scope {
    User,
    Project(String),
}

impl Scope {
    /// Resolve a `(level, project_key)` pair into a scope.
    ///
    /// `user` takes no project key; `project` requires a non-empty one,
    /// which is normalised with [`normalize_project_key`] so every spelling
    /// of a directory addresses the same graph.
    pub fn resolve(level: Level, project_key: Option<&str>) -> Result<Self> {
        match (level, project_key) {
            (Level::User, None) => Ok(Scope::User),
            (Level::User, Some(_)) => Err(Error::validation(
                "project_key is not accepted for level 'user'",
            )),
            (Level::Project, Some(key)) if !key.trim().is_empty() => {
                Ok(Scope::Project(normalize_project_key(key)))
            }
            (Level::Project, _) => Err(Error::validation(
                "project_key is required for level 'project'",
            )),
        }
    }

    pub fn level(&self) -> Level {
        match self {
            Scope::User => Level::User,
            Scope::Project(_) => Level::Project,
        }
    }

    pub fn project_key(&self) -> Option<&str> {
        match self {
            Scope::User => None,
            Scope::Project(key) => Some(key),
        }
    }
}

/// Canonical spelling of a project directory.
///
/// Trims whitespace, expands a leading `~`, drops `.` components and
/// trailing separators, and folds `..` into its parent where one exists.
/// Purely lexical: symlinks are not resolved.
pub fn normalize_project_key(raw: &str) -> String {
    let expanded = shellexpand::tilde(raw.trim()).into_owned();
    let mut out = PathBuf::new();
    for component in Path::new(&expanded).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        return ".".to_string();
    }
    out.to_string_lossy().into_owned()
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::User => write!(f, "user"),
            Scope::Project(key) => write!(f, "project:{}", key),
        }
    }
}

/// A node in the knowledge graph: one compressed insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique key within the graph
    pub id: String,
    /// The compressed one-line insight
    pub gist: String,
    /// Loosely related artifact references
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub touches: Vec<String>,
    /// Free-text annotations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every observable mutation
    pub version: u64,
    /// Session that performed the last mutation, `None` for system mutations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_session: Option<SessionId>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    /// When the node, while archived, first lost every edge to an active node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphaned_since: Option<DateTime<Utc>>,
}

impl Node {
    pub fn is_active(&self) -> bool {
        !self.archived
    }

    /// Characters of gist plus notes, the "richness" of a node.
    pub fn content_chars(&self) -> usize {
        self.gist.chars().count() + self.notes.iter().map(|n| n.chars().count()).sum::<usize>()
    }
}

/// Caller-supplied content for a node put.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeContent {
    pub id: String,
    pub gist: String,
    #[serde(default)]
    pub touches: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl NodeContent {
    pub fn new(id: impl Into<String>, gist: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            gist: gist.into(),
            touches: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn with_touches<I, S>(mut self, touches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.touches = touches.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_notes<I, S>(mut self, notes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.notes = notes.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("node id must not be empty"));
        }
        Ok(())
    }
}

/// Unique identity of an edge within a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub from: String,
    pub to: String,
    pub rel: String,
}

impl EdgeKey {
    pub fn new(from: impl Into<String>, to: impl Into<String>, rel: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            rel: rel.into(),
        }
    }

    /// Whether either endpoint is `id`.
    pub fn touches_endpoint(&self, id: &str) -> bool {
        self.from == id || self.to == id
    }


    pub(crate) fn validate(&self) -> Result<()> {
        for (name, value) in [("from", &self.from), ("to", &self.to), ("rel", &self.rel)] {
            if value.trim().is_empty() {
                return Err(Error::validation(format!("edge {name} must not be empty")));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}:{}", self.from, self.to, self.rel)
    }
}

/// A directed, labelled relation. Endpoints are free-form and need not be node ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub rel: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_session: Option<SessionId>,
}

impl Edge {
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(&self.from, &self.to, &self.rel)
    }
}

/// Caller-supplied content for an edge put.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeContent {
    #[serde(flatten)]
    pub key: EdgeKey,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl EdgeContent {
    pub fn new(from: impl Into<String>, to: impl Into<String>, rel: impl Into<String>) -> Self {
        Self {
            key: EdgeKey::new(from, to, rel),
            notes: Vec::new(),
        }
    }

    pub fn with_notes<I, S>(mut self, notes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.notes = notes.into_iter().map(Into::into).collect();
        self
    }
}

/// What a tombstone records the deletion of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TombstoneKey {
    Node { id: String },
    Edge(EdgeKey),
}

/// Tombstone discriminant, for callers that only need the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TombstoneKind {
    Node,
    Edge,
}

/// A short-lived deletion record that lets sync report removals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    #[serde(flatten)]
    pub key: TombstoneKey,
    pub deleted_at: DateTime<Utc>,
    /// Last version of the entity plus one
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_session: Option<SessionId>,
}

impl Tombstone {
    pub fn kind(&self) -> TombstoneKind {
        match self.key {
            TombstoneKey::Node { .. } => TombstoneKind::Node,
            TombstoneKey::Edge(_) => TombstoneKind::Edge,
        }
    }

    pub fn is_node(&self, id: &str) -> bool {
        matches!(&self.key, TombstoneKey::Node { id: node_id } if node_id == id)
    }

    pub fn is_edge(&self, key: &EdgeKey) -> bool {
        matches!(&self.key, TombstoneKey::Edge(edge_key) if edge_key == key)
    }
}

/// Whether a put created a new entity or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PutOutcome {
    Created,
    Updated,
}

/// The caller-visible content of a graph: active nodes and every edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphView {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl GraphView {
    /// Edges with at least one endpoint not among the returned nodes.
    ///
    /// These are memory traces: hints that related knowledge exists but is
    /// archived or lives outside the graph.
    pub fn memory_traces(&self) -> Vec<&Edge> {
        let loaded: std::collections::HashSet<&str> =
            self.nodes.iter().map(|n| n.id.as_str()).collect();
        self.edges
            .iter()
            .filter(|e| !loaded.contains(e.from.as_str()) || !loaded.contains(e.to.as_str()))
            .collect()
    }
}

/// Mutations a session has not yet seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub tombstones: Vec<Tombstone>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty() && self.tombstones.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.edges.len() + self.tombstones.len()
    }
}

/// Persisted content of one graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphData {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub tombstones: Vec<Tombstone>,
}

/// Point-in-time counters for one graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub active_node_count: usize,
    pub archived_node_count: usize,
    pub edge_count: usize,
    pub tombstone_count: usize,
    pub estimated_tokens: usize,
    pub dirty: bool,
    pub last_saved_at: Option<DateTime<Utc>>,
}
