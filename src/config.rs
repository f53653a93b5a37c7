//! Store configuration.
//!
//! Defaults mirror the budgets the knowledge graph has always shipped with;
//! every field can be overridden through `KG_*` environment variables.

use std::path::PathBuf;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default location of the user-level snapshot.
pub const DEFAULT_USER_GRAPH_PATH: &str = "~/.claude/knowledge/user.json";

/// Default snapshot location inside a project directory.
pub const DEFAULT_PROJECT_GRAPH_FILE: &str = ".knowledge/graph.json";

/// Configuration for a [`Store`](crate::store::Store).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Snapshot file for the user graph. A leading `~` is expanded.
    pub user_graph_path: PathBuf,
    /// Snapshot file for a project graph, relative to the project key.
    pub project_graph_file: PathBuf,
    /// Token budget per graph; compaction starts above it.
    pub max_tokens: usize,
    /// Compaction stops once the estimate is at or below `max_tokens * ratio`.
    pub compaction_target_ratio: f64,
    /// Nodes updated within this many days are never scored or archived.
    pub protect_days: u32,
    /// Days an archived node may stay orphaned before it is reclaimed.
    pub orphan_grace_days: u32,
    /// Days a tombstone remains available to sync.
    pub tombstone_retention_days: u32,
    /// Hours of inactivity after which a session is purged.
    pub session_ttl_hours: u32,
    /// Seconds between maintenance/autosave ticks.
    pub save_interval_secs: u64,
    /// Maximum wait for a graph lock, in milliseconds.
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            user_graph_path: PathBuf::from(DEFAULT_USER_GRAPH_PATH),
            project_graph_file: PathBuf::from(DEFAULT_PROJECT_GRAPH_FILE),
            max_tokens: 5000,
            compaction_target_ratio: 0.9,
            protect_days: 7,
            orphan_grace_days: 7,
            tombstone_retention_days: 7,
            session_ttl_hours: 24,
            save_interval_secs: 30,
            lock_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// `from_env` delegates here; tests pass a map instead of mutating the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("KG_USER_PATH").filter(|s| !s.trim().is_empty()) {
            config.user_graph_path = PathBuf::from(path);
        }
        if let Some(file) = lookup("KG_PROJECT_GRAPH_FILE").filter(|s| !s.trim().is_empty()) {
            config.project_graph_file = PathBuf::from(file);
        }
        if let Some(v) = parse_var(&lookup, "KG_MAX_TOKENS")? {
            config.max_tokens = v;
        }
        if let Some(v) = parse_var(&lookup, "KG_PROTECT_DAYS")? {
            config.protect_days = v;
        }
        if let Some(v) = parse_var(&lookup, "KG_ORPHAN_GRACE_DAYS")? {
            config.orphan_grace_days = v;
        }
        if let Some(v) = parse_var(&lookup, "KG_TOMBSTONE_DAYS")? {
            config.tombstone_retention_days = v;
        }
        if let Some(v) = parse_var(&lookup, "KG_SESSION_TTL_HOURS")? {
            config.session_ttl_hours = v;
        }
        if let Some(v) = parse_var(&lookup, "KG_SAVE_INTERVAL")? {
            config.save_interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "KG_LOCK_TIMEOUT_MS")? {
            config.lock_timeout_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(Error::Config("max_tokens must be greater than 0".into()));
        }
        if !(self.compaction_target_ratio > 0.0 && self.compaction_target_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "compaction_target_ratio must be in (0, 1], got {}",
                self.compaction_target_ratio
            )));
        }
        if self.save_interval_secs == 0 {
            return Err(Error::Config("save_interval_secs must be greater than 0".into()));
        }
        if self.project_graph_file.is_absolute() {
            return Err(Error::Config(format!(
                "project_graph_file must be relative, got {}",
                self.project_graph_file.display()
            )));
        }
        Ok(())
    }

    /// Set the user snapshot path.
    pub fn with_user_graph_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.user_graph_path = path.into();
        self
    }

    /// Set the per-project snapshot file.
    pub fn with_project_graph_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.project_graph_file = file.into();
        self
    }

    /// Set the token budget.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the protect window in days.
    pub fn with_protect_days(mut self, days: u32) -> Self {
        self.protect_days = days;
        self
    }

    /// Set the orphan grace period in days.
    pub fn with_orphan_grace_days(mut self, days: u32) -> Self {
        self.orphan_grace_days = days;
        self
    }

    /// Set the autosave interval in seconds.
    pub fn with_save_interval_secs(mut self, secs: u64) -> Self {
        self.save_interval_secs = secs;
        self
    }

    /// Set the lock wait in milliseconds.
    pub fn with_lock_timeout_ms(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    /// User snapshot path with `~` expanded.
    pub fn resolved_user_graph_path(&self) -> PathBuf {
        let raw = self.user_graph_path.to_string_lossy();
        PathBuf::from(shellexpand::tilde(raw.as_ref()).into_owned())
    }

    /// Snapshot path for the project identified by `project_key`.
    pub fn project_graph_path(&self, project_key: &str) -> PathBuf {
        let root = shellexpand::tilde(project_key).into_owned();
        PathBuf::from(root).join(&self.project_graph_file)
    }

    /// Size at which a compaction pass stops archiving.
    pub fn compaction_target(&self) -> usize {
        (self.max_tokens as f64 * self.compaction_target_ratio).floor() as usize
    }

    pub fn protect_window(&self) -> Duration {
        Duration::days(i64::from(self.protect_days))
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::days(i64::from(self.orphan_grace_days))
    }

    pub fn tombstone_retention(&self) -> Duration {
        Duration::days(i64::from(self.tombstone_retention_days))
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::hours(i64::from(self.session_ttl_hours))
    }

    pub fn save_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.save_interval_secs)
    }

    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock_timeout_ms)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}"))),
    }
}
