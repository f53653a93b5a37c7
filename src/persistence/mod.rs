//! Snapshot files for graphs.
//!
//! Each graph persists to one JSON snapshot with tiered backups beside it.
//! Writes go through a temp file and a rename, so the snapshot on disk is
//! always a complete old or complete new version. Loading walks the primary
//! file and then every backup, newest first, until one verifies.

mod backup;
mod snapshot;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

pub use backup::{BackupRotator, Tier};
pub use snapshot::{
    commit_temp, decode, encode, read, temp_path, write_atomic, write_temp, Snapshot,
    SNAPSHOT_FORMAT,
};

use crate::error::{Error, Result};
use crate::graph::GraphData;

/// A file that failed verification during load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// How a graph was restored at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    /// File the graph was restored from; `None` means it started empty.
    pub loaded_from: Option<PathBuf>,
    pub failures: Vec<LoadFailure>,
}

impl LoadReport {
    /// Loaded from a backup instead of the primary snapshot.
    pub fn used_fallback(&self) -> bool {
        self.loaded_from.is_some() && !self.failures.is_empty()
    }

    /// Files existed but none could be used, so the graph started empty.
    pub fn lost_data(&self) -> bool {
        self.loaded_from.is_none() && !self.failures.is_empty()
    }
}

/// Snapshot path plus its backups.
#[derive(Debug, Clone)]
pub struct GraphFile {
    path: PathBuf,
    backups: BackupRotator,
}

impl GraphFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            backups: BackupRotator::new(&path),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backups(&self) -> &BackupRotator {
        &self.backups
    }

    /// Restore the newest snapshot that verifies.
    ///
    /// Never fails: corrupt files are recorded in the report and skipped.
    pub fn load(&self) -> (Option<Snapshot>, LoadReport) {
        let mut report = LoadReport::default();
        let candidates = std::iter::once(self.path.clone()).chain(self.backups.fallback_paths());

        for candidate in candidates {
            if !candidate.exists() {
                continue;
            }
            match read(&candidate) {
                Ok(snapshot) => {
                    report.loaded_from = Some(candidate.clone());
                    if report.used_fallback() {
                        warn!(
                            path = %candidate.display(),
                            skipped = report.failures.len(),
                            "loaded graph from backup"
                        );
                    } else {
                        info!(
                            path = %candidate.display(),
                            nodes = snapshot.data.nodes.len(),
                            edges = snapshot.data.edges.len(),
                            "loaded graph"
                        );
                    }
                    return (Some(snapshot), report);
                }
                Err(e) => {
                    warn!(path = %candidate.display(), error = %e, "skipping unusable snapshot");
                    report.failures.push(LoadFailure {
                        path: candidate,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if report.failures.is_empty() {
            info!(path = %self.path.display(), "no snapshot found, starting empty");
        } else {
            error!(
                path = %self.path.display(),
                failures = report.failures.len(),
                "no usable snapshot or backup, starting empty"
            );
        }
        (None, report)
    }

    /// Persist `data`, rotating backups of the previous snapshot first.
    ///
    /// A failed rotation is logged and does not block the write.
    pub fn save(&self, data: &GraphData, now: DateTime<Utc>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| Error::storage_io(dir, e))?;
        }

        let bytes = encode(data, now)?;
        let tmp = write_temp(&self.path, &bytes)?;

        if let Err(e) = self.backups.rotate(now) {
            warn!(path = %self.path.display(), error = %e, "backup rotation failed");
        }

        commit_temp(&tmp, &self.path).inspect_err(|_| {
            let _ = fs::remove_file(&tmp);
        })
    }
}
