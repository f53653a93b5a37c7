//! Tiered backup rotation beside a snapshot file.
//!
//! Three FIFO tiers: recent (`.bak.N`), daily (`.bak.daily.N`) and weekly
//! (`.bak.weekly.N`). Each rotation copies the current snapshot into
//! `recent.1`; the slot pushed out of a tier is promoted into the tier above
//! only if that tier's interval has elapsed, otherwise it is dropped.
//! Rotation times live in a `.bak.state` sidecar.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::snapshot::write_atomic;
use crate::error::{Error, Result};

/// One backup tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Recent,
    Daily,
    Weekly,
}

impl Tier {
    /// Tiers in load-fallback order.
    pub const ALL: [Tier; 3] = [Tier::Recent, Tier::Daily, Tier::Weekly];

    pub fn slots(self) -> usize {
        match self {
            Tier::Recent => 3,
            Tier::Daily => 7,
            Tier::Weekly => 4,
        }
    }

    /// Minimum time between two rotations into this tier.
    pub fn interval(self) -> Duration {
        match self {
            Tier::Recent => Duration::hours(1),
            Tier::Daily => Duration::days(1),
            Tier::Weekly => Duration::weeks(1),
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Tier::Recent => "bak",
            Tier::Daily => "bak.daily",
            Tier::Weekly => "bak.weekly",
        }
    }

    fn above(self) -> Option<Tier> {
        match self {
            Tier::Recent => Some(Tier::Daily),
            Tier::Daily => Some(Tier::Weekly),
            Tier::Weekly => None,
        }
    }
}

/// Last rotation time per tier, persisted in the sidecar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RotationState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    recent: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    daily: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    weekly: Option<DateTime<Utc>>,
}

impl RotationState {
    fn last(&self, tier: Tier) -> Option<DateTime<Utc>> {
        match tier {
            Tier::Recent => self.recent,
            Tier::Daily => self.daily,
            Tier::Weekly => self.weekly,
        }
    }

    fn set(&mut self, tier: Tier, at: DateTime<Utc>) {
        match tier {
            Tier::Recent => self.recent = Some(at),
            Tier::Daily => self.daily = Some(at),
            Tier::Weekly => self.weekly = Some(at),
        }
    }

    fn due(&self, tier: Tier, now: DateTime<Utc>) -> bool {
        self.last(tier)
            .map_or(true, |last| now - last >= tier.interval())
    }
}

/// Rotates backups for a single snapshot path.
#[derive(Debug, Clone)]
pub struct BackupRotator {
    target: PathBuf,
}

impl BackupRotator {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
        }
    }

    /// Path of `slot` (1-based) in `tier`.
    pub fn slot_path(&self, tier: Tier, slot: usize) -> PathBuf {
        sibling(&self.target, &format!("{}.{slot}", tier.suffix()))
    }

    pub fn state_path(&self) -> PathBuf {
        sibling(&self.target, "bak.state")
    }

    /// Every backup path, newest first within a tier, tiers from recent to weekly.
    pub fn fallback_paths(&self) -> Vec<PathBuf> {
        Tier::ALL
            .iter()
            .flat_map(|&tier| (1..=tier.slots()).map(move |slot| (tier, slot)))
            .map(|(tier, slot)| self.slot_path(tier, slot))
            .collect()
    }

    /// Copy the current snapshot into the recent tier if an hour has passed.
    ///
    /// Returns whether a rotation happened. A missing target is not an error.
    pub fn rotate(&self, now: DateTime<Utc>) -> Result<bool> {
        if !self.target.exists() {
            return Ok(false);
        }

        let mut state = self.load_state();
        if !state.due(Tier::Recent, now) {
            return Ok(false);
        }

        self.push(Tier::Recent, &self.target, &mut state, now)?;
        self.save_state(&state)?;
        Ok(true)
    }

    /// Insert a copy of `source` at slot 1 of `tier`, shifting the rest down.
    fn push(
        &self,
        tier: Tier,
        source: &Path,
        state: &mut RotationState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let oldest = self.slot_path(tier, tier.slots());
        if oldest.exists() {
            if let Some(next) = tier.above().filter(|&next| state.due(next, now)) {
                self.push(next, &oldest, state, now)?;
            }
        }

        for slot in (1..tier.slots()).rev() {
            let from = self.slot_path(tier, slot);
            if from.exists() {
                let to = self.slot_path(tier, slot + 1);
                fs::rename(&from, &to).map_err(|e| Error::storage_io(&to, e))?;
            }
        }

        let first = self.slot_path(tier, 1);
        fs::copy(source, &first).map_err(|e| Error::storage_io(&first, e))?;
        state.set(tier, now);
        debug!(backup = %first.display(), "rotated backup");
        Ok(())
    }

    fn load_state(&self) -> RotationState {
        let path = self.state_path();
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring unreadable backup state");
                RotationState::default()
            }),
            Err(_) => RotationState::default(),
        }
    }

    fn save_state(&self, state: &RotationState) -> Result<()> {
        let path = self.state_path();
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&path, &bytes)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
