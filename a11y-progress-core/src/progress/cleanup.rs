//! Consumer-driven memory valve for long-lived snapshots
//!
//! Kept apart from the per-event fold: the monitor runs it on a timer, and
//! the reducer never calls it.

use std::time::Duration;

use crate::config::ProgressConfig;

use super::snapshot::ProgressSnapshot;

/// Thresholds past which accumulated history is force-cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPolicy {
    pub max_updates: u64,
    pub max_completed: u64,
    /// How often the monitor checks; None disables the periodic check
    pub interval: Option<Duration>,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self::from(&ProgressConfig::default())
    }
}

impl From<&ProgressConfig> for CleanupPolicy {
    fn from(config: &ProgressConfig) -> Self {
        Self {
            max_updates: config.cleanup_max_updates,
            max_completed: config.cleanup_max_completed,
            interval: (config.cleanup_interval_secs > 0)
                .then(|| Duration::from_secs(config.cleanup_interval_secs)),
        }
    }
}

impl CleanupPolicy {
    pub fn should_force_clear(&self, snapshot: &ProgressSnapshot) -> bool {
        snapshot.updates_since_clear > self.max_updates
            || snapshot.completions_since_clear > self.max_completed
    }

    /// Returns the (possibly cleared) snapshot and whether a clear happened
    pub fn apply(&self, snapshot: ProgressSnapshot) -> (ProgressSnapshot, bool) {
        if self.should_force_clear(&snapshot) {
            tracing::info!(
                updates = snapshot.updates_since_clear,
                completions = snapshot.completions_since_clear,
                "Force-clearing accumulated progress history"
            );
            (snapshot.cleared_history(), true)
        } else {
            (snapshot, false)
        }
    }
}
