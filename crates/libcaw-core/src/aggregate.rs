//! Peer diff aggregation
//!
//! The local service reports changed lines per peer. The editor only cares
//! which lines changed per commit, so reports are folded into a
//! [`ChangeSet`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::project::{ChangeSet, PeerReport};

/// Default cap on distinct commit IDs kept per file
pub const DEFAULT_MAX_COMMITS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Distinct commit IDs kept per file; the oldest-seen are dropped first
    pub max_commits: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_commits: DEFAULT_MAX_COMMITS,
        }
    }
}

/// Merge peer reports into per-commit line sets, skipping `exclude_self`.
///
/// Commit IDs are seen in report order; when more than `max_commits`
/// distinct IDs appear, the earliest ones are dropped.
pub fn merge_peer_changes(
    reports: &[PeerReport],
    exclude_self: &str,
    config: &AggregatorConfig,
) -> ChangeSet {
    let mut set = ChangeSet::new();
    for report in reports.iter().filter(|r| r.peer != exclude_self) {
        set.insert(&report.sha, report.lines.iter().copied());
    }

    let dropped = set.cap(config.max_commits);
    if !dropped.is_empty() {
        debug!(
            dropped = dropped.len(),
            max_commits = config.max_commits,
            "Capped commit IDs in change set"
        );
    }
    set
}

/// Merge freshly downloaded reports into an existing change set, keeping
/// the cap across a long-lived session.
pub fn merge_into(
    existing: &mut ChangeSet,
    reports: &[PeerReport],
    exclude_self: &str,
    config: &AggregatorConfig,
) {
    let fresh = merge_peer_changes(reports, exclude_self, config);
    existing.merge(&fresh);
    existing.cap(config.max_commits);
}
