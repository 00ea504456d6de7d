use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::edit::EditBlock;
use crate::shift::shift_lines;

/// One peer's changed lines for one file, against one commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerReport {
    /// Peer (user) ID
    #[serde(alias = "peerId", alias = "user")]
    pub peer: String,
    /// Commit the lines were computed against
    #[serde(alias = "commitId", alias = "s")]
    pub sha: String,
    /// 1-indexed changed line numbers
    #[serde(default, alias = "l")]
    pub lines: Vec<u32>,
}

impl PeerReport {
    pub fn new(peer: impl Into<String>, sha: impl Into<String>, lines: Vec<u32>) -> Self {
        Self {
            peer: peer.into(),
            sha: sha.into(),
            lines,
        }
    }
}

/// Changed line numbers per commit ID, for a single file.
///
/// Lines are always >= 1, deduplicated and ascending. Commit IDs remember
/// the order in which they were first seen so capping is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, Vec<u32>>",
    into = "BTreeMap<String, Vec<u32>>"
)]
pub struct ChangeSet {
    lines: BTreeMap<String, BTreeSet<u32>>,
    seen: Vec<String>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add lines for a commit. Line 0 is not a valid line and is ignored.
    pub fn insert(&mut self, sha: &str, lines: impl IntoIterator<Item = u32>) {
        if !self.lines.contains_key(sha) {
            self.seen.push(sha.to_string());
        }
        let entry = self.lines.entry(sha.to_string()).or_default();
        entry.extend(lines.into_iter().filter(|&l| l >= 1));
    }

    /// Replace the lines stored for a commit, keeping its seen position
    pub fn replace(&mut self, sha: &str, lines: impl IntoIterator<Item = u32>) {
        if let Some(entry) = self.lines.get_mut(sha) {
            entry.clear();
        }
        self.insert(sha, lines);
    }

    pub fn remove(&mut self, sha: &str) -> Option<Vec<u32>> {
        let removed = self.lines.remove(sha)?;
        self.seen.retain(|s| s != sha);
        Some(removed.into_iter().collect())
    }

    /// Lines for a commit, ascending
    pub fn get(&self, sha: &str) -> Option<Vec<u32>> {
        self.lines.get(sha).map(|l| l.iter().copied().collect())
    }

    /// Commit IDs in first-seen order
    pub fn commits(&self) -> impl Iterator<Item = &str> {
        self.seen.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Union of the lines across all commits
    pub fn all_lines(&self) -> Vec<u32> {
        let union: BTreeSet<u32> = self.lines.values().flatten().copied().collect();
        union.into_iter().collect()
    }

    /// Drop the oldest-seen commits until at most `max` remain.
    /// Returns the dropped commit IDs, oldest first.
    pub fn cap(&mut self, max: usize) -> Vec<String> {
        let excess = self.seen.len().saturating_sub(max);
        let dropped: Vec<String> = self.seen.drain(..excess).collect();
        for sha in &dropped {
            self.lines.remove(sha);
        }
        dropped
    }

    /// Merge another change set into this one. Commits new to `self` are
    /// seen after the existing ones.
    pub fn merge(&mut self, other: &ChangeSet) {
        for sha in other.commits() {
            if let Some(lines) = other.lines.get(sha) {
                self.insert(sha, lines.iter().copied());
            }
        }
    }

    /// Reposition every commit's markers across a sequence of edits
    pub fn apply_edits(&mut self, edits: &[EditBlock]) {
        if edits.is_empty() {
            return;
        }
        for lines in self.lines.values_mut() {
            let current: Vec<u32> = lines.iter().copied().collect();
            *lines = shift_lines(&current, edits).into_iter().collect();
        }
    }

    pub fn to_map(&self) -> BTreeMap<String, Vec<u32>> {
        self.lines
            .iter()
            .map(|(sha, lines)| (sha.clone(), lines.iter().copied().collect()))
            .collect()
    }
}

impl From<BTreeMap<String, Vec<u32>>> for ChangeSet {
    fn from(map: BTreeMap<String, Vec<u32>>) -> Self {
        let mut set = ChangeSet::new();
        for (sha, lines) in map {
            set.insert(&sha, lines);
        }
        set
    }
}

impl From<ChangeSet> for BTreeMap<String, Vec<u32>> {
    fn from(set: ChangeSet) -> Self {
        set.to_map()
    }
}

/// A repository as reported by the local service for the active file.
///
/// `changes` holds the raw peer reports per relative path; `change_sets`
/// holds the aggregated markers the editor shows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub name: String,
    pub root: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    /// Common ancestor commit shared with peers
    #[serde(rename = "cSHA", default, skip_serializing_if = "Option::is_none")]
    pub c_sha: Option<String>,
    #[serde(rename = "activePath", default, skip_serializing_if = "Option::is_none")]
    pub active_path: Option<String>,
    #[serde(default)]
    pub changes: BTreeMap<String, Vec<PeerReport>>,
    #[serde(skip)]
    pub change_sets: BTreeMap<String, ChangeSet>,
}

impl Project {
    /// Path of `path` relative to the project root, if it lies inside it
    pub fn relative_path(&self, path: &str) -> Option<String> {
        let rel = Path::new(path).strip_prefix(&self.root).ok()?;
        Some(rel.to_string_lossy().into_owned())
    }

    pub fn change_set(&self, rel_path: &str) -> Option<&ChangeSet> {
        self.change_sets.get(rel_path)
    }

    pub fn change_set_mut(&mut self, rel_path: &str) -> &mut ChangeSet {
        self.change_sets.entry(rel_path.to_string()).or_default()
    }

    pub fn set_change_set(&mut self, rel_path: &str, set: ChangeSet) {
        self.change_sets.insert(rel_path.to_string(), set);
    }

    /// Relative paths with peer reports or markers
    pub fn files(&self) -> BTreeSet<&str> {
        self.changes
            .keys()
            .chain(self.change_sets.keys())
            .map(String::as_str)
            .collect()
    }
}
