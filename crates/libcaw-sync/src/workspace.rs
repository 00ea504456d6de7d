//! Per-file sync pipeline
//!
//! `Workspace` is the context every stage runs against: the client, the
//! editor's collaborators, the active file and the project the local
//! service last reported for it. A refresh fetches the project, folds peer
//! reports into per-file change sets and hands the active file's markers
//! to the decorator. Local edits shift those markers in place; edits made
//! while a refresh is in flight are held back and replayed on the fresh
//! data.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libcaw_core::{
    merge_peer_changes, AggregatorConfig, CawConfig, ChangeSet, DiffBlock, EditBlock, PathTree,
    Project, SessionId,
};
use libcaw_ipc::actions::{
    AUTH_INFO, REPO_ACTIVE_PATH, REPO_CYCLE_BLOCK, REPO_DIFF_BRANCH, REPO_DIFF_PEER,
    REPO_GET_TMP_DIR, SYNC_SETUP,
};
use libcaw_ipc::{CawClient, Event};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::scheduler::{SyncScheduler, Trigger};

/// File keys whose refresh window fired
pub type RefreshStream = mpsc::UnboundedReceiver<String>;

/// Markers for one file, ready to render
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDecorations {
    /// Absolute path of the file
    pub path: String,
    /// Union of all peer-changed lines, 1-indexed
    pub lines: Vec<u32>,
    pub by_commit: BTreeMap<String, Vec<u32>>,
}

/// Renders peer markers in the editor
pub trait Decorator: Send + Sync {
    fn decorate(&self, decorations: &FileDecorations);
    fn clear(&self);
}

/// Who is signed in on this editor
pub trait SessionStore: Send + Sync {
    fn session_id(&self) -> SessionId;
    /// Local user's ID; their own reports are not shown as peer changes
    fn user(&self) -> Option<String>;
}

/// Source control view listing files changed by peers
pub trait ScmRegistrar: Send + Sync {
    fn add_file(&self, root: &str, relative: &str);
}

#[derive(Clone)]
pub struct Collaborators {
    pub decorator: Arc<dyn Decorator>,
    pub session: Arc<dyn SessionStore>,
    pub scm: Arc<dyn ScmRegistrar>,
}

/// Files to open side by side
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffTarget {
    pub peer_file: String,
    #[serde(default)]
    pub user_file: String,
    #[serde(default)]
    pub title: String,
}

/// What the editor should do after an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    Nothing,
    OpenDiff(DiffTarget),
    CloseDiff,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TmpDirInfo {
    tmp_dir: PathBuf,
}

#[derive(Debug, Clone)]
struct ActiveFile {
    path: String,
    doc: String,
}

#[derive(Default)]
struct State {
    tmp_dir: Option<PathBuf>,
    active: Option<ActiveFile>,
    project: Option<Project>,
    /// Files with a refresh in flight
    aggregating: HashSet<String>,
    /// Edits made while a refresh was in flight, oldest first
    deferred: HashMap<String, Vec<EditBlock>>,
    /// Files touched by peers, per project root
    trees: BTreeMap<String, PathTree>,
}

pub struct Workspace {
    client: Arc<CawClient>,
    collaborators: Collaborators,
    aggregator: AggregatorConfig,
    scheduler: SyncScheduler,
    state: Mutex<State>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("client", &self.client)
            .field("aggregator", &self.aggregator)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    /// Create the workspace. Refreshes fired by its scheduler arrive on the
    /// returned stream; pass it to [`Workspace::drive_refreshes`].
    pub fn new(
        client: Arc<CawClient>,
        collaborators: Collaborators,
        config: &CawConfig,
    ) -> (Self, RefreshStream) {
        let (scheduler, fired) = SyncScheduler::new(config.sync_threshold());
        let workspace = Self {
            client,
            collaborators,
            aggregator: config.aggregator(),
            scheduler,
            state: Mutex::new(State::default()),
        };
        (workspace, fired)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cid(&self) -> String {
        self.collaborators.session.session_id().to_string()
    }

    pub fn client(&self) -> &Arc<CawClient> {
        &self.client
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    /// Ask for the temp directory used for peer file copies, then start
    /// syncing if someone is already signed in
    pub async fn init(&self) -> Result<(), SyncError> {
        let value = self.client.transmit(REPO_GET_TMP_DIR, json!(self.cid())).await?;
        let info: TmpDirInfo = serde_json::from_value(value)
            .map_err(|e| SyncError::bad_response(REPO_GET_TMP_DIR, e))?;
        info!(tmp_dir = %info.tmp_dir.display(), "Using temporary folder");
        self.state().tmp_dir = Some(info.tmp_dir);

        let auth = self.client.transmit(AUTH_INFO, Value::Null).await?;
        if auth.get("user").is_some_and(|u| !u.is_null()) {
            self.setup_sync()?;
        }
        Ok(())
    }

    pub fn tmp_dir(&self) -> Option<PathBuf> {
        self.state().tmp_dir.clone()
    }

    /// Whether `path` is a peer copy inside the temp directory
    pub fn is_tmp_file(&self, path: &str) -> bool {
        self.state()
            .tmp_dir
            .as_deref()
            .is_some_and(|tmp| Path::new(path).starts_with(tmp))
    }

    /// Make `path` the active file. Peer copies in the temp directory are
    /// not tracked; returns false for those.
    pub fn set_active_file(&self, path: &str, doc: &str) -> bool {
        if self.is_tmp_file(path) {
            debug!(path, "Ignoring temporary file");
            return false;
        }
        let mut state = self.state();
        let changed = state.active.as_ref().map(|a| a.path.as_str()) != Some(path);
        state.active = Some(ActiveFile {
            path: path.to_string(),
            doc: doc.to_string(),
        });
        drop(state);
        if changed {
            self.scheduler.schedule_refresh(path, Trigger::Leading);
        }
        true
    }

    /// Record the latest text of the active file
    pub fn update_document(&self, path: &str, doc: &str) {
        if let Some(active) = self.state().active.as_mut().filter(|a| a.path == path) {
            active.doc = doc.to_string();
        }
    }

    pub fn active_path(&self) -> Option<String> {
        self.state().active.as_ref().map(|a| a.path.clone())
    }

    pub fn project(&self) -> Option<Project> {
        self.state().project.clone()
    }

    /// Current markers of `path`
    pub fn change_set(&self, path: &str) -> Option<ChangeSet> {
        let state = self.state();
        let project = state.project.as_ref()?;
        let rel = project.relative_path(path)?;
        project.change_set(&rel).cloned()
    }

    /// Files touched by peers under `root`, sorted
    pub fn peer_files(&self, root: &str) -> Vec<String> {
        self.state()
            .trees
            .get(root)
            .map(PathTree::files)
            .unwrap_or_default()
    }

    /// Fetch the project for `path` and refresh its markers
    pub async fn refresh_active_file(&self, path: &str, doc: &str) -> Result<Project, SyncError> {
        if self.is_tmp_file(path) {
            return Err(SyncError::NoActiveFile);
        }

        self.begin_aggregation(path);
        let data = json!({ "fpath": path, "doc": doc, "cid": self.cid() });
        let response = self.client.transmit(REPO_ACTIVE_PATH, data).await;

        let project = match response.and_then(|v| Ok(serde_json::from_value::<Project>(v)?)) {
            Ok(project) => project,
            Err(e) => {
                self.abort_aggregation(path);
                return Err(e.into());
            }
        };
        Ok(self.complete_aggregation(path, project))
    }

    /// Mark `path` as having a refresh in flight. Edits recorded until
    /// completion are deferred.
    pub fn begin_aggregation(&self, path: &str) {
        self.state().aggregating.insert(path.to_string());
    }

    pub fn is_aggregating(&self, path: &str) -> bool {
        self.state().aggregating.contains(path)
    }

    /// Fold `project`'s peer reports into change sets, replay edits
    /// deferred during the refresh, and notify collaborators
    pub fn complete_aggregation(&self, path: &str, mut project: Project) -> Project {
        let exclude_self = self.collaborators.session.user().unwrap_or_default();

        let merged: Vec<(String, ChangeSet)> = project
            .changes
            .iter()
            .map(|(rel, reports)| {
                let set = merge_peer_changes(reports, &exclude_self, &self.aggregator);
                (rel.clone(), set)
            })
            .collect();
        for (rel, set) in merged {
            project.set_change_set(&rel, set);
        }

        let mut state = self.state();
        state.aggregating.remove(path);
        let deferred = state.deferred.remove(path).unwrap_or_default();
        if let Some(rel) = project.relative_path(path) {
            if !deferred.is_empty() {
                debug!(path, edits = deferred.len(), "Replaying deferred edits");
                project.change_set_mut(&rel).apply_edits(&deferred);
            }
        }

        let tree = state.trees.entry(project.root.clone()).or_default();
        let mut added = Vec::new();
        for rel in project.files() {
            if tree.insert(rel) {
                added.push(rel.to_string());
            }
        }
        state.project = Some(project.clone());
        drop(state);

        for rel in &added {
            self.collaborators.scm.add_file(&project.root, rel);
        }
        self.decorate(&project, path);

        info!(
            path,
            root = %project.root,
            files = project.changes.len(),
            "Refreshed peer changes"
        );
        project
    }

    /// Give up on a refresh; deferred edits apply to the markers we have
    fn abort_aggregation(&self, path: &str) {
        let mut state = self.state();
        state.aggregating.remove(path);
        let deferred = state.deferred.remove(path).unwrap_or_default();
        drop(state);
        if !deferred.is_empty() {
            self.shift_markers(path, &deferred);
        }
    }

    /// Shift markers of `path` across local edits and schedule a refresh.
    /// While a refresh is in flight the edits are held back instead, and
    /// replayed once it completes.
    pub fn record_local_edits(&self, path: &str, edits: &[EditBlock]) {
        if edits.is_empty() {
            return;
        }
        self.shift_or_defer(path, edits);
        self.scheduler.schedule_refresh(path, Trigger::Trailing);
    }

    fn shift_or_defer(&self, path: &str, edits: &[EditBlock]) {
        {
            let mut state = self.state();
            if state.aggregating.contains(path) {
                state
                    .deferred
                    .entry(path.to_string())
                    .or_default()
                    .extend_from_slice(edits);
                debug!(path, edits = edits.len(), "Deferring edits until refresh completes");
                return;
            }
        }
        self.shift_markers(path, edits);
    }

    fn shift_markers(&self, path: &str, edits: &[EditBlock]) {
        let mut state = self.state();
        let Some(project) = state.project.as_mut() else {
            return;
        };
        let Some(rel) = project.relative_path(path) else {
            return;
        };
        let Some(set) = project.change_sets.get_mut(&rel) else {
            return;
        };
        set.apply_edits(edits);
        let project = project.clone();
        drop(state);
        self.decorate(&project, path);
    }

    fn decorate(&self, project: &Project, path: &str) {
        let Some(rel) = project.relative_path(path) else {
            return;
        };
        let set = project.change_set(&rel).cloned().unwrap_or_default();
        self.collaborators.decorator.decorate(&FileDecorations {
            path: path.to_string(),
            lines: set.all_lines(),
            by_commit: set.to_map(),
        });
    }

    /// Ask for the next peer variant of the block at `line`. The markers
    /// are shifted for the returned block, or the shift waits for a refresh
    /// in flight. The caller applies the block to the document and must not
    /// report that change as a local edit.
    pub async fn cycle_block(
        &self,
        path: &str,
        doc: &str,
        line: u32,
        direction: i32,
    ) -> Result<Option<DiffBlock>, SyncError> {
        let origin = self.origin();
        let data = json!({
            "cid": self.cid(),
            "origin": origin,
            "fpath": path,
            "doc": doc,
            "line": line,
            "direction": direction,
        });
        let value = self.client.transmit(REPO_CYCLE_BLOCK, data).await?;
        if value.get("range").map_or(true, Value::is_null) {
            return Ok(None);
        }
        let block: DiffBlock = serde_json::from_value(value)
            .map_err(|e| SyncError::bad_response(REPO_CYCLE_BLOCK, e))?;
        self.shift_or_defer(path, &[block.edit_block()]);
        Ok(Some(block))
    }

    /// Diff the active file against `branch`
    pub async fn diff_branch(&self, branch: &str) -> Result<DiffTarget, SyncError> {
        let fpath = self.active_path().ok_or(SyncError::NoActiveFile)?;
        let data = json!({ "origin": self.origin(), "branch": branch, "fpath": fpath });
        let value = self.client.transmit(REPO_DIFF_BRANCH, data).await?;
        let target: DiffTarget = serde_json::from_value(value)
            .map_err(|e| SyncError::bad_response(REPO_DIFF_BRANCH, e))?;
        Ok(target)
    }

    /// Diff the active file against a peer's version
    pub async fn diff_peer(&self, peer: Value) -> Result<DiffTarget, SyncError> {
        let fpath = self.active_path().ok_or(SyncError::NoActiveFile)?;
        let data = json!({
            "origin": self.origin(),
            "fpath": fpath,
            "cid": self.cid(),
            "contrib": peer,
        });
        let value = self.client.transmit(REPO_DIFF_PEER, data).await?;
        let mut target: DiffTarget = serde_json::from_value(value)
            .map_err(|e| SyncError::bad_response(REPO_DIFF_PEER, e))?;
        if target.user_file.is_empty() {
            target.user_file = fpath;
        }
        Ok(target)
    }

    fn origin(&self) -> String {
        self.state()
            .project
            .as_ref()
            .map(|p| p.origin.clone())
            .unwrap_or_default()
    }

    /// Subscribe to refresh pushes. Answers to this request stream back as
    /// refresh events, so it is sent without waiting for a response.
    pub fn setup_sync(&self) -> Result<(), SyncError> {
        self.client.emit(SYNC_SETUP, json!({ "cid": self.cid() }))?;
        debug!("Requested sync updates");
        Ok(())
    }

    /// Drop everything learned from the local service
    pub fn clear(&self) {
        let mut state = self.state();
        state.project = None;
        state.aggregating.clear();
        state.deferred.clear();
        state.trees.clear();
        drop(state);
        self.scheduler.clear();
        self.collaborators.decorator.clear();
    }

    pub async fn handle_event(&self, event: &Event) -> Result<Reaction, SyncError> {
        match event {
            Event::Refresh { .. } => {
                if let Some(path) = self.active_path() {
                    self.scheduler.schedule_refresh(&path, Trigger::Trailing);
                }
                Ok(Reaction::Nothing)
            }
            Event::AuthLogin { user, .. } => {
                if user.is_null() {
                    return Ok(Reaction::Nothing);
                }
                self.setup_sync()?;
                if let Some(path) = self.active_path() {
                    self.scheduler.schedule_refresh(&path, Trigger::Leading);
                }
                Ok(Reaction::Nothing)
            }
            Event::AuthLogout => {
                self.clear();
                Ok(Reaction::Nothing)
            }
            Event::BranchSelect { branch } => {
                if self.active_path().is_none() {
                    return Ok(Reaction::Nothing);
                }
                Ok(Reaction::OpenDiff(self.diff_branch(branch).await?))
            }
            Event::ContribSelect { contrib } => {
                if self.active_path().is_none() {
                    return Ok(Reaction::Nothing);
                }
                Ok(Reaction::OpenDiff(self.diff_peer(contrib.clone()).await?))
            }
            Event::BranchUnselect | Event::ContribUnselect => Ok(Reaction::CloseDiff),
            Event::BranchRefresh { .. } => {
                debug!("Branch list changed");
                Ok(Reaction::Nothing)
            }
            Event::Reset => {
                info!("Local service restarted, reinitializing");
                self.clear();
                self.init().await?;
                if let Some(path) = self.active_path() {
                    self.scheduler.schedule_refresh(&path, Trigger::Leading);
                }
                Ok(Reaction::Nothing)
            }
            Event::Unknown { action, .. } => {
                debug!(action = %action, "Ignoring unknown event");
                Ok(Reaction::Nothing)
            }
        }
    }

    /// Refresh the active file each time the scheduler fires for it.
    /// Returns when the stream ends.
    pub async fn drive_refreshes(&self, mut fired: RefreshStream) {
        while let Some(path) = fired.recv().await {
            let active = self.state().active.clone();
            let Some(active) = active.filter(|a| a.path == path) else {
                debug!(path = %path, "Skipping refresh of inactive file");
                continue;
            };
            if let Err(e) = self.refresh_active_file(&active.path, &active.doc).await {
                warn!(path = %path, error = %e, "Refresh failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_target_wire_names() {
        let target: DiffTarget = serde_json::from_value(json!({
            "peerFile": "/tmp/caw/a.rs",
            "userFile": "/repo/a.rs",
            "title": "a.rs ↔ dev"
        }))
        .unwrap();
        assert_eq!(target.peer_file, "/tmp/caw/a.rs");
        assert_eq!(target.user_file, "/repo/a.rs");

        let partial: DiffTarget = serde_json::from_value(json!({ "peerFile": "/tmp/x" })).unwrap();
        assert!(partial.user_file.is_empty());
    }
}
