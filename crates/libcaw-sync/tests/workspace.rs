//! Workspace pipeline against an in-process local service

#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use libcaw_core::{CawConfig, EditBlock, SessionId};
use libcaw_ipc::mock::MockService;
use libcaw_ipc::{CawClient, ClientConfig, Event, Frame};
use libcaw_sync::{
    Collaborators, Decorator, DiffTarget, FileDecorations, Reaction, RefreshStream, ScmRegistrar,
    SessionStore, SyncError, Workspace,
};
use serde_json::{json, Value};
use tempfile::TempDir;

const FILE: &str = "/repo/src/a.rs";

#[derive(Default)]
struct RecordingDecorator {
    calls: Mutex<Vec<FileDecorations>>,
    clears: Mutex<usize>,
}

impl RecordingDecorator {
    fn last_lines(&self) -> Option<Vec<u32>> {
        self.calls.lock().unwrap().last().map(|d| d.lines.clone())
    }

    fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Decorator for RecordingDecorator {
    fn decorate(&self, decorations: &FileDecorations) {
        self.calls.lock().unwrap().push(decorations.clone());
    }

    fn clear(&self) {
        *self.clears.lock().unwrap() += 1;
    }
}

struct FixedSession;

impl SessionStore for FixedSession {
    fn session_id(&self) -> SessionId {
        SessionId::new("s1")
    }

    fn user(&self) -> Option<String> {
        Some("me".to_string())
    }
}

#[derive(Default)]
struct RecordingScm {
    files: Mutex<Vec<(String, String)>>,
}

impl ScmRegistrar for RecordingScm {
    fn add_file(&self, root: &str, relative: &str) {
        self.files
            .lock()
            .unwrap()
            .push((root.to_string(), relative.to_string()));
    }
}

fn project(lines: Vec<u32>) -> Value {
    json!({
        "name": "repo",
        "root": "/repo",
        "origin": "git@example.com:team/repo.git",
        "branch": "main",
        "branches": ["main", "dev"],
        "cSHA": "base",
        "activePath": "src/a.rs",
        "changes": {
            "src/a.rs": [
                { "peer": "ana", "sha": "c1", "lines": lines },
                { "peer": "me", "sha": "c1", "lines": [99] }
            ],
            "docs/guide.md": [
                { "peer": "bo", "sha": "c2", "lines": [1] }
            ]
        }
    })
}

fn respond(frame: &Frame) -> Vec<Frame> {
    let data = match frame.action.as_str() {
        "repo:get-tmp-dir" => json!({ "tmpDir": "/tmp/caw" }),
        "auth:info" => json!({ "user": { "_id": "me" } }),
        "repo:active-path" => project(vec![3, 10]),
        "repo:cycle-block" => json!({
            "range": { "line": 1, "len": 0, "content": ["// a", "// b"] },
            "replaceLen": 2
        }),
        "repo:diff-branch" => json!({
            "peerFile": "/tmp/caw/dev/src/a.rs",
            "userFile": FILE,
            "title": "a.rs (dev)"
        }),
        "repo:diff-peer" => json!({ "peerFile": "/tmp/caw/ana/src/a.rs", "title": "ana" }),
        "sync:setup" => return Vec::new(),
        _ => return vec![frame.reply_err(json!({ "message": "unsupported" }))],
    };
    vec![frame.reply(data)]
}

struct Harness {
    _dir: TempDir,
    mock: MockService,
    decorator: Arc<RecordingDecorator>,
    scm: Arc<RecordingScm>,
    workspace: Arc<Workspace>,
    fired: Option<RefreshStream>,
}

fn harness() -> Harness {
    harness_with(respond, CawConfig::default())
}

fn harness_with<F>(responder: F, config: CawConfig) -> Harness
where
    F: Fn(&Frame) -> Vec<Frame> + Send + Sync + 'static,
{
    let dir = tempfile::tempdir().unwrap();
    let mut client_config = ClientConfig::new(SessionId::new("s1"), dir.path());
    client_config.use_catalog = false;
    client_config.retry_initial = Duration::from_millis(10);
    let mock = MockService::start(client_config.session_path(), responder).unwrap();
    let client = Arc::new(CawClient::connect(client_config));

    let decorator = Arc::new(RecordingDecorator::default());
    let scm = Arc::new(RecordingScm::default());
    let collaborators = Collaborators {
        decorator: decorator.clone(),
        session: Arc::new(FixedSession),
        scm: scm.clone(),
    };
    let (workspace, fired) = Workspace::new(client, collaborators, &config);

    Harness {
        _dir: dir,
        mock,
        decorator,
        scm,
        workspace: Arc::new(workspace),
        fired: Some(fired),
    }
}

/// Wait until the service has received `count` frames for `action`
async fn wait_for_action(mock: &MockService, action: &str, count: usize) -> Vec<Frame> {
    let frames = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frames: Vec<Frame> = mock
                .received()
                .into_iter()
                .filter(|f| f.action == action)
                .collect();
            if frames.len() >= count {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    frames.unwrap_or_else(|_| panic!("no {} x{} within 5s", action, count))
}

#[tokio::test]
async fn test_refresh_aggregates_and_decorates() {
    let h = harness();
    let project = h.workspace.refresh_active_file(FILE, "fn main() {}").await.unwrap();

    assert_eq!(project.c_sha.as_deref(), Some("base"));
    let set = h.workspace.change_set(FILE).unwrap();
    assert_eq!(set.get("c1"), Some(vec![3, 10]));
    assert_eq!(h.decorator.last_lines(), Some(vec![3, 10]));

    let mut files = h.scm.files.lock().unwrap().clone();
    files.sort();
    assert_eq!(
        files,
        vec![
            ("/repo".to_string(), "docs/guide.md".to_string()),
            ("/repo".to_string(), "src/a.rs".to_string()),
        ]
    );
    assert_eq!(h.workspace.peer_files("/repo"), vec!["docs/guide.md", "src/a.rs"]);

    let request = h
        .mock
        .received()
        .into_iter()
        .find(|f| f.action == "repo:active-path")
        .unwrap();
    assert_eq!(request.data["fpath"], FILE);
    assert_eq!(request.data["cid"], "s1");
}

#[tokio::test]
async fn test_second_refresh_registers_files_once() {
    let h = harness();
    h.workspace.refresh_active_file(FILE, "").await.unwrap();
    h.workspace.refresh_active_file(FILE, "").await.unwrap();
    assert_eq!(h.scm.files.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_local_edits_shift_markers() {
    let h = harness();
    h.workspace.refresh_active_file(FILE, "").await.unwrap();

    // Two lines typed after line 1
    h.workspace.record_local_edits(FILE, &[EditBlock::insert(1, 2)]);
    assert_eq!(h.decorator.last_lines(), Some(vec![5, 12]));

    // Lines 9 to 13 replaced by a single line
    h.workspace.record_local_edits(FILE, &[EditBlock::new(8, 5, 1)]);
    assert_eq!(h.decorator.last_lines(), Some(vec![5, 8]));
}

#[tokio::test]
async fn test_edits_during_refresh_are_replayed() {
    let h = harness();
    h.workspace.refresh_active_file(FILE, "").await.unwrap();
    let decorated = h.decorator.count();

    h.workspace.begin_aggregation(FILE);
    h.workspace.record_local_edits(FILE, &[EditBlock::insert(0, 1)]);
    h.workspace.record_local_edits(FILE, &[EditBlock::insert(0, 1)]);
    assert_eq!(h.decorator.count(), decorated, "deferred edits must not redecorate");

    let fresh = serde_json::from_value(project(vec![5])).unwrap();
    h.workspace.complete_aggregation(FILE, fresh);

    assert!(!h.workspace.is_aggregating(FILE));
    assert_eq!(h.workspace.change_set(FILE).unwrap().get("c1"), Some(vec![7]));
    assert_eq!(h.decorator.last_lines(), Some(vec![7]));
}

#[tokio::test]
async fn test_init_reads_tmp_dir_and_starts_sync() {
    let h = harness();
    h.workspace.init().await.unwrap();
    assert_eq!(h.workspace.tmp_dir().unwrap().to_str(), Some("/tmp/caw"));

    assert!(h.workspace.is_tmp_file("/tmp/caw/ana/src/a.rs"));
    assert!(!h.workspace.set_active_file("/tmp/caw/ana/src/a.rs", ""));
    assert!(h.workspace.set_active_file(FILE, ""));

    let frames = h.mock.wait_for_frames(3).await;
    let setup = frames.iter().find(|f| f.action == "sync:setup").unwrap();
    assert_eq!(setup.data, json!({ "cid": "s1" }));
    assert!(setup.aid.is_none());
}

#[tokio::test]
async fn test_cycle_block_shifts_markers() {
    let h = harness();
    h.workspace.refresh_active_file(FILE, "").await.unwrap();

    let block = h.workspace.cycle_block(FILE, "", 1, 1).await.unwrap().unwrap();
    assert!(block.is_insert());
    assert_eq!(block.content(), ["// a", "// b"]);
    assert_eq!(h.decorator.last_lines(), Some(vec![5, 12]));
}

#[tokio::test]
async fn test_diff_needs_an_active_file() {
    let h = harness();
    assert!(matches!(
        h.workspace.diff_branch("dev").await,
        Err(SyncError::NoActiveFile)
    ));
}

#[tokio::test]
async fn test_branch_and_peer_selection_open_diffs() {
    let h = harness();
    h.workspace.set_active_file(FILE, "");
    h.workspace.refresh_active_file(FILE, "").await.unwrap();

    let reaction = h
        .workspace
        .handle_event(&Event::BranchSelect { branch: "dev".to_string() })
        .await
        .unwrap();
    assert_eq!(
        reaction,
        Reaction::OpenDiff(DiffTarget {
            peer_file: "/tmp/caw/dev/src/a.rs".to_string(),
            user_file: FILE.to_string(),
            title: "a.rs (dev)".to_string(),
        })
    );

    let reaction = h
        .workspace
        .handle_event(&Event::ContribSelect { contrib: json!({ "_id": "ana" }) })
        .await
        .unwrap();
    match reaction {
        Reaction::OpenDiff(target) => assert_eq!(target.user_file, FILE),
        other => panic!("unexpected reaction: {:?}", other),
    }

    let reaction = h.workspace.handle_event(&Event::ContribUnselect).await.unwrap();
    assert_eq!(reaction, Reaction::CloseDiff);
}

#[tokio::test]
async fn test_logout_clears_everything() {
    let h = harness();
    h.workspace.refresh_active_file(FILE, "").await.unwrap();
    h.workspace.handle_event(&Event::AuthLogout).await.unwrap();

    assert!(h.workspace.project().is_none());
    assert!(h.workspace.peer_files("/repo").is_empty());
    assert_eq!(*h.decorator.clears.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_remote_error_ends_aggregation() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ClientConfig::new(SessionId::new("s1"), dir.path());
    config.use_catalog = false;
    let _mock = MockService::start(config.session_path(), |f| vec![f.reply_err(json!("boom"))]).unwrap();
    let client = Arc::new(CawClient::connect(config));
    let (workspace, _fired) = Workspace::new(
        client,
        Collaborators {
            decorator: Arc::new(RecordingDecorator::default()),
            session: Arc::new(FixedSession),
            scm: Arc::new(RecordingScm::default()),
        },
        &CawConfig::default(),
    );

    let err = workspace.refresh_active_file(FILE, "").await.unwrap_err();
    assert!(matches!(err, SyncError::Ipc(ref e) if e.is_remote()));
    assert!(!workspace.is_aggregating(FILE));
    assert!(workspace.project().is_none());
}

#[tokio::test]
async fn test_cycle_block_during_refresh_is_replayed() {
    let h = harness();
    h.workspace.refresh_active_file(FILE, "").await.unwrap();

    h.workspace.begin_aggregation(FILE);
    let block = h.workspace.cycle_block(FILE, "", 1, 1).await.unwrap().unwrap();
    assert_eq!(block.edit_block(), EditBlock::insert(1, 2));
    assert_eq!(h.decorator.last_lines(), Some(vec![3, 10]));

    let fresh = serde_json::from_value(project(vec![3, 10])).unwrap();
    h.workspace.complete_aggregation(FILE, fresh);
    assert_eq!(h.decorator.last_lines(), Some(vec![5, 12]));
}

#[tokio::test]
async fn test_deferred_edits_schedule_a_refresh() {
    let h = harness();
    h.workspace.begin_aggregation(FILE);
    assert!(!h.workspace.scheduler().is_pending(FILE));

    h.workspace.record_local_edits(FILE, &[EditBlock::insert(0, 1)]);
    assert!(h.workspace.scheduler().is_pending(FILE));
}

#[tokio::test]
async fn test_local_edit_drives_a_new_refresh() {
    let config = CawConfig {
        sync_threshold_ms: Some(20),
        ..Default::default()
    };
    let mut h = harness_with(respond, config);
    let fired = h.fired.take().unwrap();
    let driver = {
        let workspace = Arc::clone(&h.workspace);
        tokio::spawn(async move { workspace.drive_refreshes(fired).await })
    };

    assert!(h.workspace.set_active_file(FILE, "v1"));
    let first = wait_for_action(&h.mock, "repo:active-path", 1).await;
    assert_eq!(first[0].data["doc"], "v1");

    h.workspace.update_document(FILE, "v2");
    h.workspace.record_local_edits(FILE, &[EditBlock::insert(1, 2)]);

    let frames = wait_for_action(&h.mock, "repo:active-path", 2).await;
    assert_eq!(frames[1].data["doc"], "v2");
    assert_eq!(frames[1].data["fpath"], FILE);
    driver.abort();
}

#[tokio::test]
async fn test_refresh_event_schedules_active_file() {
    let h = harness();
    let refresh = Event::Refresh {
        data: json!({ "action": "refresh" }),
    };
    h.workspace.handle_event(&refresh).await.unwrap();
    assert!(!h.workspace.scheduler().is_pending(FILE));

    h.workspace.set_active_file(FILE, "");
    let reaction = h.workspace.handle_event(&refresh).await.unwrap();
    assert_eq!(reaction, Reaction::Nothing);
    assert!(h.workspace.scheduler().is_pending(FILE));
}

#[tokio::test]
async fn test_reset_event_reinitializes() {
    let h = harness();
    h.workspace.refresh_active_file(FILE, "").await.unwrap();
    assert!(h.workspace.project().is_some());

    h.workspace.handle_event(&Event::Reset).await.unwrap();

    assert!(h.workspace.project().is_none());
    assert_eq!(*h.decorator.clears.lock().unwrap(), 1);
    assert_eq!(h.workspace.tmp_dir().unwrap().to_str(), Some("/tmp/caw"));
    wait_for_action(&h.mock, "repo:get-tmp-dir", 1).await;
    wait_for_action(&h.mock, "sync:setup", 1).await;
}

#[tokio::test]
async fn test_edits_survive_a_failed_refresh() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let h = harness_with(
        move |frame: &Frame| {
            if frame.action == "repo:active-path" && counter.fetch_add(1, Ordering::SeqCst) > 0 {
                return vec![frame.reply_err(json!({ "message": "repo busy" }))];
            }
            respond(frame)
        },
        CawConfig::default(),
    );
    h.workspace.refresh_active_file(FILE, "").await.unwrap();
    assert_eq!(h.decorator.last_lines(), Some(vec![3, 10]));

    h.workspace.begin_aggregation(FILE);
    h.workspace.record_local_edits(FILE, &[EditBlock::insert(1, 2)]);
    assert_eq!(h.decorator.last_lines(), Some(vec![3, 10]));

    let err = h.workspace.refresh_active_file(FILE, "").await.unwrap_err();
    assert!(matches!(err, SyncError::Ipc(ref e) if e.is_remote()));
    assert!(!h.workspace.is_aggregating(FILE));
    assert_eq!(h.workspace.change_set(FILE).unwrap().get("c1"), Some(vec![5, 12]));
    assert_eq!(h.decorator.last_lines(), Some(vec![5, 12]));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
