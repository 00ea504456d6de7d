//! Client for the local service
//!
//! `CawClient` owns the per-session transport, the catalog transport used
//! to announce the session, the correlator and the event multiplexer. A
//! dispatcher task reads inbound frames in arrival order and either
//! completes a pending request or dispatches the frame as an event.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use libcaw_core::{CawConfig, SessionId};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actions::{domain_for, AUTH_DISCONNECT, CLIENT_ID};
use crate::correlator::{CorrelationKey, Correlator};
use crate::error::IpcError;
use crate::events::{Delivery, Event, EventKind, EventMultiplexer};
use crate::frame::Frame;
use crate::transport::{ConnectionState, FrameStream, Transport, TransportConfig};
use crate::WILDCARD_DOMAIN;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const CATALOG_SOCKET: &str = "caw.catalog";

/// Named pipe standing in for the socket `root/name` on Windows: the
/// socket path without its leading separator, separators turned into `-`.
/// `/var/tmp` + `caw.s1` becomes `\\.\pipe\var-tmp-caw.s1`.
pub fn pipe_path(root: &Path, name: &str) -> PathBuf {
    let root = root.to_string_lossy();
    let root = root.trim_start_matches(['/', '\\']).trim_end_matches(['/', '\\']);
    let mut flat: String = root
        .chars()
        .map(|c| if c == '/' || c == '\\' { '-' } else { c })
        .collect();
    if !flat.is_empty() {
        flat.push('-');
    }
    flat.push_str(name);
    PathBuf::from(format!(r"\\.\pipe\{}", flat))
}

/// Connection settings for one editor session
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub session: SessionId,
    pub socket_root: PathBuf,
    pub request_timeout: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub max_retries: Option<u32>,
    /// Announce the session on the catalog socket before connecting
    pub use_catalog: bool,
}

impl ClientConfig {
    pub fn new(session: SessionId, socket_root: impl Into<PathBuf>) -> Self {
        Self::from_config(
            &CawConfig {
                socket_root: Some(socket_root.into()),
                ..Default::default()
            },
            session,
        )
    }

    pub fn from_config(config: &CawConfig, session: SessionId) -> Self {
        Self {
            session,
            socket_root: config.socket_root(),
            request_timeout: config.request_timeout(),
            retry_initial: config.retry_initial(),
            retry_max: config.retry_max(),
            max_retries: config.max_retries,
            use_catalog: true,
        }
    }

    #[cfg(not(windows))]
    pub fn session_path(&self) -> PathBuf {
        self.socket_root.join(self.socket_name())
    }

    #[cfg(windows)]
    pub fn session_path(&self) -> PathBuf {
        pipe_path(&self.socket_root, &self.socket_name())
    }

    #[cfg(not(windows))]
    pub fn catalog_path(&self) -> PathBuf {
        self.socket_root.join(CATALOG_SOCKET)
    }

    #[cfg(windows)]
    pub fn catalog_path(&self) -> PathBuf {
        pipe_path(&self.socket_root, CATALOG_SOCKET)
    }

    fn socket_name(&self) -> String {
        format!("caw.{}", self.session)
    }

    fn transport(&self, path: PathBuf) -> TransportConfig {
        TransportConfig {
            path,
            retry_initial: self.retry_initial,
            retry_max: self.retry_max,
            max_retries: self.max_retries,
        }
    }
}

/// Per-call overrides
#[derive(Debug, Clone, Copy, Default)]
pub struct TransmitOptions {
    pub timeout: Option<Duration>,
}

impl TransmitOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

pub struct CawClient {
    session: SessionId,
    transport: Transport,
    catalog: Option<Arc<Transport>>,
    correlator: Arc<Correlator>,
    events: Arc<EventMultiplexer>,
    request_timeout: Duration,
    dispatcher: JoinHandle<()>,
}

impl std::fmt::Debug for CawClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CawClient")
            .field("session", &self.session)
            .field("state", &self.state())
            .field("pending", &self.correlator.len())
            .finish()
    }
}

impl CawClient {
    /// Start connecting. Requests may be issued right away; they are
    /// written once the socket is up. Must be called inside a tokio runtime.
    pub fn connect(config: ClientConfig) -> Self {
        let catalog = config.use_catalog.then(|| {
            let (catalog, frames) = Transport::connect(config.transport(config.catalog_path()));
            let catalog = Arc::new(catalog);
            let hello = Frame::request(
                WILDCARD_DOMAIN,
                CLIENT_ID,
                Value::String(config.session.to_string()),
                None,
                config.session.as_str(),
            );
            tokio::spawn(announce_session(Arc::clone(&catalog), frames, hello));
            catalog
        });

        let (transport, frames) = Transport::connect(config.transport(config.session_path()));
        let correlator = Correlator::new();
        let events = Arc::new(EventMultiplexer::new(config.session.as_str()));

        let dispatcher = tokio::spawn(dispatch_frames(
            frames,
            config.session.to_string(),
            Arc::clone(&correlator),
            Arc::clone(&events),
        ));

        info!(session = %config.session, path = %transport.path().display(), "Starting local service client");

        Self {
            session: config.session,
            transport,
            catalog,
            correlator,
            events,
            request_timeout: config.request_timeout,
            dispatcher,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Send a request and wait for its response payload
    pub async fn transmit(&self, action: &str, data: Value) -> Result<Value, IpcError> {
        self.transmit_with(action, data, TransmitOptions::default()).await
    }

    pub async fn transmit_with(
        &self,
        action: &str,
        data: Value,
        options: TransmitOptions,
    ) -> Result<Value, IpcError> {
        if self.transport.is_disposed() {
            return Err(IpcError::Disposed);
        }

        let domain = domain_for(action);
        let aid = uuid::Uuid::new_v4().simple().to_string();
        let call = self
            .correlator
            .register(CorrelationKey::new(domain, action, aid.clone()));

        let frame = Frame::request(domain, action, data, Some(aid), self.session.as_str());
        self.transport.send(&frame)?;

        call.wait(options.timeout.unwrap_or(self.request_timeout)).await
    }

    /// Send a request and decode the response payload into `T`
    pub async fn transmit_as<T: DeserializeOwned>(
        &self,
        action: &str,
        data: Value,
    ) -> Result<T, IpcError> {
        let value = self.transmit(action, data).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a request without waiting for an answer. Any responses are
    /// dispatched as events.
    pub fn emit(&self, action: &str, data: Value) -> Result<(), IpcError> {
        let frame = Frame::request(domain_for(action), action, data, None, self.session.as_str());
        self.transport.send(&frame)
    }

    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.on(kind, handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &Arc<EventMultiplexer> {
        &self.events
    }

    pub async fn wait_ready(&self) -> Result<(), IpcError> {
        self.transport.wait_ready().await
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.transport.is_disposed()
    }

    /// Stop both transports and fail every pending request with
    /// `Disposed`
    pub fn dispose(&self) {
        if self.transport.is_disposed() {
            return;
        }
        self.transport.dispose();
        if let Some(catalog) = &self.catalog {
            catalog.dispose();
        }
        let rejected = self.correlator.reject_all();
        info!(session = %self.session, rejected, "Disposed local service client");
    }

    /// Tell the local service this session is going away, then dispose
    pub async fn shutdown(&self) {
        if !self.is_disposed() && self.state() == ConnectionState::Connected {
            let options = TransmitOptions::with_timeout(DISCONNECT_TIMEOUT);
            if let Err(e) = self.transmit_with(AUTH_DISCONNECT, Value::Null, options).await {
                debug!(error = %e, "No answer to disconnect");
            }
        }
        self.dispose();
    }
}

impl Drop for CawClient {
    fn drop(&mut self) {
        self.dispose();
        self.dispatcher.abort();
    }
}

async fn dispatch_frames(
    mut frames: FrameStream,
    session: String,
    correlator: Arc<Correlator>,
    events: Arc<EventMultiplexer>,
) {
    while let Some(frame) = frames.recv().await {
        if Delivery::of(&frame, &session).is_none() {
            debug!(action = %frame.action, caw = %frame.caw, "Ignoring frame for another session");
            continue;
        }
        if correlator.complete(&frame) {
            continue;
        }
        events.dispatch(&frame);
    }
    debug!(session = %session, "Dispatcher stopped");
}

/// Send the session announcement on every (re)connect of the catalog
async fn announce_session(catalog: Arc<Transport>, mut frames: FrameStream, hello: Frame) {
    let mut state = catalog.subscribe_state();
    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::Connected => {
                        debug!(session = %hello.caw, "Announcing session to catalog");
                        if let Err(e) = catalog.send(&hello) {
                            warn!(error = %e, "Failed to announce session");
                            break;
                        }
                    }
                    ConnectionState::Closed => break,
                    _ => {}
                }
            }
            frame = frames.recv() => match frame {
                Some(frame) => debug!(action = %frame.action, "Catalog answered"),
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod path_tests {
    use super::*;

    #[test]
    fn test_default_paths_match_local_service() {
        let config = ClientConfig::from_config(&CawConfig::default(), SessionId::new("s1"));
        assert_eq!(config.socket_root, PathBuf::from("/var/tmp"));
        #[cfg(not(windows))]
        {
            assert_eq!(config.session_path(), PathBuf::from("/var/tmp/caw.s1"));
            assert_eq!(config.catalog_path(), PathBuf::from("/var/tmp/caw.catalog"));
        }
        #[cfg(windows)]
        {
            assert_eq!(config.session_path(), PathBuf::from(r"\\.\pipe\var-tmp-caw.s1"));
            assert_eq!(config.catalog_path(), PathBuf::from(r"\\.\pipe\var-tmp-caw.catalog"));
        }
    }

    #[test]
    fn test_pipe_path_flattens_socket_root() {
        assert_eq!(
            pipe_path(Path::new("/var/tmp"), "caw.s1"),
            PathBuf::from(r"\\.\pipe\var-tmp-caw.s1")
        );
        assert_eq!(
            pipe_path(Path::new("/var/tmp/"), "caw.catalog"),
            PathBuf::from(r"\\.\pipe\var-tmp-caw.catalog")
        );
        assert_eq!(
            pipe_path(Path::new(r"\\run\caw"), "caw.s1"),
            PathBuf::from(r"\\.\pipe\run-caw-caw.s1")
        );
        assert_eq!(pipe_path(Path::new("/"), "caw.s1"), PathBuf::from(r"\\.\pipe\caw.s1"));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::mock::MockService;
    use serde_json::json;
    use std::sync::Mutex;

    fn client_config(dir: &std::path::Path) -> ClientConfig {
        let mut config = ClientConfig::new(SessionId::new("s1"), dir);
        config.use_catalog = false;
        config.retry_initial = Duration::from_millis(10);
        config.retry_max = Duration::from_millis(50);
        config
    }

    #[tokio::test]
    async fn test_transmit_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = client_config(dir.path());
        let _mock = MockService::echo(config.session_path()).unwrap();

        let client = CawClient::connect(config);
        let value = client
            .transmit("repo:active-path", json!({ "fpath": "/a.rs" }))
            .await
            .unwrap();
        assert_eq!(value, json!({ "fpath": "/a.rs" }));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_frame_shape() {
        let dir = tempfile::tempdir().unwrap();
        let config = client_config(dir.path());
        let mock = MockService::echo(config.session_path()).unwrap();

        let client = CawClient::connect(config);
        client.transmit("auth:info", Value::Null).await.unwrap();
        client.transmit("repo:get-tmp-dir", json!("s1")).await.unwrap();

        let frames = mock.received();
        assert_eq!(frames[0].domain, "*");
        assert_eq!(frames[1].domain, "code");
        assert_eq!(frames[1].caw, "s1");
        assert!(frames[0].aid.is_some());
        assert_ne!(frames[0].aid, frames[1].aid);
    }

    #[tokio::test]
    async fn test_typed_response() {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct TmpDir {
            tmp_dir: String,
        }

        let dir = tempfile::tempdir().unwrap();
        let config = client_config(dir.path());
        let _mock = MockService::constant(config.session_path(), json!("{\"tmpDir\":\"/tmp/caw\"}")).unwrap();

        let client = CawClient::connect(config);
        let tmp: TmpDir = client.transmit_as("repo:get-tmp-dir", json!("s1")).await.unwrap();
        assert_eq!(tmp.tmp_dir, "/tmp/caw");
    }

    #[tokio::test]
    async fn test_concurrent_calls_answered_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = client_config(dir.path());
        let held: Mutex<Option<Frame>> = Mutex::new(None);
        let _mock = MockService::start(config.session_path(), move |frame| {
            let mut held = held.lock().unwrap();
            match held.take() {
                None => {
                    *held = Some(frame.clone());
                    Vec::new()
                }
                Some(first) => vec![
                    frame.reply(frame.data.clone()),
                    first.reply(first.data.clone()),
                ],
            }
        })
        .unwrap();

        let client = CawClient::connect(config);
        client.wait_ready().await.unwrap();
        let (a, b) = tokio::join!(
            client.transmit("repo:active-path", json!("a")),
            client.transmit("repo:active-path", json!("b")),
        );
        assert_eq!(a.unwrap(), json!("a"));
        assert_eq!(b.unwrap(), json!("b"));
    }

    #[tokio::test]
    async fn test_timeout_then_late_response() {
        let dir = tempfile::tempdir().unwrap();
        let config = client_config(dir.path());
        let mock = MockService::start(config.session_path(), |_| Vec::new()).unwrap();

        let client = CawClient::connect(config);
        let mut events = client.subscribe();
        let err = client
            .transmit_with(
                "repo:active-path",
                Value::Null,
                TransmitOptions::with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(client.pending_requests(), 0);

        let request = mock.received().remove(0);
        mock.push(request.reply(json!("late")));

        // The late answer surfaces as an unmatched event, not a result
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::Unknown);
    }

    #[tokio::test]
    async fn test_remote_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = client_config(dir.path());
        let _mock = MockService::start(config.session_path(), |frame| {
            vec![frame.reply_err(json!({ "message": "not a repository" }))]
        })
        .unwrap();

        let client = CawClient::connect(config);
        match client.transmit("repo:add", Value::Null).await {
            Err(IpcError::Remote { action, data }) => {
                assert_eq!(action, "repo:add");
                assert_eq!(data["message"], "not a repository");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_survives_late_service_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = client_config(dir.path());
        let path = config.session_path();

        let client = CawClient::connect(config);
        let call = client.transmit("repo:active-path", json!(7));

        let start_later = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            MockService::echo(path).unwrap()
        };
        let (result, _mock) = tokio::join!(call, start_later);
        assert_eq!(result.unwrap(), json!(7));
    }

    #[tokio::test]
    async fn test_reconnect_after_connection_drop() {
        let dir = tempfile::tempdir().unwrap();
        let config = client_config(dir.path());
        let mock = MockService::echo(config.session_path()).unwrap();

        let client = CawClient::connect(config);
        client.transmit("repo:active-path", json!(1)).await.unwrap();

        mock.drop_connections();
        mock.wait_for_connections(2).await;
        let value = client.transmit("repo:active-path", json!(2)).await.unwrap();
        assert_eq!(value, json!(2));
    }

    #[tokio::test]
    async fn test_events_are_filtered_by_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = client_config(dir.path());
        let mock = MockService::echo(config.session_path()).unwrap();

        let client = CawClient::connect(config);
        let mut events = client.subscribe();
        client.wait_ready().await.unwrap();
        mock.wait_for_connections(1).await;

        mock.push(Frame::request("code", "branch:select", json!("dev"), None, "other"));
        mock.push(Frame::request("code", "branch:select", json!("main"), None, "s1"));
        mock.push(Frame::request("code", "auth:logout", Value::Null, None, "*"));

        assert_eq!(
            events.recv().await.unwrap(),
            Event::BranchSelect { branch: "main".to_string() }
        );
        assert_eq!(events.recv().await.unwrap(), Event::AuthLogout);
    }

    #[tokio::test]
    async fn test_dispose_rejects_pending() {
        let dir = tempfile::tempdir().unwrap();
        let config = client_config(dir.path());
        let _mock = MockService::start(config.session_path(), |_| Vec::new()).unwrap();

        let client = CawClient::connect(config);
        let call = client.transmit("repo:active-path", Value::Null);
        let dispose = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.dispose();
        };
        let (result, _) = tokio::join!(call, dispose);
        assert!(matches!(result, Err(IpcError::Disposed)));
        assert!(matches!(
            client.transmit("repo:active-path", Value::Null).await,
            Err(IpcError::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_catalog_announces_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = client_config(dir.path());
        config.use_catalog = true;
        let catalog = MockService::constant(config.catalog_path(), Value::Null).unwrap();

        let _client = CawClient::connect(config);
        let frames = catalog.wait_for_frames(1).await;
        assert_eq!(frames[0].action, "clientId");
        assert_eq!(frames[0].domain, "*");
        assert_eq!(frames[0].data, json!("s1"));
    }
}
