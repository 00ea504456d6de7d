use std::sync::{Arc, Mutex, PoisonError};

use libcaw_core::config::default_config_path;
use libcaw_core::{generate_session_id, load_config, CawConfig, CawError, SessionId};
use libcaw_ipc::actions::AUTH_INFO;
use libcaw_ipc::{CawClient, ClientConfig};
use libcaw_sync::{Collaborators, Decorator, FileDecorations, ScmRegistrar, SessionStore};

use crate::cli::Cli;

/// Settings for one invocation: config file plus command-line overrides
pub struct CawContext {
    pub config: CawConfig,
    pub session: SessionId,
}

impl CawContext {
    pub fn resolve(cli: &Cli) -> Result<Self, CawError> {
        let mut config = match cli.config.as_deref() {
            Some(path) => {
                if !path.exists() {
                    return Err(CawError::NotFound(format!(
                        "config file {}",
                        path.display()
                    )));
                }
                load_config(path)?
            }
            None => match default_config_path() {
                Some(path) => load_config(&path)?,
                None => CawConfig::default(),
            },
        };
        if let Some(root) = &cli.socket_root {
            config.socket_root = Some(root.clone());
        }

        let session = match &cli.session {
            Some(id) if id.is_empty() => {
                return Err(CawError::InvalidArgs("session ID must not be empty".to_string()))
            }
            Some(id) => SessionId::new(id.as_str()),
            None => generate_session_id(),
        };

        Ok(Self { config, session })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::from_config(&self.config, self.session.clone())
    }

    /// Connect and wait until the local service accepts the session
    pub async fn connect(&self) -> Result<Arc<CawClient>, CawError> {
        let config = self.client_config();
        let socket = config.session_path();
        let client = Arc::new(CawClient::connect(config));

        match tokio::time::timeout(self.config.request_timeout(), client.wait_ready()).await {
            Ok(ready) => ready?,
            Err(_) => {
                client.dispose();
                return Err(CawError::Ipc(format!(
                    "local service not reachable at {}",
                    socket.display()
                )));
            }
        }
        Ok(client)
    }
}

/// Keeps the latest markers instead of drawing them
#[derive(Default)]
pub struct CapturedDecorations {
    latest: Mutex<Option<FileDecorations>>,
    sink: Mutex<Option<Box<dyn Fn(&FileDecorations) + Send>>>,
}

impl CapturedDecorations {
    pub fn latest(&self) -> Option<FileDecorations> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Call `sink` on every update
    pub fn on_update(&self, sink: impl Fn(&FileDecorations) + Send + 'static) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(sink));
    }
}

impl Decorator for CapturedDecorations {
    fn decorate(&self, decorations: &FileDecorations) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(decorations.clone());
        if let Some(sink) = self.sink.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            sink(decorations);
        }
    }

    fn clear(&self) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Files changed by peers, in the order they were reported
#[derive(Default)]
pub struct CollectedFiles {
    files: Mutex<Vec<String>>,
}

impl CollectedFiles {
    pub fn files(&self) -> Vec<String> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ScmRegistrar for CollectedFiles {
    fn add_file(&self, _root: &str, relative: &str) {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(relative.to_string());
    }
}

/// Session of this invocation. The signed-in user is unknown until the
/// local service says so.
pub struct CliSession {
    session: SessionId,
    user: Mutex<Option<String>>,
}

impl CliSession {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            user: Mutex::new(None),
        }
    }

    pub fn set_user(&self, user: Option<String>) {
        *self.user.lock().unwrap_or_else(PoisonError::into_inner) = user;
    }
}

impl SessionStore for CliSession {
    fn session_id(&self) -> SessionId {
        self.session.clone()
    }

    fn user(&self) -> Option<String> {
        self.user
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct CliCollaborators {
    pub decorations: Arc<CapturedDecorations>,
    pub files: Arc<CollectedFiles>,
    pub session: Arc<CliSession>,
}

impl CliCollaborators {
    pub fn new(session: SessionId) -> Self {
        Self {
            decorations: Arc::new(CapturedDecorations::default()),
            files: Arc::new(CollectedFiles::default()),
            session: Arc::new(CliSession::new(session)),
        }
    }

    /// Ask the local service who is signed in and remember it
    pub async fn load_user(&self, client: &CawClient) -> Result<Option<String>, CawError> {
        let auth = client.transmit(AUTH_INFO, serde_json::Value::Null).await?;
        let user = auth.get("user").and_then(user_id);
        self.session.set_user(user.clone());
        Ok(user)
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            decorator: self.decorations.clone(),
            session: self.session.clone(),
            scm: self.files.clone(),
        }
    }
}

/// User ID from an `auth:info` or `auth:login` payload
pub fn user_id(user: &serde_json::Value) -> Option<String> {
    ["_id", "id", "email"]
        .iter()
        .find_map(|key| user.get(key).and_then(serde_json::Value::as_str))
        .map(str::to_string)
}
