//! Server-pushed events
//!
//! Frames that answer no pending request are decoded into [`Event`] and
//! handed to the handlers registered for their [`EventKind`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::actions::{AUTH_LOGIN, AUTH_LOGOUT, SYNC_SETUP};
use crate::frame::{Flow, Frame};
use crate::BROADCAST_SESSION;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AuthLogin,
    AuthLogout,
    BranchSelect,
    BranchUnselect,
    BranchRefresh,
    ContribSelect,
    ContribUnselect,
    Refresh,
    Reset,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    AuthLogin { user: Value, tokens: Value },
    AuthLogout,
    BranchSelect { branch: String },
    BranchUnselect,
    BranchRefresh { data: Value },
    /// A teammate was picked for a side-by-side diff
    ContribSelect { contrib: Value },
    ContribUnselect,
    /// The local service has fresh peer data
    Refresh { data: Value },
    /// The local service restarted; session state must be rebuilt
    Reset,
    Unknown {
        domain: String,
        action: String,
        data: Value,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::AuthLogin { .. } => EventKind::AuthLogin,
            Event::AuthLogout => EventKind::AuthLogout,
            Event::BranchSelect { .. } => EventKind::BranchSelect,
            Event::BranchUnselect => EventKind::BranchUnselect,
            Event::BranchRefresh { .. } => EventKind::BranchRefresh,
            Event::ContribSelect { .. } => EventKind::ContribSelect,
            Event::ContribUnselect => EventKind::ContribUnselect,
            Event::Refresh { .. } => EventKind::Refresh,
            Event::Reset => EventKind::Reset,
            Event::Unknown { .. } => EventKind::Unknown,
        }
    }

    pub fn from_frame(frame: &Frame) -> Self {
        let data = frame.payload();
        match frame.action.as_str() {
            AUTH_LOGIN => Event::AuthLogin {
                user: data.get("user").cloned().unwrap_or(Value::Null),
                tokens: data.get("tokens").cloned().unwrap_or(Value::Null),
            },
            AUTH_LOGOUT => Event::AuthLogout,
            "branch:select" => match branch_name(&data) {
                Some(branch) => Event::BranchSelect { branch },
                None => unknown(frame, data),
            },
            "branch:unselect" => Event::BranchUnselect,
            "branch:refresh" => Event::BranchRefresh { data },
            "contrib:select" => Event::ContribSelect { contrib: data },
            "contrib:unselect" => Event::ContribUnselect,
            "reset" => Event::Reset,
            SYNC_SETUP if frame.flow == Flow::Res && is_refresh(&data) => Event::Refresh { data },
            "refresh" => Event::Refresh { data },
            _ => unknown(frame, data),
        }
    }
}

/// Branch events carry either the bare name or `{ branch }`
fn branch_name(data: &Value) -> Option<String> {
    match data {
        Value::String(branch) => Some(branch.clone()),
        _ => data.get("branch").and_then(Value::as_str).map(str::to_string),
    }
}

fn is_refresh(data: &Value) -> bool {
    data.get("action").and_then(Value::as_str) == Some("refresh")
}

fn unknown(frame: &Frame, data: Value) -> Event {
    Event::Unknown {
        domain: frame.domain.clone(),
        action: frame.action.clone(),
        data,
    }
}

/// How a frame reached this session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Addressed to every session
    Broadcast,
    /// Addressed to this session only
    Direct,
}

impl Delivery {
    /// `None` when the frame belongs to another session
    pub fn of(frame: &Frame, session: &str) -> Option<Self> {
        if frame.caw.is_empty() || frame.caw == BROADCAST_SESSION {
            Some(Delivery::Broadcast)
        } else if frame.caw == session {
            Some(Delivery::Direct)
        } else {
            None
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Routes events to handlers and to broadcast subscribers
pub struct EventMultiplexer {
    session: String,
    handlers: Mutex<HashMap<EventKind, Vec<Handler>>>,
    tx: broadcast::Sender<Event>,
}

impl std::fmt::Debug for EventMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMultiplexer")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl EventMultiplexer {
    pub fn new(session: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            session: session.into(),
            handlers: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Register a handler. Handlers run on the dispatcher task and must not
    /// block.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Deliver a frame. Returns the event if it was addressed to this
    /// session.
    pub fn dispatch(&self, frame: &Frame) -> Option<Event> {
        let Some(delivery) = Delivery::of(frame, &self.session) else {
            debug!(action = %frame.action, caw = %frame.caw, "Dropping frame for another session");
            return None;
        };

        let event = Event::from_frame(frame);
        let kind = event.kind();
        debug!(action = %frame.action, ?kind, ?delivery, "Dispatching event");

        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(&event);
        }

        // No subscribers is fine
        let _ = self.tx.send(event.clone());
        Some(event)
    }
}
