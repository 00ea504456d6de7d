//! Request/response correlation
//!
//! Each outstanding request is keyed by `(domain, action, aid)`. Responses
//! from older local service versions carry no `aid`; those complete the
//! oldest pending request with the same domain and action.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::IpcError;
use crate::frame::{Flow, Frame};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub domain: String,
    pub action: String,
    pub aid: String,
}

impl CorrelationKey {
    pub fn new(domain: &str, action: &str, aid: impl Into<String>) -> Self {
        Self {
            domain: domain.to_string(),
            action: action.to_string(),
            aid: aid.into(),
        }
    }

    fn matches(&self, frame: &Frame) -> bool {
        self.domain == frame.domain && self.action == frame.action
    }
}

type Completion = oneshot::Sender<Result<Value, IpcError>>;

struct Entry {
    key: CorrelationKey,
    seq: u64,
    tx: Completion,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, Entry>,
    next_seq: u64,
}

/// Table of outstanding requests
#[derive(Default)]
pub struct Correlator {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.len())
            .finish()
    }
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request. The returned handle removes the entry when it
    /// is dropped, whatever the outcome.
    pub fn register(self: &Arc<Self>, key: CorrelationKey) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.pending.insert(
            key.aid.clone(),
            Entry {
                key: key.clone(),
                seq,
                tx,
            },
        );
        PendingCall {
            key,
            rx,
            correlator: Arc::clone(self),
        }
    }

    /// Complete the request this frame answers.
    ///
    /// Returns false when no pending request matches, in which case the
    /// frame is an event or a late response.
    pub fn complete(&self, frame: &Frame) -> bool {
        if frame.flow == Flow::Req {
            return false;
        }

        let entry = {
            let mut inner = self.lock();
            let aid = match &frame.aid {
                Some(aid) => inner
                    .pending
                    .get(aid)
                    .filter(|entry| entry.key.matches(frame))
                    .map(|_| aid.clone()),
                None => inner
                    .pending
                    .values()
                    .filter(|entry| entry.key.matches(frame))
                    .min_by_key(|entry| entry.seq)
                    .map(|entry| entry.key.aid.clone()),
            };
            match aid {
                Some(aid) => inner.pending.remove(&aid),
                None => None,
            }
        };

        let Some(entry) = entry else {
            return false;
        };

        let result = match frame.flow {
            Flow::Err => Err(IpcError::Remote {
                action: frame.action.clone(),
                data: frame.payload(),
            }),
            _ => Ok(frame.payload()),
        };
        debug!(action = %entry.key.action, aid = %entry.key.aid, "Completed request");
        // The caller may have given up already
        let _ = entry.tx.send(result);
        true
    }

    pub fn remove(&self, aid: &str) -> bool {
        self.lock().pending.remove(aid).is_some()
    }

    /// Fail every pending request with `Disposed`
    pub fn reject_all(&self) -> usize {
        let entries: Vec<Entry> = self.lock().pending.drain().map(|(_, e)| e).collect();
        let count = entries.len();
        for entry in entries {
            let _ = entry.tx.send(Err(IpcError::Disposed));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to one outstanding request
#[derive(Debug)]
pub struct PendingCall {
    key: CorrelationKey,
    rx: oneshot::Receiver<Result<Value, IpcError>>,
    correlator: Arc<Correlator>,
}

impl PendingCall {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Wait for the response, at most `timeout`
    pub async fn wait(mut self, timeout: Duration) -> Result<Value, IpcError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(IpcError::Disposed),
            Err(_) => {
                debug!(action = %self.key.action, aid = %self.key.aid, "Request timed out");
                Err(IpcError::Timeout {
                    action: self.key.action.clone(),
                    ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.correlator.remove(&self.key.aid);
    }
}
