//! Per-file refresh throttling
//!
//! Every file has a minimum spacing window. A leading refresh fires right
//! away and opens a window; a trailing refresh fires when the current
//! window closes, opening one first if needed. Requests made while a
//! window is open are coalesced into one refresh at its end, so the last
//! request always fires and refreshes of one file are at least one window
//! apart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Fire now, dropping any refresh waiting on the current window
    Leading,
    /// Fire when the current window closes
    Trailing,
}

#[derive(Debug)]
struct Window {
    generation: u64,
    pending: bool,
}

#[derive(Debug)]
struct Inner {
    window: Duration,
    files: Mutex<HashMap<String, Window>>,
    next_generation: AtomicU64,
    fired: mpsc::UnboundedSender<String>,
}

impl Inner {
    fn files(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn fire(&self, file: &str) {
        debug!(file, "Refresh fired");
        // The receiver going away just means nobody wants refreshes any more
        let _ = self.fired.send(file.to_string());
    }
}

/// Throttles refreshes per file. Fired file keys arrive on the receiver
/// returned by [`SyncScheduler::new`].
#[derive(Debug, Clone)]
pub struct SyncScheduler {
    inner: Arc<Inner>,
}

impl SyncScheduler {
    pub fn new(window: Duration) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (fired, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            window,
            files: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            fired,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Request a refresh of `file`. Must be called inside a tokio runtime.
    pub fn schedule_refresh(&self, file: &str, trigger: Trigger) {
        let mut files = self.inner.files();
        match trigger {
            Trigger::Leading => {
                let generation = self.inner.next_generation();
                files.insert(
                    file.to_string(),
                    Window {
                        generation,
                        pending: false,
                    },
                );
                drop(files);
                self.inner.fire(file);
                spawn_window(&self.inner, file.to_string(), generation);
            }
            Trigger::Trailing => {
                if let Some(window) = files.get_mut(file) {
                    window.pending = true;
                    return;
                }
                let generation = self.inner.next_generation();
                files.insert(
                    file.to_string(),
                    Window {
                        generation,
                        pending: true,
                    },
                );
                drop(files);
                spawn_window(&self.inner, file.to_string(), generation);
            }
        }
    }

    /// Whether a refresh of `file` is waiting for its window to close
    pub fn is_pending(&self, file: &str) -> bool {
        self.inner.files().get(file).is_some_and(|w| w.pending)
    }

    /// Forget `file`; a pending refresh does not fire
    pub fn cancel(&self, file: &str) {
        self.inner.files().remove(file);
    }

    pub fn clear(&self) {
        self.inner.files().clear();
    }
}

fn spawn_window(inner: &Arc<Inner>, file: String, generation: u64) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep(inner.window).await;
        close_window(&inner, file, generation);
    });
}

fn close_window(inner: &Arc<Inner>, file: String, generation: u64) {
    let mut files = inner.files();
    let Some(window) = files.get_mut(&file) else {
        return;
    };
    if window.generation != generation {
        // Superseded by a leading refresh
        return;
    }

    if window.pending {
        let next = inner.next_generation();
        window.generation = next;
        window.pending = false;
        drop(files);
        inner.fire(&file);
        spawn_window(inner, file, next);
    } else {
        files.remove(&file);
    }
}
