//! Reconnecting transport to the local service
//!
//! One background task owns the socket. It reconnects with capped
//! exponential backoff until disposed, queues outbound frames while the
//! socket is down, and forwards every decoded inbound frame on a channel.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::IpcError;
use crate::frame::{Frame, FrameBuffer};

const READ_CHUNK: usize = 64 * 1024;

/// Inbound frames, in arrival order
pub type FrameStream = mpsc::UnboundedReceiver<Frame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    /// Disposed, or out of retries. Terminal.
    Closed,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Socket (or named pipe) path
    pub path: PathBuf,
    /// First reconnect delay
    pub retry_initial: Duration,
    /// Upper bound for the reconnect delay
    pub retry_max: Duration,
    /// Reconnect attempts before giving up; `None` retries forever
    pub max_retries: Option<u32>,
}

impl TransportConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry_initial: Duration::from_millis(libcaw_core::config::DEFAULT_RETRY_INITIAL_MS),
            retry_max: Duration::from_millis(libcaw_core::config::DEFAULT_RETRY_MAX_MS),
            max_retries: None,
        }
    }
}

/// Handle to a reconnecting connection
#[derive(Debug)]
pub struct Transport {
    path: PathBuf,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl Transport {
    /// Start connecting in the background. Must be called inside a tokio
    /// runtime.
    pub fn connect(config: TransportConfig) -> (Self, FrameStream) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let transport = Self {
            path: config.path.clone(),
            outbound,
            state_rx,
            shutdown_tx,
        };

        tokio::spawn(run(config, outbound_rx, frames_tx, state_tx, shutdown_rx));

        (transport, frames_rx)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a frame. It is written as soon as the socket is up.
    pub fn send(&self, frame: &Frame) -> Result<(), IpcError> {
        if self.is_disposed() {
            return Err(IpcError::Disposed);
        }
        let bytes = frame.encode()?;
        debug!(action = %frame.action, aid = ?frame.aid, "Queueing frame");
        self.outbound.send(bytes).map_err(|_| IpcError::Closed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the socket is connected
    pub async fn wait_ready(&self) -> Result<(), IpcError> {
        let mut rx = self.state_rx.clone();
        loop {
            match *rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(IpcError::Closed),
                _ => {}
            }
            rx.changed().await.map_err(|_| IpcError::Closed)?;
        }
    }

    pub fn is_disposed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Stop the connection for good. Queued frames are discarded.
    pub fn dispose(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Capped exponential backoff
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum Outcome {
    /// Socket closed or failed; reconnect
    Lost(IpcError),
    /// Disposed, or nobody is listening any more
    Stop,
}

async fn run(
    config: TransportConfig,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    frames_tx: mpsc::UnboundedSender<Frame>,
    state_tx: watch::Sender<ConnectionState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(config.retry_initial, config.retry_max);
    let mut retries: u32 = 0;
    let mut unsent: Option<Vec<u8>> = None;

    loop {
        if shutdown_signalled(&shutdown_rx) {
            break;
        }
        state_tx.send_replace(ConnectionState::Connecting);

        match open_stream(&config.path).await {
            Ok(stream) => {
                info!(path = %config.path.display(), "Connected to local service");
                retries = 0;
                backoff.reset();
                state_tx.send_replace(ConnectionState::Connected);

                match serve(stream, &mut outbound_rx, &frames_tx, &mut shutdown_rx, &mut unsent).await {
                    Outcome::Stop => break,
                    Outcome::Lost(e) => {
                        info!(path = %config.path.display(), reason = %e, "Local service connection closed");
                    }
                }
            }
            Err(e) => {
                let e = IpcError::ConnectionFailed(e.to_string());
                warn!(path = %config.path.display(), error = %e, "Failed to connect to local service");
            }
        }

        state_tx.send_replace(ConnectionState::Disconnected);

        if let Some(max) = config.max_retries {
            if retries >= max {
                warn!(
                    path = %config.path.display(),
                    max_retries = max,
                    "Exceeded the maximum reconnect attempts"
                );
                break;
            }
        }
        retries += 1;

        let delay = backoff.next_delay();
        debug!(path = %config.path.display(), delay_ms = delay.as_millis() as u64, retries, "Reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
        }
    }

    state_tx.send_replace(ConnectionState::Closed);
    debug!(path = %config.path.display(), "Transport stopped");
}

async fn serve<S>(
    stream: S,
    outbound_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    frames_tx: &mpsc::UnboundedSender<Frame>,
    shutdown_rx: &mut watch::Receiver<bool>,
    unsent: &mut Option<Vec<u8>>,
) -> Outcome
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    if let Some(bytes) = unsent.take() {
        if let Err(e) = writer.write_all(&bytes).await {
            *unsent = Some(bytes);
            return Outcome::Lost(e.into());
        }
    }

    let mut buffer = FrameBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            _ = wait_for_shutdown(shutdown_rx) => return Outcome::Stop,

            read = reader.read(&mut chunk) => match read {
                Ok(0) => return Outcome::Lost(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(n) => {
                    buffer.push(&chunk[..n]);
                    for result in buffer.drain() {
                        match result {
                            Ok(frame) => {
                                if frames_tx.send(frame).is_err() {
                                    return Outcome::Stop;
                                }
                            }
                            Err(e) => warn!(error = %e, "Dropping frame"),
                        }
                    }
                }
                Err(e) => return Outcome::Lost(e.into()),
            },

            next = outbound_rx.recv() => match next {
                Some(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        *unsent = Some(bytes);
                        return Outcome::Lost(e.into());
                    }
                }
                None => return Outcome::Stop,
            },
        }
    }
}

fn shutdown_signalled(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}

/// Resolves once dispose was called or the handle was dropped
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(unix)]
async fn open_stream(path: &Path) -> io::Result<tokio::net::UnixStream> {
    tokio::net::UnixStream::connect(path).await
}

#[cfg(windows)]
async fn open_stream(
    path: &Path,
) -> io::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(path)
}
