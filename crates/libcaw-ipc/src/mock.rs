//! In-process fake of the local service, listening on a Unix socket

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::frame::{Frame, FrameBuffer};

type Responder = Arc<dyn Fn(&Frame) -> Vec<Frame> + Send + Sync>;

#[derive(Clone)]
enum Control {
    Push(Frame),
    Disconnect,
}

/// Fake local service. Every received frame is recorded and passed to the
/// responder, whose frames are written back on the same connection.
pub struct MockService {
    path: PathBuf,
    received: Arc<Mutex<Vec<Frame>>>,
    connections: Arc<AtomicUsize>,
    control: broadcast::Sender<Control>,
    accept_task: JoinHandle<()>,
}

impl MockService {
    /// Bind `path` and start serving. Must be called inside a tokio runtime.
    pub fn start<F>(path: impl Into<PathBuf>, responder: F) -> io::Result<Self>
    where
        F: Fn(&Frame) -> Vec<Frame> + Send + Sync + 'static,
    {
        let path = path.into();
        let listener = UnixListener::bind(&path)?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let (control, _) = broadcast::channel(64);
        let responder: Responder = Arc::new(responder);

        let accept_task = tokio::spawn({
            let received = Arc::clone(&received);
            let connections = Arc::clone(&connections);
            let control = control.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let control = control.subscribe();
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        stream,
                        Arc::clone(&responder),
                        Arc::clone(&received),
                        control,
                    ));
                }
            }
        });

        Ok(Self {
            path,
            received,
            connections,
            control,
            accept_task,
        })
    }

    /// Answer every request with its own data
    pub fn echo(path: impl Into<PathBuf>) -> io::Result<Self> {
        Self::start(path, |frame| vec![frame.reply(frame.data.clone())])
    }

    /// Answer every request with `data`
    pub fn constant(path: impl Into<PathBuf>, data: Value) -> io::Result<Self> {
        Self::start(path, move |frame| vec![frame.reply(data.clone())])
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send a frame to every open connection
    pub fn push(&self, frame: Frame) {
        let _ = self.control.send(Control::Push(frame));
    }

    /// Close every open connection; the listener keeps accepting
    pub fn drop_connections(&self) {
        let _ = self.control.send(Control::Disconnect);
    }

    pub fn received(&self) -> Vec<Frame> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Poll until at least `count` frames were received
    pub async fn wait_for_frames(&self, count: usize) -> Vec<Frame> {
        loop {
            let frames = self.received();
            if frames.len() >= count {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until at least `count` connections were accepted
    pub async fn wait_for_connections(&self, count: usize) {
        while self.connections() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for MockService {
    fn drop(&mut self) {
        self.drop_connections();
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn serve(
    stream: UnixStream,
    responder: Responder,
    received: Arc<Mutex<Vec<Frame>>>,
    mut control: broadcast::Receiver<Control>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buffer = FrameBuffer::new();
    let mut chunk = vec![0u8; 8192];

    loop {
        tokio::select! {
            read = reader.read(&mut chunk) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buffer.push(&chunk[..n]);
                for frame in buffer.drain().into_iter().flatten() {
                    debug!(action = %frame.action, "Mock service received frame");
                    received
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(frame.clone());
                    for reply in responder(&frame) {
                        if write_frame(&mut writer, &reply).await.is_err() {
                            return;
                        }
                    }
                }
            }
            msg = control.recv() => match msg {
                Ok(Control::Push(frame)) => {
                    if write_frame(&mut writer, &frame).await.is_err() {
                        return;
                    }
                }
                Ok(Control::Disconnect) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
}

async fn write_frame(writer: &mut tokio::net::unix::OwnedWriteHalf, frame: &Frame) -> io::Result<()> {
    let bytes = frame
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    writer.write_all(&bytes).await
}
