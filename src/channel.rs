use crate::protocol::{ClientMsg, ConnectionState, DaemonMsg};

use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// How long the receive loop waits after a failed connection attempt.
const RECONNECT_DELAY: Duration = Duration::from_millis(200);

const READ_BUF_SIZE: usize = 4096;

/// Resolve the daemon socket path.
///
/// `$XDG_RUNTIME_DIR/anytalk.sock` when the variable is set and non-empty,
/// then `/run/user/$UID/anytalk.sock`, then `/tmp/anytalk.sock`.
pub fn socket_path() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("anytalk.sock");
        }
    }
    if let Ok(uid) = std::env::var("UID") {
        if !uid.is_empty() {
            return PathBuf::from(format!("/run/user/{uid}/anytalk.sock"));
        }
    }
    PathBuf::from("/tmp/anytalk.sock")
}

/// One live socket connection. Cheap to clone; the generation id tells a
/// teardown whether the slot still holds this connection or a fresher one.
#[derive(Clone)]
struct Conn {
    id: u64,
    stream: Arc<UnixStream>,
}

/// The single slot holding at most one live connection.
struct ConnectionSlot {
    conn: Mutex<Option<Conn>>,
    next_id: AtomicU64,
}

impl ConnectionSlot {
    fn new() -> Self {
        Self {
            conn: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    async fn lock(&self) -> MutexGuard<'_, Option<Conn>> {
        self.conn.lock().await
    }

    fn make_conn(&self, stream: UnixStream) -> Conn {
        Conn {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            stream: Arc::new(stream),
        }
    }

    async fn current(&self) -> Option<Conn> {
        self.conn.lock().await.clone()
    }

    /// Close the connection only if the slot still holds this generation.
    async fn close_if_current(&self, id: u64) {
        let mut guard = self.conn.lock().await;
        if guard.as_ref().is_some_and(|c| c.id == id) {
            *guard = None;
        }
    }

    async fn close(&self) {
        *self.conn.lock().await = None;
    }
}

/// Bidirectional message channel to the daemon.
///
/// Owns one socket connection at a time and a background receive loop that
/// frames newline-delimited JSON and forwards recognized messages over the
/// events channel. The loop reconnects forever until [`MessageChannel::stop`].
pub struct MessageChannel {
    slot: Arc<ConnectionSlot>,
    socket_path: PathBuf,
    events: mpsc::Sender<DaemonMsg>,
    shutdown_tx: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
}

impl MessageChannel {
    pub fn new(socket_path: PathBuf, events: mpsc::Sender<DaemonMsg>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            slot: Arc::new(ConnectionSlot::new()),
            socket_path,
            events,
            shutdown_tx,
            worker: None,
        }
    }

    /// Launch the background receive loop. No-op when already started.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = shutdown_tx;
        self.worker = Some(tokio::spawn(recv_loop(
            self.slot.clone(),
            self.socket_path.clone(),
            self.events.clone(),
            shutdown_rx,
        )));
    }

    /// Stop the receive loop and close any open connection.
    ///
    /// Returns only after the worker task has fully exited. Idempotent, and
    /// safe to call while a `send` is in flight.
    pub async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.shutdown_tx.send(true);
        // Drop the connection out-of-band so a parked read resolves promptly.
        self.slot.close().await;
        let _ = worker.await;
    }

    /// Serialize `msg` to one JSON line and write it to the daemon.
    ///
    /// If no connection is open, makes exactly one bounded connection attempt
    /// first; an unreachable daemon is an error here but not a fatal
    /// condition for the channel. The slot mutex is held for the whole call,
    /// so writes never interleave with each other.
    pub async fn send(&self, msg: &ClientMsg) -> Result<()> {
        let mut line = serde_json::to_string(msg).context("failed to serialize message")?;
        line.push('\n');

        let mut guard = self.slot.lock().await;
        let conn = match guard.as_ref() {
            Some(conn) => conn.clone(),
            None => {
                let stream = UnixStream::connect(&self.socket_path)
                    .await
                    .with_context(|| {
                        format!("daemon not reachable at {:?}", self.socket_path)
                    })?;
                let conn = self.slot.make_conn(stream);
                *guard = Some(conn.clone());
                conn
            }
        };

        tracing::debug!("sending: {}", line.trim_end());
        if let Err(err) = write_all(&conn.stream, line.as_bytes()).await {
            // Still current: the lock was held throughout. The receive loop
            // notices the dead stream and reconnects.
            *guard = None;
            return Err(err).context("write to daemon failed");
        }
        Ok(())
    }
}

/// Write the full buffer, retrying on partial writes.
async fn write_all(stream: &UnixStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Get the current connection, opening one if the slot is empty.
///
/// The connect happens outside the lock; if a concurrent `send` installed a
/// connection in the meantime, the fresh stream is dropped and the existing
/// one wins; the slot never holds more than one.
async fn ensure_connected(slot: &ConnectionSlot, path: &Path) -> Option<Conn> {
    if let Some(conn) = slot.current().await {
        return Some(conn);
    }
    match UnixStream::connect(path).await {
        Ok(stream) => {
            tracing::debug!("connected to {path:?}");
            let mut guard = slot.lock().await;
            if let Some(existing) = guard.as_ref() {
                return Some(existing.clone());
            }
            let conn = slot.make_conn(stream);
            *guard = Some(conn.clone());
            Some(conn)
        }
        Err(err) => {
            tracing::trace!("connect to {path:?} failed: {err}");
            None
        }
    }
}

async fn recv_loop(
    slot: Arc<ConnectionSlot>,
    path: PathBuf,
    events: mpsc::Sender<DaemonMsg>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut acc: Vec<u8> = Vec::new();

    while !*shutdown.borrow() {
        let Some(conn) = ensure_connected(&slot, &path).await else {
            // Daemon not up yet; retry at a fixed cadence.
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender means the channel itself is gone.
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
            continue;
        };

        let keep_going = tokio::select! {
            _ = shutdown.changed() => false,
            ready = conn.stream.readable() => {
                if ready.is_err() {
                    drop_connection(&slot, conn.id, &mut acc, &events, &mut shutdown).await
                } else {
                    let mut buf = [0u8; READ_BUF_SIZE];
                    match conn.stream.try_read(&mut buf) {
                        Ok(0) => {
                            drop_connection(&slot, conn.id, &mut acc, &events, &mut shutdown)
                                .await
                        }
                        Ok(n) => {
                            acc.extend_from_slice(&buf[..n]);
                            dispatch_lines(&mut acc, &events, &mut shutdown).await
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
                        Err(err) => {
                            tracing::debug!("read failed: {err}");
                            drop_connection(&slot, conn.id, &mut acc, &events, &mut shutdown)
                                .await
                        }
                    }
                }
            }
        };
        if !keep_going {
            break;
        }
    }
}

/// Forward one message to the controller.
///
/// The event channel is bounded and its consumer may itself be waiting on
/// this worker to stop, so a blocked send must still observe the shutdown
/// flag. Returns false when the loop should exit: shutdown fired (or its
/// sender is gone) or the consumer hung up.
async fn forward(
    events: &mpsc::Sender<DaemonMsg>,
    msg: DaemonMsg,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        sent = events.send(msg) => sent.is_ok(),
        _ = shutdown.changed() => false,
    }
}

/// Tear down a dead connection and report the loss as a status transition.
/// Returns false when the loop should exit instead of reconnecting.
async fn drop_connection(
    slot: &ConnectionSlot,
    id: u64,
    acc: &mut Vec<u8>,
    events: &mpsc::Sender<DaemonMsg>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    slot.close_if_current(id).await;
    acc.clear();
    forward(
        events,
        DaemonMsg::Status {
            state: ConnectionState::Idle,
        },
        shutdown,
    )
    .await
}

/// Extract complete lines from the accumulation buffer and dispatch each
/// recognized message. Malformed or unrecognized lines are dropped. Returns
/// false when the loop should exit.
async fn dispatch_lines(
    acc: &mut Vec<u8>,
    events: &mpsc::Sender<DaemonMsg>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    while let Some(pos) = acc.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = acc.drain(..=pos).collect();
        let line = &line[..line.len() - 1];
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<DaemonMsg>(line) {
            Ok(DaemonMsg::Other) => {
                tracing::debug!("ignoring unrecognized message");
            }
            Ok(msg) => {
                if !forward(events, msg, shutdown).await {
                    return false;
                }
            }
            Err(err) => {
                tracing::debug!("dropping malformed line: {err}");
            }
        }
    }
    true
}
