//! WebSocket connection lifecycle.
//!
//! `ConnectionManager` owns every connection it opens. Each connection runs
//! one task that performs the handshake and then forwards inbound frames to
//! the manager's event channel in receipt order. There is no reconnection:
//! a failed or closed connection stays that way until the owner opens a new
//! one.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use inbox_core::{Operation, SyncError, SyncResult};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};

/// Maximum inbound frame size (1MB); larger frames are reported as `Rejected`.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type SharedSink = Arc<Mutex<Option<WsSink>>>;

/// Opaque handle to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// State of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress
    Connecting,
    /// Handshake complete, frames flowing
    Open,
    /// Closed locally or by the server
    Closed,
    /// Transport failure
    Errored,
}

/// Event emitted by a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Handshake completed
    Opened { handle: ConnectionHandle },
    /// Raw inbound frame (text or binary payload)
    Frame {
        handle: ConnectionHandle,
        data: Vec<u8>,
    },
    /// Inbound frame refused for exceeding `MAX_FRAME_SIZE`
    Rejected { handle: ConnectionHandle, len: usize },
    /// Connection closed
    Closed { handle: ConnectionHandle },
    /// Connection failed
    Errored {
        handle: ConnectionHandle,
        error: SyncError,
    },
}

impl ConnectionEvent {
    pub fn handle(&self) -> ConnectionHandle {
        match self {
            ConnectionEvent::Opened { handle }
            | ConnectionEvent::Frame { handle, .. }
            | ConnectionEvent::Rejected { handle, .. }
            | ConnectionEvent::Closed { handle }
            | ConnectionEvent::Errored { handle, .. } => *handle,
        }
    }
}

/// Moves `state` from `from` to `to`; returns false if it was elsewhere.
fn transition(
    state: &watch::Sender<ConnectionState>,
    from: ConnectionState,
    to: ConnectionState,
) -> bool {
    state.send_if_modified(|current| {
        if *current == from {
            *current = to;
            true
        } else {
            false
        }
    })
}

/// A single WebSocket connection.
struct Connection {
    url: String,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Write half, present once the handshake has completed
    write: SharedSink,
    /// Handshake + read task
    task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Spawn the handshake and read loop for `url`.
    fn spawn(
        handle: ConnectionHandle,
        url: String,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state);
        let write: SharedSink = Arc::new(Mutex::new(None));

        let task = tokio::spawn(Self::run(
            handle,
            url.clone(),
            Arc::clone(&state),
            Arc::clone(&write),
            event_tx,
        ));

        Self {
            url,
            state,
            write,
            task: Some(task),
        }
    }

    async fn run(
        handle: ConnectionHandle,
        url: String,
        state: Arc<watch::Sender<ConnectionState>>,
        write: SharedSink,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        let ws_stream = match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                if transition(&state, ConnectionState::Connecting, ConnectionState::Errored) {
                    error!("Handshake with {} failed ({}): {}", url, handle, e);
                    let _ = event_tx.send(ConnectionEvent::Errored {
                        handle,
                        error: SyncError::transport(Operation::Connect, e.to_string()),
                    });
                }
                return;
            }
        };

        let (sink, read) = ws_stream.split();
        *write.lock().await = Some(sink);

        if !transition(&state, ConnectionState::Connecting, ConnectionState::Open) {
            // Closed while the handshake was in flight
            debug!("{} closed during handshake, dropping stream", handle);
            if let Some(mut sink) = write.lock().await.take() {
                let _ = sink.close().await;
            }
            return;
        }

        info!("Connected to {} ({})", url, handle);
        let _ = event_tx.send(ConnectionEvent::Opened { handle });

        Self::read_loop(handle, read, &state, &event_tx).await;

        write.lock().await.take();
    }

    /// Read loop that forwards frames to the event channel.
    async fn read_loop(
        handle: ConnectionHandle,
        mut read: SplitStream<WsStream>,
        state: &watch::Sender<ConnectionState>,
        event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Text(text) => text.into_bytes(),
                        Message::Binary(data) => data,
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame on {}", handle);
                            break;
                        }
                    };

                    if data.len() > MAX_FRAME_SIZE {
                        warn!(
                            "Frame on {} exceeds max size ({} > {}), dropping",
                            handle,
                            data.len(),
                            MAX_FRAME_SIZE
                        );
                        let _ = event_tx.send(ConnectionEvent::Rejected {
                            handle,
                            len: data.len(),
                        });
                        continue;
                    }

                    let _ = event_tx.send(ConnectionEvent::Frame { handle, data });
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("Connection {} stream ended", handle);
                    break;
                }
                Some(Err(e)) => {
                    if transition(state, ConnectionState::Open, ConnectionState::Errored) {
                        error!("WebSocket error on {}: {}", handle, e);
                        let _ = event_tx.send(ConnectionEvent::Errored {
                            handle,
                            error: SyncError::transport(Operation::Receive, e.to_string()),
                        });
                    }
                    return;
                }
            }
        }

        if transition(state, ConnectionState::Open, ConnectionState::Closed) {
            let _ = event_tx.send(ConnectionEvent::Closed { handle });
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Owns one live socket connection per handle.
pub struct ConnectionManager {
    connections: HashMap<ConnectionHandle, Connection>,
    next_id: u64,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create a new connection manager and the receiver for its events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                connections: HashMap::new(),
                next_id: 1,
                event_tx,
            },
            event_rx,
        )
    }

    /// Start connecting to `url`. Returns immediately in `Connecting` state.
    ///
    /// Every call creates a new connection, even for a URL that is already
    /// open. Must be called from within a tokio runtime.
    pub fn open(&mut self, url: &str) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_id);
        self.next_id += 1;

        debug!("Opening {} to {}", handle, url);
        let conn = Connection::spawn(handle, url.to_string(), self.event_tx.clone());
        self.connections.insert(handle, conn);
        handle
    }

    /// Current state, or None for a handle this manager never issued.
    pub fn state(&self, handle: ConnectionHandle) -> Option<ConnectionState> {
        self.connections.get(&handle).map(Connection::state)
    }

    pub fn url(&self, handle: ConnectionHandle) -> Option<&str> {
        self.connections.get(&handle).map(|c| c.url.as_str())
    }

    /// Wait until the handshake settles.
    ///
    /// Returns Ok once `Open`; `NotConnected` if the connection ended up
    /// closed or errored instead.
    pub async fn wait_open(&self, handle: ConnectionHandle) -> SyncResult<()> {
        let not_connected = SyncError::NotConnected {
            connection: handle.id(),
        };
        let mut rx = self
            .connections
            .get(&handle)
            .ok_or_else(|| not_connected.clone())?
            .state
            .subscribe();

        match rx.wait_for(|s| *s != ConnectionState::Connecting).await {
            Ok(state) if *state == ConnectionState::Open => Ok(()),
            _ => Err(not_connected),
        }
    }

    /// Send a JSON payload as a text frame.
    ///
    /// Fails with `NotConnected` unless the connection is open. Nothing is
    /// queued or retried.
    pub async fn send(&self, handle: ConnectionHandle, payload: &Value) -> SyncResult<()> {
        let not_connected = SyncError::NotConnected {
            connection: handle.id(),
        };
        let conn = self
            .connections
            .get(&handle)
            .ok_or_else(|| not_connected.clone())?;

        if conn.state() != ConnectionState::Open {
            debug!("Dropping send on {} ({:?})", handle, conn.state());
            return Err(not_connected);
        }

        let mut write = conn.write.lock().await;
        let Some(sink) = write.as_mut() else {
            return Err(not_connected);
        };

        if let Err(e) = sink.send(Message::Text(payload.to_string())).await {
            warn!("Send on {} failed: {}", handle, e);
            let error = SyncError::transport(Operation::Send, e.to_string());
            if transition(&conn.state, ConnectionState::Open, ConnectionState::Errored) {
                let _ = self.event_tx.send(ConnectionEvent::Errored {
                    handle,
                    error: error.clone(),
                });
            }
            return Err(error);
        }
        Ok(())
    }

    /// Close a connection. Idempotent; cancels a pending handshake.
    pub async fn close(&mut self, handle: ConnectionHandle) {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };

        let previous = conn.state.send_replace(ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return;
        }

        if let Some(task) = conn.task.take() {
            task.abort();
        }

        if let Some(mut sink) = conn.write.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }

        info!("Closed {} ({:?} before close)", handle, previous);
        let _ = self.event_tx.send(ConnectionEvent::Closed { handle });
    }

    /// Close every connection this manager owns.
    pub async fn close_all(&mut self) {
        let handles: Vec<_> = self.connections.keys().copied().collect();
        for handle in handles {
            self.close(handle).await;
        }
    }

    /// Number of connections currently open.
    pub fn open_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.state() == ConnectionState::Open)
            .count()
    }
}
