//! One synchronized view of a remote collection.
//!
//! `SyncSession` wires the pieces together: identity gates startup, the push
//! socket feeds the dispatcher, and a single owned poll timer reconciles the
//! store against the server. `shutdown` stops all of it and only returns once
//! no task can touch the store anymore.

use inbox_core::{
    AuthState, CollectionApi, CredentialSource, DispatchEvent, Identity, ItemId,
    MessageDispatcher, PollingSync, StoreView, Subscription, SyncError, SyncResult, SyncStore,
    TickReport,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{
    ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState, MAX_FRAME_SIZE,
};

/// Event published to the session owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Outcome of one poll tick.
    Tick(SyncResult<TickReport>),
    /// The poll timer stopped on its own (credential no longer valid).
    PollingStopped,
    /// Socket lifecycle change (frames go to the dispatcher instead).
    Connection(ConnectionEvent),
}

/// Owned handle to the running poll timer.
struct PollTimer {
    task: JoinHandle<()>,
}

impl PollTimer {
    fn start(
        poller: Arc<PollingSync>,
        period: Duration,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            task: tokio::spawn(poll_loop(poller, period, events)),
        }
    }

    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Abort and wait until the task has been dropped.
    async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn poll_loop(
    poller: Arc<PollingSync>,
    period: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        let outcome = poller.tick().await;
        let gated = matches!(outcome, Err(SyncError::Unauthenticated));

        match &outcome {
            Ok(TickReport::Reconciled { fetched, kept }) => {
                debug!("Poll tick kept {} of {} item(s)", kept, fetched)
            }
            Ok(TickReport::Skipped) => debug!("Poll tick skipped"),
            Err(e) => warn!("Poll tick failed: {}", e),
        }
        let _ = events.send(SessionEvent::Tick(outcome));

        if gated {
            info!("Credential no longer valid, stopping poll timer");
            let _ = events.send(SessionEvent::PollingStopped);
            break;
        }
    }
}

/// Feeds socket frames to the dispatcher in arrival order.
async fn pump_frames(
    mut conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    dispatcher: Arc<MessageDispatcher>,
    poller: Arc<PollingSync>,
    push_preview: bool,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(event) = conn_rx.recv().await {
        match event {
            ConnectionEvent::Frame { data, .. } => {
                // Parse errors are reported to dispatcher subscribers
                let Ok(message) = dispatcher.on_frame(&data) else {
                    continue;
                };
                if push_preview {
                    if let Some(item) = message.as_item() {
                        poller.apply_push_preview(item);
                    }
                }
            }
            ConnectionEvent::Rejected { len, .. } => {
                dispatcher.on_rejected(
                    len,
                    format!("frame exceeds {} byte limit", MAX_FRAME_SIZE),
                );
            }
            other => {
                let _ = events.send(SessionEvent::Connection(other));
            }
        }
    }
}

/// A synchronized session over one collection.
pub struct SyncSession {
    config: ClientConfig,
    store: Arc<SyncStore>,
    dispatcher: Arc<MessageDispatcher>,
    poller: Arc<PollingSync>,
    connections: ConnectionManager,
    socket: Option<ConnectionHandle>,
    timer: Option<PollTimer>,
    pump: Option<JoinHandle<()>>,
    conn_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SyncSession {
    /// Create a session and the receiver for its events. Nothing runs until
    /// `start`.
    pub fn new(
        config: ClientConfig,
        collection: Arc<dyn CollectionApi>,
        credentials: Arc<dyn CredentialSource>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let store = Arc::new(SyncStore::new());
        let poller = PollingSync::new(collection, credentials, Arc::clone(&store))
            .with_query(config.list_query())
            .with_visibility(config.visibility);
        let dispatcher = MessageDispatcher::with_retention(config.push_log_retain);
        let (connections, conn_rx) = ConnectionManager::new();
        let (events, events_rx) = mpsc::unbounded_channel();

        (
            Self {
                config,
                store,
                dispatcher: Arc::new(dispatcher),
                poller: Arc::new(poller),
                connections,
                socket: None,
                timer: None,
                pump: None,
                conn_rx: Some(conn_rx),
                events,
            },
            events_rx,
        )
    }

    /// Read-only view of the synchronized collection.
    pub fn store(&self) -> StoreView {
        StoreView::new(Arc::clone(&self.store))
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Subscribe to push messages and parse errors.
    pub fn subscribe_push(
        &self,
        callback: impl Fn(&DispatchEvent) + Send + Sync + 'static,
    ) -> Subscription<DispatchEvent> {
        self.dispatcher.subscribe(callback)
    }

    pub fn identity(&self) -> AuthState {
        self.poller.identity()
    }

    pub fn is_polling(&self) -> bool {
        self.timer.as_ref().is_some_and(PollTimer::is_running)
    }

    pub fn socket(&self) -> Option<ConnectionHandle> {
        self.socket
    }

    pub fn socket_state(&self) -> Option<ConnectionState> {
        self.socket.and_then(|handle| self.connections.state(handle))
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Start the poll timer and the push channel.
    ///
    /// Fails with `Unauthenticated` (starting nothing) when the credential
    /// does not resolve, and with `AlreadyRunning` on a second call. Nothing
    /// after the identity check can fail.
    pub async fn start(&mut self) -> SyncResult<Identity> {
        if self.pump.is_some() || self.is_polling() {
            return Err(SyncError::AlreadyRunning);
        }
        let identity = self.identity().into_result()?;
        info!(
            "Starting sync for subject {} (privileged: {})",
            identity.subject_id, identity.is_privileged
        );

        self.spawn_timer();

        if let Some(url) = self.config.socket_url_for(&identity.subject_id.to_string()) {
            self.socket = Some(self.connections.open(&url));
        }

        if let Some(conn_rx) = self.conn_rx.take() {
            self.pump = Some(tokio::spawn(pump_frames(
                conn_rx,
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.poller),
                self.config.push_preview,
                self.events.clone(),
            )));
        }

        Ok(identity)
    }

    /// Start the poll timer. At most one timer runs per session.
    pub fn start_polling(&mut self) -> SyncResult<()> {
        if self.is_polling() {
            return Err(SyncError::AlreadyRunning);
        }
        if !self.identity().is_authenticated() {
            return Err(SyncError::Unauthenticated);
        }
        self.spawn_timer();
        Ok(())
    }

    fn spawn_timer(&mut self) {
        let period = Duration::from_millis(self.config.poll_interval_ms.max(1));
        debug!("Starting poll timer every {:?}", period);
        self.timer = Some(PollTimer::start(
            Arc::clone(&self.poller),
            period,
            self.events.clone(),
        ));
    }

    /// Stop the poll timer, waiting for an in-flight tick to be cancelled.
    pub async fn stop_polling(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop().await;
            debug!("Poll timer stopped");
        }
    }

    /// Reconcile now, outside the timer. Skipped if a tick is in flight.
    pub async fn refresh(&self) -> SyncResult<TickReport> {
        self.poller.tick().await
    }

    /// Delete an item; the store drops it as soon as the server confirms.
    pub async fn remove(&self, id: ItemId) -> SyncResult<()> {
        self.poller.remove(id).await
    }

    /// Edit an item (privileged identities only); the store merges the
    /// patch as soon as the server accepts it.
    pub async fn update(&self, id: ItemId, patch: &Value) -> SyncResult<()> {
        self.poller.update(id, patch).await
    }

    /// Send a JSON payload on the push socket.
    pub async fn send(&self, payload: &Value) -> SyncResult<()> {
        let handle = self
            .socket
            .ok_or(SyncError::NotConnected { connection: 0 })?;
        self.connections.send(handle, payload).await
    }

    /// Tear the session down: stop the timer, close every connection, and
    /// drop all push subscribers. Returns once no task can mutate the store.
    pub async fn shutdown(mut self) {
        self.stop_polling().await;
        self.connections.close_all().await;
        self.dispatcher.unsubscribe_all();

        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }

        self.dispatcher.clear();
        info!("Sync session shut down");
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.task.abort();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
