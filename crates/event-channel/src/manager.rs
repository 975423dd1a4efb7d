use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::ChannelConfig;
use crate::connector::{PushConnector, PushFrame, StreamRequest};
use crate::listener::{Listener, ListenerRegistry};
use crate::{ChannelEvent, ChannelResult, ConnectionState, Credentials, TransportError};

/// Owns the push connection of one logged-in user and fans its events out to
/// listeners.
///
/// Construct one per login and drop it (or call [`disconnect`]) at logout.
/// Transport failures never surface to callers: the manager marks the
/// connection closed and schedules exactly one reconnect. Must be used from
/// within a Tokio runtime.
///
/// [`disconnect`]: EventChannelManager::disconnect
pub struct EventChannelManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ChannelConfig,
    connector: Arc<dyn PushConnector>,
    listeners: ListenerRegistry,
    connection: Mutex<Option<ChannelConnection>>,
    delivered: Mutex<DeliveredLog>,
    state_tx: watch::Sender<ConnectionState>,
    generation: AtomicU64,
}

struct ChannelConnection {
    user_id: String,
    endpoint: Url,
    state: ConnectionState,
    attempts: u32,
    generation: u64,
    reader: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl ChannelConnection {
    fn shutdown(&mut self) {
        if let Some(timer) = self.reconnect.take() {
            timer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.state = ConnectionState::Closed;
    }
}

/// Recently delivered event ids for the current user session.
struct DeliveredLog {
    recent: VecDeque<String>,
    window: usize,
}

impl DeliveredLog {
    fn new(window: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(window.min(1024)),
            window,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.recent.iter().any(|seen| seen == id)
    }

    fn record(&mut self, id: String) {
        if self.window == 0 {
            return;
        }
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(id);
    }

    fn last(&self) -> Option<String> {
        self.recent.back().cloned()
    }

    fn clear(&mut self) {
        self.recent.clear();
    }
}

impl EventChannelManager {
    pub fn new(config: ChannelConfig, connector: Arc<dyn PushConnector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let delivered = DeliveredLog::new(config.dedupe_window);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                listeners: ListenerRegistry::new(),
                connection: Mutex::new(None),
                delivered: Mutex::new(delivered),
                state_tx,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Opens the push stream for `credentials`.
    ///
    /// Absent or blank credentials are logged and ignored. A connection for
    /// the same user that is already open or connecting is left untouched; a
    /// connection for another user is torn down first.
    pub fn connect(&self, credentials: Option<Credentials>) -> ChannelResult<()> {
        let Some(credentials) = credentials.filter(Credentials::is_usable) else {
            warn!(
                target = "event_channel",
                "no credentials available; event channel not started"
            );
            return Ok(());
        };
        let endpoint = self.inner.config.stream_url(&credentials.token)?;

        let mut guard = self.inner.connection.lock();
        if let Some(existing) = guard.as_mut() {
            if existing.user_id == credentials.user_id {
                if matches!(
                    existing.state,
                    ConnectionState::Open | ConnectionState::Connecting
                ) {
                    debug!(
                        target = "event_channel",
                        user_id = %credentials.user_id,
                        state = ?existing.state,
                        "event channel already active; ignoring connect"
                    );
                    return Ok(());
                }
            } else {
                self.inner.delivered.lock().clear();
            }
            existing.shutdown();
        }

        let generation = self.inner.next_generation();
        let mut connection = ChannelConnection {
            user_id: credentials.user_id,
            endpoint,
            state: ConnectionState::Connecting,
            attempts: 0,
            generation,
            reader: None,
            reconnect: None,
        };
        info!(
            target = "event_channel",
            user_id = %connection.user_id,
            "opening event channel"
        );
        connection.reader = Some(self.inner.spawn_reader(&connection));
        *guard = Some(connection);
        drop(guard);

        self.inner.publish_state(ConnectionState::Connecting);
        Ok(())
    }

    /// Cancels any pending reconnect, closes the stream and forgets the
    /// user session. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let previous = self.inner.connection.lock().take();
        // Invalidate continuations of the torn-down connection.
        self.inner.next_generation();
        if let Some(mut connection) = previous {
            connection.shutdown();
            self.inner.delivered.lock().clear();
            info!(
                target = "event_channel",
                user_id = %connection.user_id,
                "event channel disconnected"
            );
        }
        self.inner.publish_state(ConnectionState::Closed);
    }

    /// Returns `false` when the listener was already registered.
    pub fn add_listener(&self, listener: &Listener) -> bool {
        self.inner.listeners.add(listener)
    }

    /// Returns `false` when the listener was not registered.
    pub fn remove_listener(&self, listener: &Listener) -> bool {
        self.inner.listeners.remove(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Parses and dispatches one raw payload. Returns the number of listeners
    /// that received it; malformed payloads and heartbeats yield zero.
    pub fn on_message(&self, raw: &str) -> usize {
        self.inner.dispatch(raw, None)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner
            .connection
            .lock()
            .as_ref()
            .map(|connection| connection.user_id.clone())
    }

    /// Consecutive failed attempts since the stream was last open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner
            .connection
            .lock()
            .as_ref()
            .map(|connection| connection.attempts)
            .unwrap_or(0)
    }

    /// Reconnect timers currently waiting to fire; always 0 or 1.
    pub fn pending_reconnects(&self) -> usize {
        self.inner
            .connection
            .lock()
            .as_ref()
            .and_then(|connection| connection.reconnect.as_ref())
            .filter(|timer| !timer.is_finished())
            .map_or(0, |_| 1)
    }
}

impl Drop for EventChannelManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Inner {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn spawn_reader(self: &Arc<Self>, connection: &ChannelConnection) -> JoinHandle<()> {
        let request = StreamRequest {
            url: connection.endpoint.clone(),
            last_event_id: self.delivered.lock().last(),
        };
        let generation = connection.generation;
        let connector = Arc::clone(&self.connector);
        let weak = Arc::downgrade(self);
        tokio::spawn(run_stream(weak, connector, generation, request))
    }

    fn mark_open(&self, generation: u64) -> bool {
        let mut guard = self.connection.lock();
        let Some(connection) = guard.as_mut() else {
            return false;
        };
        if connection.generation != generation {
            return false;
        }
        connection.state = ConnectionState::Open;
        connection.attempts = 0;
        if let Some(timer) = connection.reconnect.take() {
            timer.abort();
        }
        info!(
            target = "event_channel",
            user_id = %connection.user_id,
            "event channel open"
        );
        drop(guard);
        self.publish_state(ConnectionState::Open);
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|connection| connection.generation == generation)
    }

    fn handle_failure(self: &Arc<Self>, generation: u64, error: TransportError) {
        let mut guard = self.connection.lock();
        let Some(connection) = guard.as_mut() else {
            return;
        };
        if connection.generation != generation {
            return;
        }
        connection.state = ConnectionState::Closed;
        // The failing reader is the caller; just detach it.
        connection.reader = None;
        if let Some(timer) = connection.reconnect.take() {
            timer.abort();
        }
        connection.attempts = connection.attempts.saturating_add(1);
        let delay = self.config.reconnect.delay_for(connection.attempts);
        warn!(
            target = "event_channel",
            user_id = %connection.user_id,
            attempt = connection.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "event channel dropped; scheduling reconnect"
        );
        let weak = Arc::downgrade(self);
        connection.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.reconnect(generation);
            }
        }));
        drop(guard);
        self.publish_state(ConnectionState::Closed);
    }

    fn reconnect(self: &Arc<Self>, generation: u64) {
        let mut guard = self.connection.lock();
        let Some(connection) = guard.as_mut() else {
            return;
        };
        if connection.generation != generation || connection.state != ConnectionState::Closed {
            return;
        }
        // This timer has fired; it is the caller.
        connection.reconnect = None;
        connection.generation = self.next_generation();
        connection.state = ConnectionState::Connecting;
        debug!(
            target = "event_channel",
            user_id = %connection.user_id,
            attempt = connection.attempts,
            "reconnecting event channel"
        );
        connection.reader = Some(self.spawn_reader(connection));
        drop(guard);
        self.publish_state(ConnectionState::Connecting);
    }

    fn on_frame(&self, frame: PushFrame) {
        if let Some(id) = frame.id.as_deref() {
            if self.delivered.lock().contains(id) {
                debug!(
                    target = "event_channel",
                    event_id = %id,
                    "dropping replayed event"
                );
                return;
            }
        }
        self.dispatch(&frame.data, frame.id);
    }

    fn dispatch(&self, raw: &str, event_id: Option<String>) -> usize {
        let payload: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    target = "event_channel",
                    error = %err,
                    len = raw.len(),
                    "dropping malformed event payload"
                );
                return 0;
            }
        };
        if let Some(id) = event_id.clone() {
            self.delivered.lock().record(id);
        }

        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        if kind.as_deref() == Some(self.config.heartbeat_type.as_str()) {
            trace!(target = "event_channel", "heartbeat");
            return 0;
        }

        let event = ChannelEvent {
            kind,
            event_id,
            payload,
        };
        self.listeners.dispatch(&event)
    }
}

async fn run_stream(
    inner: Weak<Inner>,
    connector: Arc<dyn PushConnector>,
    generation: u64,
    request: StreamRequest,
) {
    let opened = connector.open(&request).await;
    let mut stream = {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        match opened {
            Ok(stream) => {
                if !strong.mark_open(generation) {
                    return;
                }
                stream
            }
            Err(err) => {
                strong.handle_failure(generation, err);
                return;
            }
        }
    };

    loop {
        let frame = stream.next_frame().await;
        let Some(strong) = inner.upgrade() else {
            stream.close();
            return;
        };
        if !strong.is_current(generation) {
            stream.close();
            return;
        }
        match frame {
            Some(Ok(frame)) => strong.on_frame(frame),
            Some(Err(err)) => {
                stream.close();
                strong.handle_failure(generation, err);
                return;
            }
            None => {
                strong.handle_failure(generation, TransportError::Closed);
                return;
            }
        }
    }
}
