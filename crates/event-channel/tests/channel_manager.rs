use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use event_channel::{
    ChannelConfig, ChannelEvent, ConnectionState, Credentials, EventChannelManager, Listener,
    PushConnector, PushFrame, PushStream, StreamRequest, TransportError,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

type FrameTx = mpsc::UnboundedSender<Result<PushFrame, TransportError>>;
type FrameRx = mpsc::UnboundedReceiver<Result<PushFrame, TransportError>>;

enum Script {
    Refuse,
    Stream(FrameRx),
}

/// Connector that replays scripted outcomes and records every request.
/// Once the script runs out it refuses every open.
#[derive(Default)]
struct ScriptedConnector {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedConnector {
    fn refuse(&self) {
        self.scripts.lock().push_back(Script::Refuse);
    }

    fn stream(&self) -> FrameTx {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts.lock().push_back(Script::Stream(rx));
        tx
    }

    fn opens(&self) -> usize {
        self.requests.lock().len()
    }

    fn request(&self, index: usize) -> StreamRequest {
        self.requests.lock()[index].clone()
    }
}

struct ScriptedStream {
    frames: FrameRx,
}

#[async_trait]
impl PushStream for ScriptedStream {
    async fn next_frame(&mut self) -> Option<Result<PushFrame, TransportError>> {
        self.frames.recv().await
    }
}

#[async_trait]
impl PushConnector for ScriptedConnector {
    async fn open(&self, request: &StreamRequest) -> Result<Box<dyn PushStream>, TransportError> {
        self.requests.lock().push(request.clone());
        match self.scripts.lock().pop_front() {
            Some(Script::Stream(frames)) => Ok(Box::new(ScriptedStream { frames })),
            Some(Script::Refuse) | None => {
                Err(TransportError::Request("connection refused".into()))
            }
        }
    }
}

fn config() -> ChannelConfig {
    ChannelConfig::new(Url::parse("https://api.shop.local/").expect("base url"))
}

fn alice() -> Option<Credentials> {
    Some(Credentials::new("alice", "tok-alice"))
}

fn recording_listener() -> (Listener, mpsc::UnboundedReceiver<ChannelEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener: Listener = Arc::new(move |event: &ChannelEvent| {
        let _ = tx.send(event.clone());
    });
    (listener, rx)
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn absent_credentials_schedule_nothing() {
    let connector = Arc::new(ScriptedConnector::default());
    let manager = EventChannelManager::new(config(), connector.clone());

    manager.connect(None).expect("connect");
    manager
        .connect(Some(Credentials::new("alice", "  ")))
        .expect("connect");
    settle().await;

    assert_eq!(connector.opens(), 0);
    assert_eq!(manager.pending_reconnects(), 0);
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn open_stream_uses_token_endpoint_and_dispatches_events() {
    let connector = Arc::new(ScriptedConnector::default());
    let frames = connector.stream();
    let manager = EventChannelManager::new(config(), connector.clone());
    let (listener, mut events) = recording_listener();
    assert!(manager.add_listener(&listener));

    manager.connect(alice()).expect("connect");
    settle().await;

    assert_eq!(manager.state(), ConnectionState::Open);
    let request = connector.request(0);
    assert_eq!(
        request.url.as_str(),
        "https://api.shop.local/notifications/stream?token=tok-alice"
    );
    assert_eq!(request.last_event_id, None);

    frames
        .send(Ok(PushFrame::new(r#"{"type":"new_message","chat_id":7}"#)))
        .expect("frame");
    let event = events.recv().await.expect("event");
    assert_eq!(event.kind.as_deref(), Some("new_message"));
    assert_eq!(event.payload["chat_id"], 7);
}

#[tokio::test(start_paused = true)]
async fn connect_while_active_is_a_noop() {
    let connector = Arc::new(ScriptedConnector::default());
    let _frames = connector.stream();
    let manager = EventChannelManager::new(config(), connector.clone());

    manager.connect(alice()).expect("connect");
    manager.connect(alice()).expect("connect while connecting");
    settle().await;
    manager.connect(alice()).expect("connect while open");
    settle().await;

    assert_eq!(connector.opens(), 1);
    assert_eq!(manager.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn heartbeats_and_malformed_payloads_reach_no_listener() {
    let connector = Arc::new(ScriptedConnector::default());
    let manager = EventChannelManager::new(config(), connector);
    let hits = Arc::new(AtomicUsize::new(0));
    let listener: Listener = {
        let hits = Arc::clone(&hits);
        Arc::new(move |_: &ChannelEvent| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    };
    manager.add_listener(&listener);

    assert_eq!(manager.on_message(r#"{"type":"ping"}"#), 0);
    assert_eq!(manager.on_message("{not json"), 0);
    assert_eq!(manager.on_message(r#"{"type":"order_paid"}"#), 1);

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn listener_registry_ignores_duplicates_and_strangers() {
    let manager = EventChannelManager::new(config(), Arc::new(ScriptedConnector::default()));
    let (listener, _rx) = recording_listener();
    let (stranger, _rx2) = recording_listener();

    assert!(manager.add_listener(&listener));
    assert!(!manager.add_listener(&listener));
    assert!(!manager.remove_listener(&stranger));
    assert_eq!(manager.listener_count(), 1);
    assert!(manager.remove_listener(&listener));
    assert_eq!(manager.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn at_most_one_reconnect_timer_across_repeated_failures() {
    let connector = Arc::new(ScriptedConnector::default());
    let manager = EventChannelManager::new(config(), connector.clone());

    manager.connect(alice()).expect("connect");
    settle().await;
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(manager.pending_reconnects(), 1);
    assert_eq!(manager.reconnect_attempts(), 1);

    for round in 0..5 {
        // Connecting again while a timer is pending must not add a second one.
        manager.connect(alice()).expect("reconnect request");
        settle().await;
        assert!(manager.pending_reconnects() <= 1, "round {round}");

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert!(manager.pending_reconnects() <= 1, "round {round}");
    }
    assert_eq!(manager.pending_reconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_fires_only_after_the_fixed_delay() {
    let connector = Arc::new(ScriptedConnector::default());
    connector.refuse();
    let _frames = connector.stream();
    let manager = EventChannelManager::new(config(), connector.clone());

    manager.connect(alice()).expect("connect");
    settle().await;
    assert_eq!(connector.opens(), 1);

    tokio::time::advance(Duration::from_millis(4_900)).await;
    settle().await;
    assert_eq!(connector.opens(), 1);
    assert_eq!(manager.pending_reconnects(), 1);

    tokio::time::advance(Duration::from_millis(100)).await;
    settle().await;
    assert_eq!(connector.opens(), 2);
    assert_eq!(manager.state(), ConnectionState::Open);
    assert_eq!(manager.pending_reconnects(), 0);
    assert_eq!(manager.reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_stream_resumes_without_duplicate_dispatch() {
    let connector = Arc::new(ScriptedConnector::default());
    let first = connector.stream();
    let second = connector.stream();
    let manager = EventChannelManager::new(config(), connector.clone());
    let (listener, mut events) = recording_listener();
    manager.add_listener(&listener);

    manager.connect(alice()).expect("connect");
    settle().await;
    first
        .send(Ok(PushFrame::with_id("41", r#"{"type":"new_message","n":1}"#)))
        .expect("frame");
    first
        .send(Err(TransportError::Stream("connection reset".into())))
        .expect("drop");
    settle().await;

    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(manager.pending_reconnects(), 1);

    // Server replays the last event after resume.
    second
        .send(Ok(PushFrame::with_id("41", r#"{"type":"new_message","n":1}"#)))
        .expect("replay");
    second
        .send(Ok(PushFrame::with_id("42", r#"{"type":"new_message","n":2}"#)))
        .expect("frame");
    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;

    assert_eq!(connector.opens(), 2);
    assert_eq!(
        connector.request(1).last_event_id.as_deref(),
        Some("41")
    );
    assert_eq!(manager.state(), ConnectionState::Open);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_id.expect("event id"));
    }
    assert_eq!(seen, vec!["41".to_string(), "42".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn server_closing_the_stream_schedules_reconnect() {
    let connector = Arc::new(ScriptedConnector::default());
    let first = connector.stream();
    let _second = connector.stream();
    let manager = EventChannelManager::new(config(), connector.clone());

    manager.connect(alice()).expect("connect");
    settle().await;
    drop(first);
    settle().await;

    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(manager.pending_reconnects(), 1);

    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(manager.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_timer_and_is_idempotent() {
    let connector = Arc::new(ScriptedConnector::default());
    let manager = EventChannelManager::new(config(), connector.clone());

    manager.connect(alice()).expect("connect");
    settle().await;
    assert_eq!(manager.pending_reconnects(), 1);

    manager.disconnect();
    manager.disconnect();
    assert_eq!(manager.pending_reconnects(), 0);
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(manager.user_id(), None);

    tokio::time::advance(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn switching_users_replaces_the_connection() {
    let connector = Arc::new(ScriptedConnector::default());
    let alice_frames = connector.stream();
    let _bob_frames = connector.stream();
    let manager = EventChannelManager::new(config(), connector.clone());
    let (listener, mut events) = recording_listener();
    manager.add_listener(&listener);

    manager.connect(alice()).expect("connect alice");
    settle().await;
    manager
        .connect(Some(Credentials::new("bob", "tok-bob")))
        .expect("connect bob");
    settle().await;

    assert_eq!(connector.opens(), 2);
    assert_eq!(manager.user_id().as_deref(), Some("bob"));
    assert!(connector.request(1).url.as_str().ends_with("token=tok-bob"));

    // Frames on the abandoned stream are never dispatched.
    let _ = alice_frames.send(Ok(PushFrame::new(r#"{"type":"new_message"}"#)));
    settle().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn state_changes_are_observable() {
    let connector = Arc::new(ScriptedConnector::default());
    let _frames = connector.stream();
    let manager = EventChannelManager::new(config(), connector);
    let mut state = manager.subscribe_state();
    assert_eq!(*state.borrow(), ConnectionState::Closed);

    manager.connect(alice()).expect("connect");
    settle().await;

    state.changed().await.expect("state change");
    assert_eq!(*state.borrow_and_update(), ConnectionState::Open);

    manager.disconnect();
    state.changed().await.expect("state change");
    assert_eq!(*state.borrow(), ConnectionState::Closed);
}
