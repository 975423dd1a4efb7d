//! Event channel: one long-lived server-push stream per logged-in user.
//!
//! Responsibilities:
//! - opening `GET <base>/notifications/stream?token=<token>` as an SSE stream
//! - reconnecting after drops with a single pending timer
//! - parsing JSON payloads and fanning them out to registered listeners
//! - filtering heartbeats and replayed events

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod config;
pub mod connector;
pub mod listener;
pub mod manager;

pub use config::{ChannelConfig, ReconnectPolicy};
pub use connector::{PushConnector, PushFrame, PushStream, SseConnector, StreamRequest};
pub use listener::{EventListener, Listener, ListenerRegistry};
pub use manager::EventChannelManager;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid event stream endpoint: {0}")]
    InvalidEndpoint(String),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Failures of the push transport. These never reach `connect` callers; the
/// manager recovers from them by reconnecting.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("event stream request failed: {0}")]
    Request(String),
    #[error("event stream failed: {0}")]
    Stream(String),
    #[error("event stream closed by server")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Identity and bearer token of the logged-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub token: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }

    fn is_usable(&self) -> bool {
        !self.user_id.trim().is_empty() && !self.token.trim().is_empty()
    }
}

/// A parsed push payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    /// The payload's `type` field, when present.
    pub kind: Option<String>,
    /// SSE event id, when the server assigned one.
    pub event_id: Option<String>,
    pub payload: Value,
}
