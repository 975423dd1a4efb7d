use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{retry::Never, Error as EventSourceError, Event, EventSource};
use tracing::debug;
use url::Url;

use crate::TransportError;

/// One push-stream open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub url: Url,
    /// Id of the last event delivered on this user session, sent as
    /// `Last-Event-ID` so the server can resume after it.
    pub last_event_id: Option<String>,
}

/// Raw frame read off the push stream, before JSON parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushFrame {
    pub id: Option<String>,
    pub data: String,
}

impl PushFrame {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            id: None,
            data: data.into(),
        }
    }

    pub fn with_id(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            data: data.into(),
        }
    }
}

#[async_trait]
pub trait PushStream: Send {
    /// `None` means the server ended the stream.
    async fn next_frame(&mut self) -> Option<Result<PushFrame, TransportError>>;
    fn close(&mut self) {}
}

/// Opens push streams. Resolves once the stream is open; the manager never
/// retries inside the connector.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn open(&self, request: &StreamRequest) -> Result<Box<dyn PushStream>, TransportError>;
}

/// Server-sent events over `reqwest`. The event source's own retry is
/// disabled; reconnect timing belongs to the manager.
#[derive(Debug, Clone, Default)]
pub struct SseConnector {
    http: reqwest::Client,
}

impl SseConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PushConnector for SseConnector {
    async fn open(&self, request: &StreamRequest) -> Result<Box<dyn PushStream>, TransportError> {
        let mut builder = self.http.get(request.url.clone());
        if let Some(last_id) = request.last_event_id.as_deref() {
            builder = builder.header("Last-Event-ID", last_id);
        }
        let mut source =
            EventSource::new(builder).map_err(|err| TransportError::Request(err.to_string()))?;
        source.set_retry_policy(Box::new(Never));

        loop {
            match source.next().await {
                Some(Ok(Event::Open)) => {
                    debug!(target = "event_channel", "event stream opened");
                    return Ok(Box::new(SseStream { source }));
                }
                Some(Ok(Event::Message(_))) => {
                    // Messages cannot precede the open event.
                    continue;
                }
                Some(Err(err)) => {
                    source.close();
                    return Err(TransportError::Request(err.to_string()));
                }
                None => return Err(TransportError::Closed),
            }
        }
    }
}

struct SseStream {
    source: EventSource,
}

#[async_trait]
impl PushStream for SseStream {
    async fn next_frame(&mut self) -> Option<Result<PushFrame, TransportError>> {
        loop {
            match self.source.next().await? {
                Ok(Event::Open) => continue,
                Ok(Event::Message(message)) => {
                    let id = (!message.id.is_empty()).then_some(message.id);
                    return Some(Ok(PushFrame {
                        id,
                        data: message.data,
                    }));
                }
                Err(EventSourceError::StreamEnded) => {
                    self.source.close();
                    return None;
                }
                Err(err) => {
                    self.source.close();
                    return Some(Err(TransportError::Stream(err.to_string())));
                }
            }
        }
    }

    fn close(&mut self) {
        self.source.close();
    }
}
