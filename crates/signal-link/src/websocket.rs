use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use crate::{Inbound, LinkError, LinkResult, SignalLink};

/// Signaling link over a websocket relay. Text and UTF-8 binary frames are
/// forwarded to the inbound receiver; everything else is ignored.
pub struct WebSocketLink {
    url: Url,
    open: Arc<AtomicBool>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    incoming: Mutex<Option<Inbound>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketLink {
    pub async fn connect(url: Url) -> LinkResult<Self> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| LinkError::Transport(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "signal_link", url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let open = Arc::new(AtomicBool::new(true));
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        let writer_open = Arc::clone(&open);
        // Detached: it drains queued frames and sends the close frame once
        // every sender is gone.
        tokio::spawn(async move {
            while let Some(text) = send_rx.recv().await {
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
            writer_open.store(false, Ordering::SeqCst);
        });

        let reader_open = Arc::clone(&open);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        tracing::trace!(target = "signal_link", kind = "text", len = text.len());
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => {
                            if inbound_tx.send(text).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                target = "signal_link",
                                error = %err,
                                "dropping non-utf8 binary frame"
                            );
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target = "signal_link",
                                    "signaling websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target = "signal_link",
                                    "signaling websocket error: {err}"
                                );
                            }
                        }
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
        });

        Ok(Self {
            url,
            open,
            outbound: Mutex::new(Some(send_tx)),
            incoming: Mutex::new(Some(inbound_rx)),
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl SignalLink for WebSocketLink {
    fn send(&self, text: &str) -> LinkResult<()> {
        if !self.is_open() {
            return Err(LinkError::Closed);
        }
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(LinkError::Closed)?;
        tx.send(text.to_string()).map_err(|_| LinkError::Closed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.outbound.lock().is_some()
    }

    fn close(&self) {
        // Dropping the sender lets the writer flush and send a close frame.
        self.outbound.lock().take();
        self.open.store(false, Ordering::SeqCst);
    }

    fn take_incoming(&self) -> Option<Inbound> {
        self.incoming.lock().take()
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}
