//! Bidirectional text links used to carry call signaling between two ends.
//!
//! A link only moves JSON text frames; it knows nothing about the messages it
//! carries. Call sessions consume any [`SignalLink`] and drain its inbound
//! receiver through an explicit dispatch loop.

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

mod websocket;

pub use websocket::WebSocketLink;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("signaling link closed")]
    Closed,
    #[error("signaling link transport error: {0}")]
    Transport(String),
}

pub type LinkResult<T> = Result<T, LinkError>;

/// Inbound text frames, handed out once per link.
pub type Inbound = mpsc::UnboundedReceiver<String>;

pub trait SignalLink: Send + Sync {
    fn send(&self, text: &str) -> LinkResult<()>;
    fn is_open(&self) -> bool;
    fn close(&self);
    /// Takes the inbound frame receiver. Returns `None` after the first call.
    fn take_incoming(&self) -> Option<Inbound>;
}

/// In-memory link. [`LocalLink::pair`] returns two connected ends.
#[derive(Debug)]
pub struct LocalLink {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    incoming: Mutex<Option<Inbound>>,
}

impl LocalLink {
    pub fn pair() -> (LocalLink, LocalLink) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = LocalLink {
            outbound: Mutex::new(Some(b_tx)),
            incoming: Mutex::new(Some(a_rx)),
        };
        let b = LocalLink {
            outbound: Mutex::new(Some(a_tx)),
            incoming: Mutex::new(Some(b_rx)),
        };
        (a, b)
    }
}

impl SignalLink for LocalLink {
    fn send(&self, text: &str) -> LinkResult<()> {
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(LinkError::Closed)?;
        tx.send(text.to_string()).map_err(|_| LinkError::Closed)
    }

    fn is_open(&self) -> bool {
        self.outbound
            .lock()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    fn close(&self) {
        self.outbound.lock().take();
    }

    fn take_incoming(&self) -> Option<Inbound> {
        self.incoming.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_pair_delivers_both_ways() {
        let (left, right) = LocalLink::pair();
        let mut left_rx = left.take_incoming().expect("left inbound");
        let mut right_rx = right.take_incoming().expect("right inbound");

        left.send(r#"{"type":"hangup"}"#).expect("send left");
        right.send("pong").expect("send right");

        assert_eq!(right_rx.recv().await.as_deref(), Some(r#"{"type":"hangup"}"#));
        assert_eq!(left_rx.recv().await.as_deref(), Some("pong"));
    }

    #[test]
    fn incoming_is_taken_once() {
        let (left, _right) = LocalLink::pair();
        assert!(left.take_incoming().is_some());
        assert!(left.take_incoming().is_none());
    }

    #[tokio::test]
    async fn close_stops_sending_and_ends_remote_stream() {
        let (left, right) = LocalLink::pair();
        let mut right_rx = right.take_incoming().expect("right inbound");
        assert!(left.is_open());

        left.close();

        assert!(!left.is_open());
        assert!(matches!(left.send("late"), Err(LinkError::Closed)));
        assert!(right_rx.recv().await.is_none());
    }

    #[test]
    fn remote_drop_marks_link_closed() {
        let (left, right) = LocalLink::pair();
        drop(right);
        assert!(!left.is_open());
    }
}
