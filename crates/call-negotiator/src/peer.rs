use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::message::{IceCandidate, SessionDescription};
use crate::PeerError;

/// Coarse connectivity reported by the peer resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A locally gathered candidate that must reach the remote end.
    LocalCandidate(IceCandidate),
    Connectivity(Connectivity),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// Local peer/media resource owned by exactly one call session.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    /// Releases local media and closes the peer.
    async fn close(&self) -> Result<(), PeerError>;
}

/// Acquires the local media/peer resource for a new call.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn acquire(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
