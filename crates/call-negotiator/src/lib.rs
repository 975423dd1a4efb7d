//! Call session negotiation over an externally supplied signaling link.
//!
//! Responsibilities:
//! - driving the offer/answer exchange for one voice call
//! - forwarding local connectivity candidates and buffering early remote ones
//! - publishing the call state for UI collaborators
//! - tearing the peer resource down exactly once

use serde::{Deserialize, Serialize};
use signal_link::LinkError;
use thiserror::Error;

pub mod config;
pub mod message;
pub mod peer;
pub mod rtc;
pub mod session;

pub use config::{GlarePolicy, NegotiatorConfig};
pub use message::{DescriptionKind, IceCandidate, SessionDescription, SignalMessage};
pub use peer::{Connectivity, PeerConnection, PeerEvent, PeerEventSender, PeerFactory};
pub use rtc::{RtcPeerConfig, RtcPeerFactory};
pub use session::{CallSession, CandidateOutcome, Dispatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Negotiating,
    Connected,
    Terminated,
}

impl CallState {
    fn rank(self) -> u8 {
        match self {
            CallState::Idle => 0,
            CallState::Negotiating => 1,
            CallState::Connected => 2,
            CallState::Terminated => 3,
        }
    }

    /// Forward-only, except that `Terminated` is reachable from anywhere.
    pub fn can_advance_to(self, next: CallState) -> bool {
        if self == CallState::Terminated {
            return false;
        }
        next == CallState::Terminated || next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TerminationReason {
    LocalHangup,
    RemoteHangup,
    ConnectionFailed,
    Failed(String),
}

/// Snapshot published to observers on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStatus {
    pub state: CallState,
    pub role: Option<CallRole>,
    pub reason: Option<TerminationReason>,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            role: None,
            reason: None,
        }
    }
}

/// Failures reported by the local peer/media resource.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("failed to acquire local media: {0}")]
    Acquire(String),
    #[error("session description error: {0}")]
    Description(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("peer closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("cannot {op} while call is {state:?}")]
    InvalidState { op: &'static str, state: CallState },
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] PeerError),
    #[error("signaling link failed: {0}")]
    Link(#[from] LinkError),
    #[error("failed to encode signal message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("call session was torn down")]
    Cancelled,
}

pub type CallResult<T> = Result<T, CallError>;
