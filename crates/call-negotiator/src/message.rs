use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, alias = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(default, alias = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, alias = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self.sdp_mline_index = Some(sdp_mline_index);
        self
    }

    /// Identity used to detect a candidate delivered twice.
    pub(crate) fn dedupe_key(&self) -> (String, Option<String>, Option<u16>) {
        (
            self.candidate.trim().to_string(),
            self.sdp_mid.clone(),
            self.sdp_mline_index,
        )
    }
}

/// Envelope exchanged over the signaling link:
/// `{"type": "call_offer" | "call_answer" | "ice_candidate" | "hangup", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    #[serde(rename = "call_offer")]
    Offer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },
    #[serde(rename = "call_answer")]
    Answer { sdp: String },
    #[serde(rename = "ice_candidate")]
    Candidate {
        candidate: String,
        #[serde(default, alias = "sdpMid")]
        sdp_mid: Option<String>,
        #[serde(default, alias = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
        #[serde(default, alias = "usernameFragment", skip_serializing_if = "Option::is_none")]
        username_fragment: Option<String>,
    },
    #[serde(rename = "hangup")]
    Hangup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl SignalMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        SignalMessage::Candidate {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "call_offer",
            SignalMessage::Answer { .. } => "call_answer",
            SignalMessage::Candidate { .. } => "ice_candidate",
            SignalMessage::Hangup { .. } => "hangup",
        }
    }
}
