use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_OPUS},
        APIBuilder,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::sdp_type::RTCSdpType, sdp::session_description::RTCSessionDescription,
        RTCPeerConnection,
    },
    rtp_transceiver::{rtp_codec::RTCRtpCodecCapability, rtp_sender::RTCRtpSender},
    track::track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
};

use crate::message::{DescriptionKind, IceCandidate, SessionDescription};
use crate::peer::{Connectivity, PeerConnection, PeerEvent, PeerEventSender, PeerFactory};
use crate::PeerError;

const AUDIO_TRACK_ID: &str = "audio";
const AUDIO_STREAM_ID: &str = "signal-call";

#[derive(Debug, Clone)]
pub struct RtcPeerConfig {
    /// STUN/TURN urls. Empty means host candidates only.
    pub ice_servers: Vec<String>,
}

impl Default for RtcPeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl RtcPeerConfig {
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
        }
    }
}

/// Builds webrtc peer connections carrying one outbound Opus audio track.
/// Feeding samples into the track is left to the media layer.
#[derive(Debug, Clone, Default)]
pub struct RtcPeerFactory {
    config: RtcPeerConfig,
}

impl RtcPeerFactory {
    pub fn new(config: RtcPeerConfig) -> Self {
        Self { config }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn acquire(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(to_acquire_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(to_acquire_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(to_acquire_error)?,
        );

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            AUDIO_TRACK_ID.to_owned(),
            AUDIO_STREAM_ID.to_owned(),
        ));
        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(to_acquire_error)?;

        wire_peer_events(&pc, events);
        info!(target = "call", "local audio peer acquired");

        Ok(Arc::new(RtcPeer {
            pc,
            audio: Mutex::new(Some(sender)),
        }))
    }
}

fn wire_peer_events(pc: &Arc<RTCPeerConnection>, events: PeerEventSender) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                debug!(target = "call", "local candidate gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(err) => {
                    warn!(target = "call", error = %err, "failed to serialize local candidate");
                }
            }
        })
    }));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = events.clone();
        Box::pin(async move {
            debug!(target = "call", state = ?state, "peer connection state changed");
            let connectivity = match state {
                RTCPeerConnectionState::Connecting => Connectivity::Connecting,
                RTCPeerConnectionState::Connected => Connectivity::Connected,
                RTCPeerConnectionState::Disconnected => Connectivity::Disconnected,
                RTCPeerConnectionState::Failed => Connectivity::Failed,
                RTCPeerConnectionState::Closed => Connectivity::Closed,
                _ => return,
            };
            let _ = events.send(PeerEvent::Connectivity(connectivity));
        })
    }));
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    audio: Mutex<Option<Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_description_error)?;
        Ok(from_rtc(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_description_error)?;
        Ok(from_rtc(answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(to_description_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(to_description_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| PeerError::Candidate(err.to_string()))
    }

    async fn close(&self) -> Result<(), PeerError> {
        let sender = self.audio.lock().take();
        if let Some(sender) = sender {
            if let Err(err) = self.pc.remove_track(&sender).await {
                warn!(target = "call", error = %err, "failed to release local audio track");
            }
        }
        self.pc
            .close()
            .await
            .map_err(|err| PeerError::Description(err.to_string()))
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match description.kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp),
        DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(to_description_error)
}

fn from_rtc(description: RTCSessionDescription) -> SessionDescription {
    match description.sdp_type {
        RTCSdpType::Answer | RTCSdpType::Pranswer => SessionDescription::answer(description.sdp),
        _ => SessionDescription::offer(description.sdp),
    }
}

fn to_acquire_error(err: impl std::error::Error) -> PeerError {
    PeerError::Acquire(err.to_string())
}

fn to_description_error(err: impl std::error::Error) -> PeerError {
    PeerError::Description(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn offer_carries_an_audio_section() {
        let factory = RtcPeerFactory::new(RtcPeerConfig::localhost());
        let (events, _rx) = mpsc::unbounded_channel();
        let peer = factory.acquire(events).await.expect("acquire peer");

        let offer = peer.create_offer().await.expect("offer");

        assert_eq!(offer.kind, DescriptionKind::Offer);
        assert!(offer.sdp.contains("m=audio"), "sdp: {}", offer.sdp);
        peer.close().await.expect("close");
    }

    #[tokio::test]
    async fn garbage_candidate_is_an_error_not_a_panic() {
        let factory = RtcPeerFactory::new(RtcPeerConfig::localhost());
        let (events, _rx) = mpsc::unbounded_channel();
        let peer = factory.acquire(events).await.expect("acquire peer");

        let result = peer.add_ice_candidate(IceCandidate::new("not a candidate")).await;

        assert!(matches!(result, Err(PeerError::Candidate(_))));
        peer.close().await.expect("close");
    }
}
