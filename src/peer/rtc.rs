//! WebRTC Peer Links
//!
//! Erstellt `RTCPeerConnection`s mit den konfigurierten ICE Servern,
//! hängt die lokalen Tracks an und meldet Candidates, Remote Tracks und
//! Statuswechsel über den Event-Channel der Session.

use super::link::{
    LinkError, LinkEvent, LinkEventSender, LinkState, PeerConnector, PeerLink, SdpKind,
    StreamHandle,
};
use crate::config::IceServerConfig;
use crate::media::LocalMedia;
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

fn webrtc_err(e: webrtc::Error) -> LinkError {
    LinkError::WebRtc(e.to_string())
}

// ============================================================================
// CONNECTOR
// ============================================================================

/// Erstellt echte WebRTC Peer Connections
pub struct RtcConnector {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcConnector {
    pub fn new(ice_servers: &[IceServerConfig]) -> Self {
        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        Self { ice_servers }
    }

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, LinkError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(webrtc_err)?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        remote_id: &str,
        local_media: Option<Arc<LocalMedia>>,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, LinkError> {
        let pc = self.create_peer_connection().await?;
        install_handlers(&pc, remote_id, events);

        let mut senders = Vec::new();
        if let Some(media) = local_media {
            for track in media.tracks() {
                match pc.add_track(track).await {
                    Ok(sender) => senders.push(sender),
                    Err(e) => {
                        let _ = pc.close().await;
                        return Err(webrtc_err(e));
                    }
                }
            }
        }

        tracing::debug!(remote_id, tracks = senders.len(), "Peer connection created");

        Ok(Arc::new(RtcPeerLink {
            remote_id: remote_id.to_string(),
            pc,
            senders: Mutex::new(senders),
        }))
    }
}

/// Registriert Event Handler für die Peer Connection
fn install_handlers(pc: &Arc<RTCPeerConnection>, remote_id: &str, events: LinkEventSender) {
    let state_events = events.clone();
    let peer = remote_id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!(remote_id = %peer, "Peer connection state: {:?}", s);

        let state = match s {
            RTCPeerConnectionState::New => Some(LinkState::New),
            RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
            RTCPeerConnectionState::Connected => Some(LinkState::Connected),
            RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
            RTCPeerConnectionState::Failed => Some(LinkState::Failed),
            RTCPeerConnectionState::Closed => Some(LinkState::Closed),
            _ => None,
        };
        if let Some(state) = state {
            let _ = state_events.send(LinkEvent::StateChanged(state));
        }

        Box::pin(async {})
    }));

    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => {
                    let _ = candidate_events.send(LinkEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let track_events = events;
    pc.on_track(Box::new(move |track, _, _| {
        tracing::info!(
            stream_id = %track.stream_id(),
            "Received remote track: {:?}",
            track.codec().capability.mime_type
        );
        let _ = track_events.send(LinkEvent::RemoteTrack(StreamHandle::from_remote(&track)));
        Box::pin(async {})
    }));
}

// ============================================================================
// PEER LINK
// ============================================================================

pub struct RtcPeerLink {
    remote_id: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

impl RtcPeerLink {
    /// Ohne lokale Tracks braucht das Offer Receive-Only Transceiver,
    /// sonst enthält es keine Media-Sections.
    async fn ensure_receive_transceivers(&self) -> Result<(), LinkError> {
        if !self.pc.get_transceivers().await.is_empty() {
            return Ok(());
        }
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(webrtc_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self) -> Result<String, LinkError> {
        self.ensure_receive_transceivers().await?;

        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, LinkError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), LinkError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| LinkError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(webrtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| LinkError::InvalidCandidate(e.to_string()))
    }

    async fn close(&self) {
        let senders: Vec<_> = self.senders.lock().drain(..).collect();
        for sender in senders {
            if let Err(e) = self.pc.remove_track(&sender).await {
                tracing::debug!(remote_id = %self.remote_id, "Failed to detach track: {}", e);
            }
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!(remote_id = %self.remote_id, "Failed to close peer connection: {}", e);
        }
    }
}

impl std::fmt::Debug for RtcPeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcPeerLink")
            .field("remote_id", &self.remote_id)
            .field("state", &self.pc.connection_state())
            .finish()
    }
}
