//! Media engine backed by the `webrtc` crate.

use super::{AnswerConstraints, IceCandidate, MediaEngine, MediaError, PeerConnection};
use crate::config::RtcConfig;
use crate::protocol::SdpKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Engine producing `webrtc`-crate peer connections.
#[derive(Default)]
pub struct WebRtcEngine;

impl WebRtcEngine {
    pub fn new() -> Self {
        Self
    }
}

fn rtc_configuration(config: &RtcConfig) -> RTCConfiguration {
    let ice_servers = config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();
    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_connection(
        &self,
        config: &RtcConfig,
        candidates: mpsc::UnboundedSender<IceCandidate>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let api = APIBuilder::new().build();
        let peer_connection = api
            .new_peer_connection(rtc_configuration(config))
            .await
            .map_err(|err| MediaError::CreateConnection(err.to_string()))?;
        let peer_connection = Arc::new(peer_connection);

        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidates = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    // End-of-gathering marker.
                    return;
                };
                match candidate.to_json() {
                    Ok(json) => {
                        let forwarded = candidates.send(IceCandidate {
                            candidate: json.candidate,
                            sdp_mline_index: json.sdp_mline_index.unwrap_or(0),
                            sdp_mid: json.sdp_mid.unwrap_or_default(),
                        });
                        if forwarded.is_err() {
                            tracing::debug!(
                                target = "mesh::media",
                                "candidate channel closed; dropping local candidate"
                            );
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "mesh::media",
                            error = %err,
                            "failed to serialize local ice candidate"
                        );
                    }
                }
            })
        }));

        Ok(Arc::new(WebRtcConnection {
            peer_connection,
            renewed_credential: Mutex::new(None),
        }))
    }
}

pub struct WebRtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    /// Credential received mid-session; applied to future connectivity
    /// attempts only, never to the live ICE agent.
    renewed_credential: Mutex<Option<String>>,
}

fn session_description(kind: SdpKind, sdp: String) -> Result<RTCSessionDescription, webrtc::Error> {
    match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<String, MediaError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|err| MediaError::CreateOffer(err.to_string()))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self, constraints: AnswerConstraints) -> Result<String, MediaError> {
        if constraints.receive_video {
            tracing::debug!(
                target = "mesh::media",
                "video reception requested; answer directions follow the remote offer"
            );
        }
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|err| MediaError::CreateAnswer(err.to_string()))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<(), MediaError> {
        let description = session_description(kind, sdp)
            .map_err(|err| MediaError::SetLocalDescription(err.to_string()))?;
        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|err| MediaError::SetLocalDescription(err.to_string()))
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), MediaError> {
        let description = session_description(kind, sdp)
            .map_err(|err| MediaError::SetRemoteDescription(err.to_string()))?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|err| MediaError::SetRemoteDescription(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.sdp_mid),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|err| MediaError::AddCandidate(err.to_string()))
    }

    fn update_ice_credential(&self, credential: &str) {
        *self.renewed_credential.lock() = Some(credential.to_string());
        tracing::debug!(
            target = "mesh::media",
            "recorded renewed relay credential for future connectivity checks"
        );
    }

    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            tracing::debug!(target = "mesh::media", error = %err, "peer connection close failed");
        }
    }
}
