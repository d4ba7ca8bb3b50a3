//! Seam between the negotiation core and the media engine.
//!
//! The session never talks to a concrete WebRTC stack; it drives
//! [`PeerConnection`] handles produced by a [`MediaEngine`]. Locally gathered
//! ICE candidates flow back through the channel supplied at connection
//! creation, keyed to the link that owns the connection, so the engine never
//! holds a back-reference into session state.

use crate::config::RtcConfig;
use crate::protocol::{CandidatePayload, SdpKind};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mock;
pub mod webrtc;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to create peer connection: {0}")]
    CreateConnection(String),
    #[error("offer creation failed: {0}")]
    CreateOffer(String),
    #[error("answer creation failed: {0}")]
    CreateAnswer(String),
    #[error("local description rejected: {0}")]
    SetLocalDescription(String),
    #[error("remote description rejected: {0}")]
    SetRemoteDescription(String),
    #[error("ice candidate rejected: {0}")]
    AddCandidate(String),
}

/// A discovered network path, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mline_index: u16,
    pub sdp_mid: String,
}

impl From<CandidatePayload> for IceCandidate {
    fn from(payload: CandidatePayload) -> Self {
        Self {
            candidate: payload.candidate,
            sdp_mline_index: payload.sdp_mline_index,
            sdp_mid: payload.sdp_mid,
        }
    }
}

impl From<IceCandidate> for CandidatePayload {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mline_index: candidate.sdp_mline_index,
            sdp_mid: candidate.sdp_mid,
        }
    }
}

/// Directions requested when answering a remote offer. The mesh design only
/// negotiates audio reception; video travels over separate publish paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerConstraints {
    pub receive_audio: bool,
    pub receive_video: bool,
}

impl Default for AnswerConstraints {
    fn default() -> Self {
        Self {
            receive_audio: true,
            receive_video: false,
        }
    }
}

/// Factory for per-peer connection handles.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Creates a connection configured with `config`. Candidates gathered by
    /// the engine for this connection are delivered through `candidates`;
    /// the sender may be dropped by the session at any time and the engine
    /// must tolerate failed sends.
    async fn create_connection(
        &self,
        config: &RtcConfig,
        candidates: mpsc::UnboundedSender<IceCandidate>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError>;
}

/// One direct connection to a remote participant. All methods may suspend;
/// completions re-enter the session's serialization context as events.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String, MediaError>;

    async fn create_answer(&self, constraints: AnswerConstraints) -> Result<String, MediaError>;

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<(), MediaError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Records a renewed relay credential for future connectivity-check
    /// cycles. Established connectivity is left alone.
    fn update_ice_credential(&self, credential: &str);

    async fn close(&self);
}
