//! Signaling and connection orchestration for a full-mesh WebRTC channel.
//!
//! A [`MeshSession`] joins a named channel through a rendezvous server,
//! learns who else is present, and negotiates one peer connection per
//! remote participant: SDP offer/answer with a deterministic offer role
//! (the lexicographically lower participant id offers) and trickled ICE
//! candidates buffered until each side is ready for them.
//!
//! The media engine and the signaling transport sit behind traits, so the
//! whole negotiation layer runs against in-process mocks in tests and
//! against [`media::webrtc::WebRtcEngine`] plus
//! [`signaling::websocket::WebSocketConnector`] in production.

pub mod config;
pub mod media;
pub mod protocol;
pub mod session;
pub mod signaling;

pub use config::{IceServer, RtcConfig};
pub use media::{AnswerConstraints, IceCandidate, MediaEngine, MediaError, PeerConnection};
pub use protocol::{ParticipantId, SignalMessage};
pub use session::{MeshEvent, MeshSession, SessionError};
pub use signaling::{SignalingConnector, SignalingError, SignalingTransport};
