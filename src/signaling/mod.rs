//! Signaling transport seam.
//!
//! The session owns exactly one transport per joined channel. Sends are
//! queued without suspension so the negotiation state machine can emit
//! messages mid-transition; delivery happens on the transport's own task.

use crate::protocol::SignalMessage;
use async_trait::async_trait;
use thiserror::Error;

pub mod mock;
pub mod websocket;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("signaling channel closed")]
    ChannelClosed,
}

/// A connected bidirectional message channel to the rendezvous server.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Queues a message for delivery. Fails only if the channel is gone.
    fn send(&self, message: SignalMessage) -> Result<(), SignalingError>;

    /// Next inbound message; `None` once the channel has closed.
    async fn recv(&mut self) -> Option<SignalMessage>;

    async fn close(&mut self);
}

/// Opens a fresh [`SignalingTransport`] for each `join`.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SignalingTransport>, SignalingError>;
}
