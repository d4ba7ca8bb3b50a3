//! In-memory signaling transport for tests: a channel pair standing in for
//! the rendezvous server.

use super::{SignalingConnector, SignalingError, SignalingTransport};
use crate::protocol::SignalMessage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Client half; handed to the session by [`MockConnector`].
pub struct MockSignaling {
    outbound: mpsc::UnboundedSender<SignalMessage>,
    inbound: mpsc::UnboundedReceiver<SignalMessage>,
}

/// Server half; kept by the test to script inbound traffic and observe what
/// the session sends.
pub struct MockSignalingHandle {
    to_client: Option<mpsc::UnboundedSender<SignalMessage>>,
    from_client: mpsc::UnboundedReceiver<SignalMessage>,
}

pub fn pair() -> (MockSignaling, MockSignalingHandle) {
    let (to_client, inbound) = mpsc::unbounded_channel();
    let (outbound, from_client) = mpsc::unbounded_channel();
    (
        MockSignaling { outbound, inbound },
        MockSignalingHandle {
            to_client: Some(to_client),
            from_client,
        },
    )
}

impl MockSignalingHandle {
    /// Injects a message as if the server had sent it.
    pub fn deliver(&self, message: SignalMessage) {
        if let Some(to_client) = &self.to_client {
            let _ = to_client.send(message);
        }
    }

    /// Next message the session sent to the server.
    pub async fn sent(&mut self) -> Option<SignalMessage> {
        self.from_client.recv().await
    }

    pub fn try_sent(&mut self) -> Option<SignalMessage> {
        self.from_client.try_recv().ok()
    }

    /// Simulates the server dropping the connection.
    pub fn disconnect(&mut self) {
        self.to_client = None;
    }
}

#[async_trait]
impl SignalingTransport for MockSignaling {
    fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.outbound
            .send(message)
            .map_err(|_| SignalingError::ChannelClosed)
    }

    async fn recv(&mut self) -> Option<SignalMessage> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Connector that hands out pre-built transports, one per `join`.
#[derive(Default)]
pub struct MockConnector {
    transports: Mutex<VecDeque<MockSignaling>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a transport for the next connect, returning the server half.
    pub fn expect_connect(&self) -> MockSignalingHandle {
        let (transport, handle) = pair();
        self.transports.lock().push_back(transport);
        handle
    }
}

#[async_trait]
impl SignalingConnector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn SignalingTransport>, SignalingError> {
        match self.transports.lock().pop_front() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(SignalingError::Connect("no transport scripted".into())),
        }
    }
}
