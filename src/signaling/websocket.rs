//! WebSocket signaling transport over tokio-tungstenite.

use super::{SignalingConnector, SignalingError, SignalingTransport};
use crate::protocol::SignalMessage;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Connector holding the rendezvous server address.
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: &str) -> Result<Self, SignalingError> {
        let url = Url::parse(url).map_err(|err| SignalingError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(SignalingError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {other}"),
            }),
        }
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn SignalingTransport>, SignalingError> {
        let transport = WebSocketSignaling::connect(self.url.as_str()).await?;
        Ok(Box::new(transport))
    }
}

pub struct WebSocketSignaling {
    outbound: mpsc::UnboundedSender<SignalMessage>,
    inbound: mpsc::UnboundedReceiver<SignalMessage>,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketSignaling {
    pub async fn connect(url: &str) -> Result<Self, SignalingError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        tracing::debug!(target = "mesh::signaling", url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<SignalMessage>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(
                            target = "mesh::signaling",
                            error = %err,
                            "failed to serialize signaling message"
                        );
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if forward_frame(&inbound_tx, &text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data) {
                            if forward_frame(&inbound_tx, &text).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(
                            target = "mesh::signaling",
                            error = %err,
                            "signaling websocket read failed"
                        );
                        break;
                    }
                }
            }
        });

        Ok(Self {
            outbound,
            inbound,
            tasks: vec![writer, reader],
        })
    }
}

fn forward_frame(
    inbound_tx: &mpsc::UnboundedSender<SignalMessage>,
    text: &str,
) -> Result<(), SignalingError> {
    match serde_json::from_str::<SignalMessage>(text) {
        Ok(message) => inbound_tx
            .send(message)
            .map_err(|_| SignalingError::ChannelClosed),
        Err(_) => {
            // Unrecognized message types are tolerated for forward
            // compatibility.
            tracing::trace!(
                target = "mesh::signaling",
                len = text.len(),
                "ignoring unrecognized signaling frame"
            );
            Ok(())
        }
    }
}

#[async_trait]
impl SignalingTransport for WebSocketSignaling {
    fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.outbound
            .send(message)
            .map_err(|_| SignalingError::ChannelClosed)
    }

    async fn recv(&mut self) -> Option<SignalMessage> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for WebSocketSignaling {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
