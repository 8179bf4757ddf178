use crate::error::SignalingError;
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use async_trait::async_trait;
use hearth_protocol::SignalEnvelope;
use std::sync::Arc;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

const MOCK_CHANNEL_SIZE: usize = 64;

/// In-memory transport for tests.
///
/// `incoming_tx` feeds frames to the client under test, `outgoing_tx` fans
/// out every frame the client sends, `ready` fires once `connect` has been
/// called, and the disconnect token simulates a relay-side connection loss.
#[derive(Clone)]
pub struct MockTransport {
    pub incoming_tx: broadcast::Sender<tungstenite::Message>,
    pub outgoing_tx: broadcast::Sender<tungstenite::Message>,
    pub ready: Arc<Notify>,
    disconnect_token: CancellationToken,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            incoming_tx: broadcast::channel(MOCK_CHANNEL_SIZE).0,
            outgoing_tx: broadcast::channel(MOCK_CHANNEL_SIZE).0,
            ready: Arc::new(Notify::new()),
            disconnect_token: CancellationToken::new(),
        }
    }
}

impl MockTransport {
    pub fn disconnect_token(&self) -> CancellationToken {
        self.disconnect_token.clone()
    }

    /// Feeds an envelope to the client under test as a text frame.
    pub fn push_envelope(&self, envelope: &SignalEnvelope) -> Result<(), SignalingError> {
        let serialized = SignalEnvelope::serialize(envelope)
            .map_err(|err| SignalingError::Serialization(err.to_string()))?;
        let _ = self
            .incoming_tx
            .send(tungstenite::Message::from(serialized));
        Ok(())
    }
}

pub struct MockSender {
    outgoing_tx: broadcast::Sender<tungstenite::Message>,
}

pub struct MockReceiver {
    incoming_rx: broadcast::Receiver<tungstenite::Message>,
    disconnect_token: CancellationToken,
}

#[async_trait]
impl SignalingTransport for MockTransport {
    type Sender = MockSender;
    type Receiver = MockReceiver;

    #[tracing::instrument(level = "debug", skip(self))]
    async fn connect(
        &self,
        room_id: &str,
    ) -> Result<(Self::Sender, Self::Receiver), SignalingError> {
        tracing::debug!(room_id, "Connecting mock transport");
        let sender = MockSender {
            outgoing_tx: self.outgoing_tx.clone(),
        };
        let receiver = MockReceiver {
            incoming_rx: self.incoming_tx.subscribe(),
            disconnect_token: self.disconnect_token.clone(),
        };
        self.ready.notify_one();
        Ok((sender, receiver))
    }
}

#[async_trait]
impl SignalingSender for MockSender {
    #[tracing::instrument(level = "debug", skip(self, msg))]
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), SignalingError> {
        // No subscribers just means no test is observing the outgoing side.
        let _ = self.outgoing_tx.send(msg);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn close(&mut self) -> Result<(), SignalingError> {
        tracing::debug!("Closing mock sender");
        Ok(())
    }
}

#[async_trait]
impl SignalingReceiver for MockReceiver {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<SignalEnvelope, SignalingError> {
        loop {
            tokio::select! {
                biased;

                _ = self.disconnect_token.cancelled() => {
                    tracing::debug!("Mock transport disconnected");
                    return Err(SignalingError::ChannelClosed);
                }

                msg = self.incoming_rx.recv() => {
                    match msg {
                        Ok(tungstenite::Message::Text(text)) => {
                            return SignalEnvelope::deserialize(&text).map_err(|err| {
                                tracing::warn!(?err, "Failed to deserialize envelope");
                                SignalingError::Serialization(err.to_string())
                            });
                        }
                        Ok(tungstenite::Message::Close(reason)) => {
                            tracing::warn!(?reason, "Received Close WebSocket frame");
                            return Err(SignalingError::ChannelClosed);
                        }
                        Ok(tungstenite::Message::Ping(data)) => {
                            if let Err(err) = send_tx.send(tungstenite::Message::Pong(data)).await {
                                tracing::warn!(?err, "Failed to send mock Pong");
                                return Err(SignalingError::ChannelClosed);
                            }
                        }
                        Ok(other) => {
                            tracing::debug!(?other, "Skipping non-text WebSocket frame");
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Mock receiver lagged behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(SignalingError::ChannelClosed);
                        }
                    }
                }
            }
        }
    }
}
