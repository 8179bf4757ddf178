#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod tokio;

use crate::error::SignalingError;
use ::tokio::sync::mpsc;
use async_trait::async_trait;
use hearth_protocol::SignalEnvelope;
use tokio_tungstenite::tungstenite;

#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    type Sender: SignalingSender;
    type Receiver: SignalingReceiver;

    /// Opens one logical channel to the relay, scoped to `room_id`.
    async fn connect(
        &self,
        room_id: &str,
    ) -> Result<(Self::Sender, Self::Receiver), SignalingError>;
}

#[async_trait]
pub trait SignalingSender: Send + Sync + 'static {
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), SignalingError>;
    async fn close(&mut self) -> Result<(), SignalingError>;
}

#[async_trait]
pub trait SignalingReceiver: Send + Sync + 'static {
    /// Receives the next envelope from the relay. `send_tx` is used to answer
    /// transport-level control frames (Ping) without going through the caller.
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<SignalEnvelope, SignalingError>;
}
