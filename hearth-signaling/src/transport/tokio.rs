use crate::error::SignalingError;
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hearth_protocol::SignalEnvelope;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};
use url::Url;

/// WebSocket transport toward the room relay. One `connect` call opens one
/// channel addressed by room id appended to the base URL.
#[derive(Debug, Clone)]
pub struct TokioTransport {
    base_url: Url,
}

impl TokioTransport {
    pub fn new(base_url: Url) -> Self {
        Self { base_url }
    }

    fn room_url(&self, room_id: &str) -> Result<Url, SignalingError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("Base URL cannot carry a room path"))?
            .push(room_id);
        Ok(url)
    }
}

#[async_trait]
impl SignalingTransport for TokioTransport {
    type Sender = TokioSender;
    type Receiver = TokioReceiver;

    #[tracing::instrument(level = "info", skip(self), err)]
    async fn connect(
        &self,
        room_id: &str,
    ) -> Result<(Self::Sender, Self::Receiver), SignalingError> {
        let url = self.room_url(room_id)?;
        tracing::info!(%url, "Connecting to room relay");
        let (websocket_stream, response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|err| {
                tracing::error!(?err, "Failed to connect to room relay");
                SignalingError::Transport(Box::new(err.into()))
            })?;
        tracing::debug!(?response, "WebSocket handshake response");

        let (websocket_tx, websocket_rx) = websocket_stream.split();

        tracing::info!("Successfully established connection to room relay");
        Ok((
            TokioSender::new(websocket_tx),
            TokioReceiver::new(websocket_rx),
        ))
    }
}

pub struct TokioSender {
    websocket_tx: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>,
}

pub struct TokioReceiver {
    websocket_rx: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl TokioSender {
    fn new(
        websocket_tx: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>,
    ) -> Self {
        Self { websocket_tx }
    }
}

impl TokioReceiver {
    fn new(websocket_rx: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>) -> Self {
        Self { websocket_rx }
    }
}

#[async_trait]
impl SignalingSender for TokioSender {
    #[tracing::instrument(level = "debug", skip(self, msg), err)]
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), SignalingError> {
        if !matches!(
            msg,
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_)
        ) {
            tracing::trace!("Sending message to relay");
        }
        self.websocket_tx.send(msg).await.map_err(|err| {
            tracing::warn!(?err, "Failed to send message");
            SignalingError::Transport(Box::new(err.into()))
        })?;

        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn close(&mut self) -> Result<(), SignalingError> {
        let _ = self
            .websocket_tx
            .send(tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await
            .inspect_err(|err| {
                tracing::warn!(?err, "Failed to send Close frame");
            });

        self.websocket_tx.close().await.map_err(|err| {
            tracing::warn!(?err, "Failed to close WebSocket connection");
            SignalingError::Transport(Box::new(err.into()))
        })
    }
}

#[async_trait]
impl SignalingReceiver for TokioReceiver {
    #[tracing::instrument(level = "debug", skip(self, send_tx), err)]
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<SignalEnvelope, SignalingError> {
        while let Some(msg) = self.websocket_rx.next().await {
            match msg {
                Ok(tungstenite::Message::Text(text)) => {
                    tracing::debug!("Received message");
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
                        tracing::warn!(?err, "Failed to send Pong");
                        return Err(SignalingError::ChannelClosed);
                    }
                }
                Ok(tungstenite::Message::Pong(_)) => {}
                Ok(other) => {
                    tracing::debug!(?other, "Skipping non-text WebSocket frame");
                }
                Err(err) => {
                    tracing::warn!(?err, "Failed to receive message");
                    return Err(SignalingError::Transport(Box::new(err.into())));
                }
            }
        }
        tracing::warn!("WebSocket stream closed");
        Err(SignalingError::ChannelClosed)
    }
}
