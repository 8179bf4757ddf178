use crate::error::SignalingError;
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use hearth_protocol::SignalEnvelope;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

const BROADCAST_CHANNEL_SIZE: usize = 100;
const SEND_CHANNEL_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// An envelope delivered by the relay, in arrival order.
    Envelope(SignalEnvelope),
    /// The channel became unusable. No further envelopes will be delivered
    /// and subsequent sends fail with [`SignalingError::ChannelClosed`].
    Closed,
}

/// A persistent, bidirectional signaling channel scoped to one room.
///
/// Owns one connected transport plus a reader and a writer task. Inbound
/// envelopes are fanned out to subscribers in arrival order; the relay does
/// not guarantee cross-envelope ordering beyond that. There is no automatic
/// reconnection: once closed, the channel is spent and the room-session owner
/// must establish a fresh one and re-derive its state from scratch.
pub struct RoomChannel {
    room_id: String,
    send_tx: Mutex<Option<mpsc::Sender<tungstenite::Message>>>,
    broadcast_tx: broadcast::Sender<ChannelEvent>,
    close_token: CancellationToken,
    worker_tasks: Mutex<JoinSet<()>>,
}

impl RoomChannel {
    #[instrument(level = "debug", skip(transport, shutdown_token))]
    pub async fn connect<T: SignalingTransport>(
        transport: &T,
        room_id: &str,
        shutdown_token: &CancellationToken,
    ) -> Result<Self, SignalingError> {
        tracing::trace!("Connecting to room relay");
        let (sender, receiver) = transport.connect(room_id).await?;

        let (send_tx, send_rx) = mpsc::channel::<tungstenite::Message>(SEND_CHANNEL_SIZE);
        let broadcast_tx = broadcast::channel(BROADCAST_CHANNEL_SIZE).0;
        let close_token = shutdown_token.child_token();

        tracing::trace!("Successfully connected to room relay, starting worker tasks");
        let mut worker_tasks = JoinSet::new();
        worker_tasks.spawn(Self::reader_task(
            receiver,
            send_tx.clone(),
            broadcast_tx.clone(),
            close_token.clone(),
        ));
        worker_tasks.spawn(Self::writer_task(
            sender,
            send_rx,
            broadcast_tx.clone(),
            close_token.clone(),
        ));

        Ok(Self {
            room_id: room_id.to_string(),
            send_tx: Mutex::new(Some(send_tx)),
            broadcast_tx,
            close_token,
            worker_tasks: Mutex::new(worker_tasks),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Subscribes to a broadcast channel emitting [`ChannelEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.broadcast_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.close_token.is_cancelled()
    }

    #[instrument(level = "debug", skip(self, envelope), err)]
    pub async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        if self.is_closed() {
            tracing::warn!("Tried to send envelope over a closed channel");
            return Err(SignalingError::ChannelClosed);
        }

        let send_tx = {
            self.send_tx
                .lock()
                .as_ref()
                .cloned()
                .ok_or(SignalingError::ChannelClosed)?
        };

        let serialized = SignalEnvelope::serialize(&envelope).map_err(|err| {
            tracing::warn!(?err, "Failed to serialize envelope");
            SignalingError::Serialization(err.to_string())
        })?;

        tracing::debug!("Sending envelope to send channel");
        send_tx
            .send(tungstenite::Message::from(serialized))
            .await
            .map_err(|_| SignalingError::ChannelClosed)
    }

    /// Closes the channel and waits for the worker tasks to finish. The
    /// writer sends a Close frame toward the relay before shutting down.
    #[instrument(level = "debug", skip(self))]
    pub async fn close(&self) {
        self.close_token.cancel();
        self.send_tx.lock().take();

        if self.broadcast_tx.receiver_count() > 0 {
            let _ = self.broadcast_tx.send(ChannelEvent::Closed);
        }

        let mut worker_tasks = {
            let mut worker_tasks = self.worker_tasks.lock();
            std::mem::replace(&mut *worker_tasks, JoinSet::new())
        };

        tracing::trace!("Waiting for worker tasks to finish");
        while let Some(res) = worker_tasks.join_next().await {
            if let Err(err) = res
                && !err.is_cancelled()
            {
                tracing::warn!(?err, "Failed to join worker task");
            }
        }

        tracing::debug!("Finished closing channel");
    }

    #[instrument(level = "debug", skip_all)]
    fn reader_task<R: SignalingReceiver>(
        mut receiver: R,
        send_tx: mpsc::Sender<tungstenite::Message>,
        broadcast_tx: broadcast::Sender<ChannelEvent>,
        close_token: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move {
            tracing::debug!("Starting transport reader task");
            let _guard = TaskDropLogger::new("reader");

            loop {
                tokio::select! {
                    biased;

                    _ = close_token.cancelled() => {
                        tracing::debug!("Close signal received, exiting transport reader task");
                        break;
                    }

                    msg = receiver.recv(&send_tx) => {
                        match msg {
                            Ok(envelope) => {
                                if broadcast_tx.receiver_count() > 0 {
                                    tracing::trace!(?envelope, "Broadcasting envelope");
                                    if let Err(err) = broadcast_tx.send(ChannelEvent::Envelope(envelope.clone())) {
                                        tracing::warn!(?envelope, ?err, "Failed to broadcast envelope");
                                    }
                                } else {
                                    tracing::trace!(?envelope, "No receivers subscribed, not broadcasting envelope");
                                }
                            }
                            Err(err) => {
                                tracing::warn!(?err, "Transport receive failed, closing channel");
                                close_token.cancel();
                                let _ = broadcast_tx.send(ChannelEvent::Closed);
                                break;
                            }
                        }
                    }
                }
            }
        }.instrument(tracing::Span::current())
    }

    #[instrument(level = "debug", skip_all)]
    fn writer_task<S: SignalingSender>(
        mut sender: S,
        mut send_rx: mpsc::Receiver<tungstenite::Message>,
        broadcast_tx: broadcast::Sender<ChannelEvent>,
        close_token: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move {
            tracing::debug!("Starting transport writer task");
            let _guard = TaskDropLogger::new("writer");

            loop {
                tokio::select! {
                    biased;

                    _ = close_token.cancelled() => {
                        tracing::debug!("Close signal received, closing sender");

                        if let Err(err) = sender.close().await {
                            tracing::warn!(?err, "Failed to close transport");
                        }

                        tracing::debug!("Successfully closed sender, exiting transport writer task");
                        break;
                    }

                    msg = send_rx.recv() => {
                        match msg {
                            Some(msg) => {
                                if !matches!(msg, tungstenite::Message::Pong(_)) {
                                    tracing::debug!(?msg, "Sending message to transport");
                                }

                                if let Err(err) = sender.send(msg).await {
                                    tracing::warn!(?err, "Transport send failed, closing channel");
                                    close_token.cancel();
                                    let _ = broadcast_tx.send(ChannelEvent::Closed);
                                    break;
                                }
                            },
                            None => {
                                close_token.cancel();
                                break;
                            }
                        }
                    }
                }
            }
        }.instrument(tracing::Span::current())
    }
}

impl Drop for RoomChannel {
    fn drop(&mut self) {
        self.close_token.cancel();
    }
}

struct TaskDropLogger {
    name: &'static str,
}

impl TaskDropLogger {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Drop for TaskDropLogger {
    fn drop(&mut self) {
        tracing::trace!(task_name = ?self.name, "Task dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecvWithTimeoutExt;
    use crate::transport::mock::MockTransport;
    use pretty_assertions::assert_matches;
    use std::time::Duration;
    use test_log::test;

    async fn setup_test_channel(transport: &MockTransport) -> (RoomChannel, CancellationToken) {
        let shutdown_token = CancellationToken::new();
        let channel = RoomChannel::connect(transport, "room1", &shutdown_token)
            .await
            .expect("Channel failed to connect");
        (channel, shutdown_token)
    }

    #[test(tokio::test)]
    async fn connect() {
        let transport = MockTransport::default();
        let (channel, _shutdown_token) = setup_test_channel(&transport).await;
        assert!(!channel.is_closed());
        assert_eq!(channel.room_id(), "room1");
    }

    #[test(tokio::test)]
    async fn send() {
        let transport = MockTransport::default();
        let mut outgoing_rx = transport.outgoing_tx.subscribe();
        let (channel, _shutdown_token) = setup_test_channel(&transport).await;

        let envelope = SignalEnvelope::StartedBroadcast;
        let serialized =
            tungstenite::Message::from(SignalEnvelope::serialize(&envelope).unwrap());

        channel.send(envelope).await.unwrap();

        let sent = outgoing_rx
            .recv_with_timeout(Duration::from_millis(100), |m| m == &serialized)
            .await;
        assert!(sent.is_ok());
    }

    #[test(tokio::test)]
    async fn recv() {
        let transport = MockTransport::default();
        let (channel, _shutdown_token) = setup_test_channel(&transport).await;

        let mut events = channel.subscribe();
        let envelope = SignalEnvelope::UserJoined {
            user_id: "user2".to_string(),
        };
        transport.push_envelope(&envelope).unwrap();

        let event = events
            .recv_with_timeout(Duration::from_millis(100), |e| {
                matches!(e, ChannelEvent::Envelope(_))
            })
            .await
            .unwrap();
        assert_eq!(event, ChannelEvent::Envelope(envelope));
    }

    #[test(tokio::test)]
    async fn send_after_close() {
        let transport = MockTransport::default();
        let (channel, _shutdown_token) = setup_test_channel(&transport).await;

        channel.close().await;

        let result = channel.send(SignalEnvelope::StartedBroadcast).await;
        assert_matches!(result, Err(SignalingError::ChannelClosed));
    }

    #[test(tokio::test)]
    async fn send_after_shutdown() {
        let transport = MockTransport::default();
        let (channel, shutdown_token) = setup_test_channel(&transport).await;

        shutdown_token.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = channel.send(SignalEnvelope::StartedBroadcast).await;
        assert_matches!(result, Err(SignalingError::ChannelClosed));
    }

    #[test(tokio::test)]
    async fn transport_disconnect_emits_closed() {
        let transport = MockTransport::default();
        let (channel, _shutdown_token) = setup_test_channel(&transport).await;

        let mut events = channel.subscribe();
        transport.disconnect_token().cancel();

        let event = events
            .recv_with_timeout(Duration::from_millis(100), |e| {
                matches!(e, ChannelEvent::Closed)
            })
            .await;
        assert!(event.is_ok());

        let result = channel.send(SignalEnvelope::StartedBroadcast).await;
        assert_matches!(result, Err(SignalingError::ChannelClosed));
    }

    #[test(tokio::test)]
    async fn envelopes_delivered_in_arrival_order() {
        let transport = MockTransport::default();
        let (channel, _shutdown_token) = setup_test_channel(&transport).await;

        let mut events = channel.subscribe();
        for i in 0..5 {
            transport
                .push_envelope(&SignalEnvelope::UserJoined {
                    user_id: format!("user{i}"),
                })
                .unwrap();
        }

        for i in 0..5 {
            let event = events
                .recv_with_timeout(Duration::from_millis(100), |e| {
                    matches!(e, ChannelEvent::Envelope(_))
                })
                .await
                .unwrap();
            assert_eq!(
                event,
                ChannelEvent::Envelope(SignalEnvelope::UserJoined {
                    user_id: format!("user{i}"),
                })
            );
        }
    }
}
