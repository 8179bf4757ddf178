#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use crate::config::{
    AUDIO_CHANNELS, AUDIO_SAMPLE_RATE, AUDIO_TRACK_ID, AUDIO_TRACK_STREAM_ID, FEED_CHANNEL_SIZE,
    FRAME_DURATION_MS,
};
use crate::error::WebrtcError;
use crate::peer::Peer;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, instrument};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub type EncodedAudioFrame = Bytes;

/// Boundary toward the local capture device. Acquisition is a scoped
/// resource: a failed `open` surfaces as
/// [`WebrtcError::MediaAcquisitionFailed`] and has no side effects on any
/// peer connection.
#[async_trait]
pub trait AudioSource: Send + Sync + 'static {
    async fn open(&self) -> Result<mpsc::Receiver<EncodedAudioFrame>, WebrtcError>;
}

/// Fans one capture stream out to any number of per-connection sender tasks.
pub struct TrackFeed {
    frames_tx: broadcast::Sender<EncodedAudioFrame>,
    pump_task: JoinHandle<()>,
}

impl TrackFeed {
    #[instrument(level = "trace", skip_all)]
    pub fn new(mut frames_rx: mpsc::Receiver<EncodedAudioFrame>) -> Self {
        let (frames_tx, _) = broadcast::channel(FEED_CHANNEL_SIZE);

        let tx = frames_tx.clone();
        let pump_task = tokio::spawn(
            async move {
                while let Some(frame) = frames_rx.recv().await {
                    if tx.receiver_count() == 0 {
                        continue;
                    }
                    let _ = tx.send(frame);
                }
                tracing::trace!("Capture stream ended");
            }
            .instrument(tracing::Span::current()),
        );

        Self {
            frames_tx,
            pump_task,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EncodedAudioFrame> {
        self.frames_tx.subscribe()
    }
}

impl Drop for TrackFeed {
    fn drop(&mut self) {
        self.pump_task.abort();
    }
}

/// Relates one attached outbound track to the connection it was attached to,
/// so a broadcast can be stopped per recipient by removing exactly the
/// matching track.
pub struct SenderBinding {
    user_id: String,
    peer: Arc<Peer>,
    sender: Arc<RTCRtpSender>,
    shutdown_tx: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl SenderBinding {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Removes the attached track from the connection and stops its
    /// forwarding task. The connection itself stays open.
    #[instrument(level = "debug", skip(self), fields(user_id = %self.user_id))]
    pub async fn detach(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.peer.remove_local_track(&self.sender).await {
            tracing::warn!(?err, "Failed to remove track from peer connection");
        }
        if let Err(err) = self.task.await
            && !err.is_cancelled()
        {
            tracing::warn!(?err, "Failed to join sender task");
        }
    }
}

/// Attaches the capture feed to every given connection, one Opus track and
/// sender per peer. A failure to attach to one connection is logged and
/// skipped; the remaining connections are unaffected.
#[instrument(level = "debug", skip_all)]
pub async fn attach_local_audio(peers: &[Arc<Peer>], feed: &TrackFeed) -> Vec<SenderBinding> {
    let mut bindings = Vec::with_capacity(peers.len());
    for peer in peers {
        match attach_to_peer(peer, feed).await {
            Ok(binding) => bindings.push(binding),
            Err(err) => {
                tracing::warn!(?err, user_id = peer.user_id(), "Failed to attach local audio");
            }
        }
    }
    tracing::debug!(count = bindings.len(), "Attached local audio");
    bindings
}

async fn attach_to_peer(peer: &Arc<Peer>, feed: &TrackFeed) -> Result<SenderBinding, WebrtcError> {
    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: AUDIO_SAMPLE_RATE,
            channels: AUDIO_CHANNELS,
            ..Default::default()
        },
        AUDIO_TRACK_ID.to_owned(),
        AUDIO_TRACK_STREAM_ID.to_owned(),
    ));

    let sender = peer
        .add_local_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(());
    let mut frames_rx = feed.subscribe();
    let cancel = peer.cancel_token();
    let task = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        tracing::trace!("Shutdown signalled, stopping sender task");
                        break;
                    }
                    _ = cancel.cancelled() => {
                        tracing::trace!("Peer torn down, stopping sender task");
                        break;
                    }
                    frame = frames_rx.recv() => {
                        match frame {
                            Ok(frame) => {
                                let sample = Sample {
                                    data: frame,
                                    duration: std::time::Duration::from_millis(FRAME_DURATION_MS),
                                    ..Default::default()
                                };

                                if let Err(err) = track.write_sample(&sample).await {
                                    tracing::warn!(?err, "Failed to write sample to track");
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "Sender task lagged behind capture feed");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                break;
                            }
                        }
                    }
                }
            }
        }
        .instrument(tracing::Span::current()),
    );

    Ok(SenderBinding {
        user_id: peer.user_id().to_string(),
        peer: Arc::clone(peer),
        sender,
        shutdown_tx,
        task,
    })
}

/// Renders inbound remote audio by forwarding RTP payloads to an output
/// queue. Arming is idempotent per track: a track already being rendered is
/// not consumed twice.
pub struct RemoteAudioRenderer {
    shutdown_tx: watch::Sender<()>,
}

impl RemoteAudioRenderer {
    #[instrument(level = "trace", skip_all)]
    pub fn arm(peer: &Peer, output_tx: mpsc::Sender<EncodedAudioFrame>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let rendered: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        peer.connection().on_track(Box::new(move |track, _, _| {
            if track.kind() != RTPCodecType::Audio {
                tracing::debug!(kind = ?track.kind(), "Ignoring non-audio track");
                return Box::pin(async {});
            }

            if !rendered.lock().insert(track.id()) {
                tracing::debug!(track_id = %track.id(), "Track already being rendered");
                return Box::pin(async {});
            }

            let output_tx = output_tx.clone();
            let mut shutdown_rx = shutdown_rx.clone();

            Box::pin(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            tracing::trace!("Shutdown signalled, stopping renderer");
                            break;
                        }
                        rtp = track.read_rtp() => {
                            match rtp {
                                Ok((packet, _)) => {
                                    if output_tx.send(packet.payload).await.is_err() {
                                        tracing::warn!("Failed to send received RTP packet to output");
                                        break;
                                    }
                                }
                                Err(err) => {
                                    tracing::warn!(?err, "Failed to read RTP packet");
                                    break;
                                }
                            }
                        }
                    }
                }
            })
        }));

        Self { shutdown_tx }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for RemoteAudioRenderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceConfig;
    use crate::media::mock::MockAudioSource;
    use pretty_assertions::assert_matches;
    use test_log::test;

    #[test(tokio::test)]
    async fn failed_acquisition_has_no_side_effects() {
        let source = MockAudioSource::failing();

        let result = source.open().await;
        assert_matches!(result, Err(WebrtcError::MediaAcquisitionFailed(_)));
    }

    #[test(tokio::test)]
    async fn attach_creates_one_binding_per_peer() {
        let peer1 = Arc::new(Peer::new("user1", IceConfig::none()).await.unwrap());
        let peer2 = Arc::new(Peer::new("user2", IceConfig::none()).await.unwrap());

        let source = MockAudioSource::with_frames(vec![Bytes::from_static(b"frame")]);
        let feed = TrackFeed::new(source.open().await.unwrap());

        let bindings = attach_local_audio(&[Arc::clone(&peer1), Arc::clone(&peer2)], &feed).await;
        assert_eq!(bindings.len(), 2);

        let mut bound: Vec<&str> = bindings.iter().map(SenderBinding::user_id).collect();
        bound.sort();
        assert_eq!(bound, vec!["user1", "user2"]);
    }

    #[test(tokio::test)]
    async fn detach_leaves_connection_open() {
        let peer = Arc::new(Peer::new("user1", IceConfig::none()).await.unwrap());

        let source = MockAudioSource::with_frames(Vec::new());
        let feed = TrackFeed::new(source.open().await.unwrap());

        let bindings = attach_local_audio(&[Arc::clone(&peer)], &feed).await;
        assert_eq!(bindings.len(), 1);

        for binding in bindings {
            binding.detach().await;
        }

        assert_ne!(peer.state(), crate::peer::NegotiationState::Closed);
    }

    #[test(tokio::test)]
    async fn attach_skips_closed_peer() {
        let open_peer = Arc::new(Peer::new("user1", IceConfig::none()).await.unwrap());
        let closed_peer = Arc::new(Peer::new("user2", IceConfig::none()).await.unwrap());
        closed_peer.close().await.unwrap();

        let source = MockAudioSource::with_frames(Vec::new());
        let feed = TrackFeed::new(source.open().await.unwrap());

        let bindings =
            attach_local_audio(&[Arc::clone(&open_peer), Arc::clone(&closed_peer)], &feed).await;

        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].user_id(), "user1");
    }
}
