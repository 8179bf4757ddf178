use crate::config::{IceConfig, IntoRtc, PEER_EVENTS_CAPACITY};
use crate::error::WebrtcError;
use anyhow::Context;
use hearth_protocol::{IceCandidate, SessionDescription};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

pub type PeerConnectionState = RTCPeerConnectionState;

/// Negotiation progress of a single peer connection. Variants are ordered by
/// progress; the state only ever advances, except for the terminal [`Closed`]
/// which is entered unconditionally on any removal trigger.
///
/// [`Closed`]: NegotiationState::Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NegotiationState {
    /// Connection object exists, no description has been exchanged yet.
    Created,
    /// Broadcaster side: local offer stored, waiting for the answer.
    OfferSent,
    /// Receiver side: remote offer applied, answer being generated.
    OfferReceived,
    /// The answer has been applied on this side.
    Answered,
    /// The underlying transport reported a connected pair.
    Established,
    /// Terminal. Set on removal, explicit stop, or transport closure.
    Closed,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    ConnectionState(PeerConnectionState),
    IceCandidate(IceCandidate),
}

/// A negotiated transport toward exactly one remote user.
///
/// Each side of a logical link holds its own independent `Peer`; there is no
/// cross-participant sharing. Ownership lives in the
/// [`PeerRegistry`](crate::registry::PeerRegistry) of the local participant.
#[derive(Debug)]
pub struct Peer {
    user_id: String,
    peer_connection: RTCPeerConnection,
    state: Mutex<NegotiationState>,
    /// Candidates that arrived before a remote description existed. The RTC
    /// stack rejects early candidates, so they are held back and applied
    /// once the remote description is in place.
    pending_candidates: Mutex<Vec<IceCandidate>>,
    events_tx: broadcast::Sender<PeerEvent>,
    cancel: CancellationToken,
}

impl Peer {
    #[instrument(level = "debug", skip(config), err)]
    pub async fn new(user_id: &str, config: IceConfig) -> Result<Self, WebrtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register default codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register default interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api
            .new_peer_connection(config.into_rtc())
            .await
            .context("Failed to create peer connection")?;

        let (events_tx, _) = broadcast::channel(PEER_EVENTS_CAPACITY);

        {
            let events_tx = events_tx.clone();
            peer_connection.on_peer_connection_state_change(Box::new(
                move |state: RTCPeerConnectionState| {
                    tracing::trace!(?state, "Peer connection state changed");
                    if events_tx.receiver_count() > 0
                        && let Err(err) = events_tx.send(PeerEvent::ConnectionState(state))
                    {
                        tracing::warn!(?err, "Failed to send peer connection state event");
                    }
                    Box::pin(async {})
                },
            ));
        }

        {
            let events_tx = events_tx.clone();
            peer_connection.on_ice_candidate(Box::new(
                move |candidate: Option<RTCIceCandidate>| {
                    if let Some(candidate) = candidate {
                        tracing::trace!(?candidate, "ICE candidate gathered");
                        match candidate.to_json() {
                            Ok(init) => {
                                let candidate = IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                    username_fragment: init.username_fragment,
                                };
                                if events_tx.receiver_count() > 0
                                    && let Err(err) =
                                        events_tx.send(PeerEvent::IceCandidate(candidate))
                                {
                                    tracing::warn!(?err, "Failed to send ICE candidate event");
                                }
                            }
                            Err(err) => {
                                tracing::warn!(?err, "Failed to convert ICE candidate");
                            }
                        }
                    }
                    Box::pin(async {})
                },
            ));
        }

        Ok(Self {
            user_id: user_id.to_string(),
            peer_connection,
            state: Mutex::new(NegotiationState::Created),
            pending_candidates: Mutex::new(Vec::new()),
            events_tx,
            cancel: CancellationToken::new(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.lock()
    }

    /// Token cancelled when this connection is torn down. Any task suspended
    /// on behalf of this connection must abandon its work when it fires.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribes to a broadcast channel emitting [`PeerEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    pub(crate) fn connection(&self) -> &RTCPeerConnection {
        &self.peer_connection
    }

    /// Generates a local offer and stores it as the local description.
    #[instrument(level = "trace", skip(self), fields(user_id = %self.user_id), err)]
    pub async fn create_offer(&self) -> Result<SessionDescription, WebrtcError> {
        self.ensure_open()?;
        tracing::trace!("Creating SDP offer");

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .context("Failed to set offer as local description")?;

        let local_description = self
            .peer_connection
            .local_description()
            .await
            .context("Failed to get local description")?;

        self.advance_state(NegotiationState::OfferSent);

        tracing::trace!("Created SDP offer");
        Ok(SessionDescription {
            sdp_type: local_description.sdp_type.to_string(),
            sdp: local_description.sdp,
        })
    }

    /// Applies a remote offer and generates the matching answer, storing it
    /// as the local description.
    #[instrument(level = "trace", skip(self, offer), fields(user_id = %self.user_id), err)]
    pub async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, WebrtcError> {
        self.ensure_open()?;
        tracing::trace!("Creating SDP answer");

        self.peer_connection
            .set_remote_description(to_rtc_description(offer)?)
            .await
            .context("Failed to set offer as remote description")?;
        self.advance_state(NegotiationState::OfferReceived);
        self.drain_pending_candidates().await;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        self.peer_connection
            .set_local_description(answer)
            .await
            .context("Failed to set answer as local description")?;

        let answer = self
            .peer_connection
            .local_description()
            .await
            .context("Failed to get local description for answer")?;

        self.advance_state(NegotiationState::Answered);

        tracing::trace!("Created SDP answer");
        Ok(SessionDescription {
            sdp_type: answer.sdp_type.to_string(),
            sdp: answer.sdp,
        })
    }

    /// Applies a remote answer to a previously sent offer.
    #[instrument(level = "trace", skip(self, answer), fields(user_id = %self.user_id), err)]
    pub async fn accept_answer(&self, answer: &SessionDescription) -> Result<(), WebrtcError> {
        self.ensure_open()?;
        tracing::trace!("Accepting SDP answer");

        self.peer_connection
            .set_remote_description(to_rtc_description(answer)?)
            .await
            .context("Failed to set answer as remote description")?;
        self.advance_state(NegotiationState::Answered);
        self.drain_pending_candidates().await;

        tracing::trace!("Accepted SDP answer");
        Ok(())
    }

    /// Adds a trickled remote candidate. Accepted in any non-closed state;
    /// candidates arriving before the remote description are queued and
    /// applied once it exists. Never regresses the negotiation state.
    #[instrument(level = "trace", skip(self, candidate), fields(user_id = %self.user_id), err)]
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), WebrtcError> {
        self.ensure_open()?;

        if self.peer_connection.remote_description().await.is_none() {
            tracing::trace!("No remote description yet, queueing ICE candidate");
            self.pending_candidates.lock().push(candidate);
            return Ok(());
        }

        self.apply_candidate(&candidate).await
    }

    /// Marks the connection as established after the transport reported a
    /// connected pair.
    pub fn mark_established(&self) {
        self.advance_state(NegotiationState::Established);
    }

    /// Closes the connection. Terminal: any state transitions to
    /// [`NegotiationState::Closed`] and pending per-connection work is
    /// cancelled.
    #[instrument(level = "debug", skip(self), fields(user_id = %self.user_id), err)]
    pub async fn close(&self) -> Result<(), WebrtcError> {
        tracing::debug!("Closing peer");
        self.cancel.cancel();
        *self.state.lock() = NegotiationState::Closed;
        self.pending_candidates.lock().clear();

        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")?;

        tracing::trace!("Successfully closed peer connection");
        Ok(())
    }

    pub(crate) async fn add_local_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<Arc<RTCRtpSender>, WebrtcError> {
        self.ensure_open()?;
        let sender = self
            .peer_connection
            .add_track(track)
            .await
            .context("Failed to add track to peer connection")?;
        Ok(sender)
    }

    pub(crate) async fn remove_local_track(
        &self,
        sender: &Arc<RTCRtpSender>,
    ) -> Result<(), WebrtcError> {
        self.peer_connection
            .remove_track(sender)
            .await
            .context("Failed to remove track from peer connection")?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), WebrtcError> {
        if *self.state.lock() == NegotiationState::Closed {
            return Err(WebrtcError::ConnectionClosed);
        }
        Ok(())
    }

    fn advance_state(&self, to: NegotiationState) {
        let mut state = self.state.lock();
        if *state == NegotiationState::Closed || to <= *state {
            return;
        }
        *state = to;
    }

    async fn apply_candidate(&self, candidate: &IceCandidate) -> Result<(), WebrtcError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await
            .context("Failed to add remote ICE candidate")?;
        Ok(())
    }

    async fn drain_pending_candidates(&self) {
        let pending = std::mem::take(&mut *self.pending_candidates.lock());
        if pending.is_empty() {
            return;
        }
        tracing::trace!(count = pending.len(), "Applying queued ICE candidates");
        for candidate in pending {
            if let Err(err) = self.apply_candidate(&candidate).await {
                tracing::warn!(?err, "Failed to apply queued ICE candidate");
            }
        }
    }
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, WebrtcError> {
    let result = match desc.sdp_type.as_str() {
        "offer" => RTCSessionDescription::offer(desc.sdp.clone()),
        "answer" => RTCSessionDescription::answer(desc.sdp.clone()),
        other => {
            return Err(
                anyhow::anyhow!("Unsupported session description type: {other}").into(),
            );
        }
    };
    result
        .context("Failed to parse session description")
        .map_err(Into::into)
}
