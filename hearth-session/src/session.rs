use crate::error::SessionError;
use crate::role::{Role, RoomInfo};
use hearth_protocol::{IceCandidate, SessionDescription, SignalEnvelope};
use hearth_signaling::channel::{ChannelEvent, RoomChannel};
use hearth_signaling::transport::SignalingTransport;
use hearth_webrtc::IceConfig;
use hearth_webrtc::media::{
    AudioSource, EncodedAudioFrame, RemoteAudioRenderer, SenderBinding, TrackFeed,
    attach_local_audio,
};
use hearth_webrtc::peer::{NegotiationState, Peer, PeerConnectionState, PeerEvent};
use hearth_webrtc::registry::PeerRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

const COMMAND_CHANNEL_SIZE: usize = 16;
const EVENTS_CHANNEL_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// React to a `started-broadcast` announcement by listening immediately,
    /// without an explicit `listen_to_broadcaster` call.
    pub listen_on_broadcast: bool,
    pub ice: IceConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            listen_on_broadcast: false,
            ice: IceConfig::default(),
        }
    }
}

/// Events surfaced to the embedding layer (e.g. for presence indicators and
/// per-participant failure hints).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A peer connection reached a connected transport pair.
    PeerConnected { user_id: String },
    /// A peer connection lost its transport pair.
    PeerDisconnected { user_id: String },
    /// Negotiation with one peer failed. That participant's audio is
    /// unavailable; the rest of the session is unaffected.
    NegotiationFailed { user_id: String },
    /// The broadcaster announced its outbound audio.
    BroadcastStarted,
    /// The signaling channel is gone and the session has shut down.
    ChannelClosed,
}

/// Point-in-time view of one registry entry, for presence indicators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub user_id: String,
    pub state: NegotiationState,
}

enum Command {
    StartBroadcasting {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StopBroadcasting {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    ListenToBroadcaster {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StopListening {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// One voice session scoped to one room membership.
///
/// Owns the signaling channel and the peer registry, both constructed at
/// join time and torn down together; nothing is shared across rooms. All
/// envelope handling and registry mutation happens on a single coordinator
/// task, in transport-delivery order. Public operations are bridged into
/// that task over a command queue, so they observe the same serialization.
pub struct RoomSession {
    room: RoomInfo,
    local_user_id: String,
    role: Role,
    registry: Arc<PeerRegistry>,
    channel: Arc<RoomChannel>,
    command_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<SessionEvent>,
    connected_users_rx: watch::Receiver<Vec<String>>,
    session_token: CancellationToken,
    coordinator_task: Mutex<Option<JoinHandle<()>>>,
}

impl RoomSession {
    /// Connects the signaling channel for `room.room_id`, resolves the local
    /// role from the room metadata and starts the coordinator.
    ///
    /// `audio_source` is only opened when broadcasting actually starts;
    /// `audio_output_tx` receives the payload of every rendered inbound
    /// track while listening.
    #[instrument(
        level = "debug",
        skip(transport, options, audio_source, audio_output_tx, shutdown_token),
        fields(room_id = %room.room_id)
    )]
    pub async fn join<T: SignalingTransport>(
        transport: &T,
        room: RoomInfo,
        local_user_id: &str,
        options: SessionOptions,
        audio_source: Arc<dyn AudioSource>,
        audio_output_tx: mpsc::Sender<EncodedAudioFrame>,
        shutdown_token: CancellationToken,
    ) -> Result<Self, SessionError> {
        let role = Role::resolve(&room, local_user_id);
        tracing::info!(?role, "Joining room");

        let session_token = shutdown_token.child_token();
        let channel =
            Arc::new(RoomChannel::connect(transport, &room.room_id, &session_token).await?);
        let channel_rx = channel.subscribe();

        let registry = Arc::new(PeerRegistry::new());
        let events_tx = broadcast::channel(EVENTS_CHANNEL_SIZE).0;
        let (connected_users_tx, connected_users_rx) = watch::channel(Vec::new());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        let mut coordinator = Coordinator {
            room: room.clone(),
            local_user_id: local_user_id.to_string(),
            role,
            options,
            registry: Arc::clone(&registry),
            channel: Arc::clone(&channel),
            events_tx: events_tx.clone(),
            connected_users_tx,
            audio_source,
            audio_output_tx,
            session_token: session_token.clone(),
            feed: None,
            bindings: Vec::new(),
            listening: false,
            renderer: None,
            members: Vec::new(),
        };

        if role == Role::Receiver {
            // Held until the first real negotiation; see the receiver half of
            // the protocol.
            coordinator.create_receiver_peer().await?;
        }

        let coordinator_task = tokio::spawn(
            coordinator
                .run(command_rx, channel_rx)
                .instrument(tracing::Span::current()),
        );

        Ok(Self {
            room,
            local_user_id: local_user_id.to_string(),
            role,
            registry,
            channel,
            command_tx,
            events_tx,
            connected_users_rx,
            session_token,
            coordinator_task: Mutex::new(Some(coordinator_task)),
        })
    }

    pub fn room(&self) -> &RoomInfo {
        &self.room
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Subscribes to a broadcast channel emitting [`SessionEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Currently connected remote users: the registry key set on the
    /// broadcaster side, the membership list on the receiver side.
    pub fn connected_users(&self) -> Vec<String> {
        self.connected_users_rx.borrow().clone()
    }

    /// Subscribes to a watch over [`RoomSession::connected_users`].
    pub fn subscribe_connected_users(&self) -> watch::Receiver<Vec<String>> {
        self.connected_users_rx.clone()
    }

    /// Snapshot of all live peer connections with their negotiation state,
    /// sorted by user id.
    pub fn active_connections(&self) -> Vec<ConnectionSnapshot> {
        let mut connections: Vec<ConnectionSnapshot> = self
            .registry
            .all()
            .iter()
            .map(|peer| ConnectionSnapshot {
                user_id: peer.user_id().to_string(),
                state: peer.state(),
            })
            .collect();
        connections.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        connections
    }

    /// Attaches local audio to every existing connection and announces the
    /// broadcast. Broadcaster only.
    pub async fn start_broadcasting(&self) -> Result<(), SessionError> {
        self.command(|reply| Command::StartBroadcasting { reply })
            .await
    }

    /// Detaches the per-recipient sender bindings created by the most recent
    /// start. Connections remain open. Broadcaster only.
    pub async fn stop_broadcasting(&self) -> Result<(), SessionError> {
        self.command(|reply| Command::StopBroadcasting { reply })
            .await
    }

    /// Asks the broadcaster to begin offer generation and arms the
    /// remote-track renderer. Receiver only. A second call without an
    /// intervening [`RoomSession::stop_listening`] is rejected with
    /// [`SessionError::AlreadyListening`].
    pub async fn listen_to_broadcaster(&self) -> Result<(), SessionError> {
        self.command(|reply| Command::ListenToBroadcaster { reply })
            .await
    }

    /// Announces the leave and replaces the local connection with a fresh
    /// one, so a later listen renegotiates cleanly. Receiver only.
    pub async fn stop_listening(&self) -> Result<(), SessionError> {
        self.command(|reply| Command::StopListening { reply }).await
    }

    /// Gracefully leaves the room: closes the signaling channel and waits
    /// for the coordinator to tear down every connection.
    #[instrument(level = "debug", skip(self))]
    pub async fn leave(&self) {
        tracing::debug!("Leaving room session");
        self.channel.close().await;
        self.session_token.cancel();

        let task = self.coordinator_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await
                && !err.is_cancelled()
            {
                tracing::warn!(?err, "Failed to join coordinator task");
            }
        }
    }

    async fn command<F>(&self, build: F) -> Result<(), SessionError>
    where
        F: FnOnce(oneshot::Sender<Result<(), SessionError>>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)?
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.session_token.cancel();
        if let Some(task) = self.coordinator_task.lock().take() {
            task.abort();
        }
    }
}

/// Per-room coordinator. The only mutator of the registry, driven by the
/// single merged stream of inbound envelopes and public-operation commands.
/// Session-description work is spawned per peer so a slow negotiation with
/// one user never delays an unrelated envelope.
struct Coordinator {
    room: RoomInfo,
    local_user_id: String,
    role: Role,
    options: SessionOptions,
    registry: Arc<PeerRegistry>,
    channel: Arc<RoomChannel>,
    events_tx: broadcast::Sender<SessionEvent>,
    connected_users_tx: watch::Sender<Vec<String>>,
    audio_source: Arc<dyn AudioSource>,
    audio_output_tx: mpsc::Sender<EncodedAudioFrame>,
    session_token: CancellationToken,

    // Broadcaster state: the capture fan-out and the sender bindings of the
    // most recent attach.
    feed: Option<TrackFeed>,
    bindings: Vec<SenderBinding>,

    // Receiver state.
    listening: bool,
    renderer: Option<RemoteAudioRenderer>,
    members: Vec<String>,
}

impl Coordinator {
    #[instrument(level = "debug", skip_all, fields(room_id = %self.room.room_id, role = ?self.role))]
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<Command>,
        mut channel_rx: broadcast::Receiver<ChannelEvent>,
    ) {
        tracing::debug!("Starting session coordinator");

        loop {
            tokio::select! {
                biased;

                _ = self.session_token.cancelled() => {
                    tracing::debug!("Shutdown signal received, exiting coordinator");
                    break;
                }

                command = command_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            tracing::debug!("Command channel closed, exiting coordinator");
                            break;
                        }
                    }
                }

                event = channel_rx.recv() => {
                    match event {
                        Ok(ChannelEvent::Envelope(envelope)) => {
                            self.handle_envelope(envelope).await;
                        }
                        Ok(ChannelEvent::Closed) => {
                            tracing::warn!("Signaling channel closed, tearing down session");
                            self.emit(SessionEvent::ChannelClosed);
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Coordinator lagged behind channel events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::debug!("Channel event stream ended, exiting coordinator");
                            break;
                        }
                    }
                }
            }
        }

        self.teardown().await;
        tracing::debug!("Session coordinator finished");
    }

    async fn teardown(&mut self) {
        self.feed.take();
        self.renderer.take();
        self.bindings.clear();
        self.listening = false;
        self.members.clear();
        self.registry.clear().await;
        self.publish_connected_users();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartBroadcasting { reply } => {
                let _ = reply.send(self.start_broadcasting().await);
            }
            Command::StopBroadcasting { reply } => {
                let _ = reply.send(self.stop_broadcasting().await);
            }
            Command::ListenToBroadcaster { reply } => {
                let _ = reply.send(self.listen_to_broadcaster().await);
            }
            Command::StopListening { reply } => {
                let _ = reply.send(self.stop_listening().await);
            }
        }
    }

    /// Dispatches one inbound envelope against the fixed local role. Each
    /// role reacts to its own subset of kinds; everything else is an
    /// expected consequence of relay fan-out and dropped deliberately.
    #[instrument(level = "trace", skip(self, envelope))]
    async fn handle_envelope(&mut self, envelope: SignalEnvelope) {
        match self.role {
            Role::Broadcaster => self.handle_envelope_as_broadcaster(envelope).await,
            Role::Receiver => self.handle_envelope_as_receiver(envelope).await,
        }
    }

    async fn handle_envelope_as_broadcaster(&mut self, envelope: SignalEnvelope) {
        match envelope {
            SignalEnvelope::UserJoined { user_id } => {
                if user_id == self.local_user_id {
                    tracing::trace!("Ignoring own membership event");
                    return;
                }
                if self.registry.contains(&user_id) {
                    tracing::warn!(%user_id, "Connection for joined user already exists");
                    return;
                }

                match self.registry.create(&user_id, self.options.ice.clone()).await {
                    Ok(peer) => {
                        self.spawn_peer_pump(&peer);
                        self.publish_connected_users();

                        // The offer is deferred until the joining side
                        // signals readiness with its own join request.
                        let invitation = SignalEnvelope::JoinChannelRequest {
                            broadcaster_id: self.local_user_id.clone(),
                            receiver_id: user_id.clone(),
                        };
                        if let Err(err) = self.channel.send(invitation).await {
                            tracing::warn!(?err, %user_id, "Failed to send join invitation");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(?err, %user_id, "Failed to create connection for joined user");
                        self.emit(SessionEvent::NegotiationFailed { user_id });
                    }
                }
            }
            SignalEnvelope::JoinChannelRequest { receiver_id, .. } => {
                let Some(peer) = self.registry.get(&receiver_id) else {
                    tracing::debug!(%receiver_id, "Join request for unknown user, dropping");
                    return;
                };
                if peer.state() != NegotiationState::Created {
                    tracing::debug!(%receiver_id, "Offer already in flight, ignoring join request");
                    return;
                }
                self.spawn_offer_negotiation(peer);
            }
            SignalEnvelope::Answer {
                answer,
                receiver_id,
                ..
            } => {
                let Some(peer) = self.registry.get(&receiver_id) else {
                    tracing::debug!(%receiver_id, "Answer for unknown user, dropping");
                    return;
                };
                self.spawn_answer_application(peer, answer);
            }
            SignalEnvelope::Candidate {
                candidate,
                receiver_id,
                ..
            } => {
                let Some(peer) = self.registry.get(&receiver_id) else {
                    tracing::debug!(%receiver_id, "Candidate for unknown user, dropping");
                    return;
                };
                Self::spawn_candidate_application(peer, candidate);
            }
            SignalEnvelope::UserLeft { user_id } => {
                let removed = self.registry.remove(&user_id).await;
                self.bindings.retain(|binding| binding.user_id() != user_id);
                self.publish_connected_users();

                if removed {
                    let farewell = SignalEnvelope::LeaveChannelRequest {
                        broadcaster_id: self.local_user_id.clone(),
                        receiver_id: user_id.clone(),
                    };
                    if let Err(err) = self.channel.send(farewell).await {
                        tracing::warn!(?err, %user_id, "Failed to send leave notification");
                    }
                }
            }
            SignalEnvelope::Offer { .. }
            | SignalEnvelope::LeaveChannelRequest { .. }
            | SignalEnvelope::StartedBroadcast => {
                tracing::trace!("Envelope not applicable to broadcaster role, dropping");
            }
        }
    }

    async fn handle_envelope_as_receiver(&mut self, envelope: SignalEnvelope) {
        match envelope {
            SignalEnvelope::Offer {
                offer, receiver_id, ..
            } => {
                if receiver_id != self.local_user_id {
                    tracing::trace!("Offer addressed to another receiver, dropping");
                    return;
                }
                let Some(peer) = self.registry.get(&self.room.broadcaster_id) else {
                    tracing::debug!("No connection toward broadcaster, dropping offer");
                    return;
                };
                self.spawn_offer_acceptance(peer, offer);
            }
            SignalEnvelope::Candidate {
                candidate,
                receiver_id,
                ..
            } => {
                if receiver_id != self.local_user_id {
                    tracing::trace!("Candidate addressed to another receiver, dropping");
                    return;
                }
                let Some(peer) = self.registry.get(&self.room.broadcaster_id) else {
                    tracing::debug!("No connection toward broadcaster, dropping candidate");
                    return;
                };
                Self::spawn_candidate_application(peer, candidate);
            }
            SignalEnvelope::UserJoined { user_id } => {
                if user_id != self.local_user_id && !self.members.contains(&user_id) {
                    self.members.push(user_id);
                    self.publish_connected_users();
                }
            }
            SignalEnvelope::UserLeft { user_id } => {
                self.members.retain(|existing| existing != &user_id);
                self.publish_connected_users();

                if user_id == self.room.broadcaster_id {
                    tracing::debug!("Broadcaster left, resetting connection");
                    self.reset_receiver_connection().await;
                }
            }
            SignalEnvelope::StartedBroadcast => {
                self.emit(SessionEvent::BroadcastStarted);
                if self.options.listen_on_broadcast {
                    if self.listening {
                        tracing::debug!("Already listening, ignoring broadcast announcement");
                    } else if let Err(err) = self.listen_to_broadcaster().await {
                        tracing::warn!(?err, "Failed to auto-listen to broadcast");
                    }
                }
            }
            SignalEnvelope::LeaveChannelRequest { receiver_id, .. } => {
                if receiver_id == self.local_user_id && self.listening {
                    tracing::debug!("Broadcaster ended our channel, resetting connection");
                    self.reset_receiver_connection().await;
                }
            }
            SignalEnvelope::Answer { .. } | SignalEnvelope::JoinChannelRequest { .. } => {
                tracing::trace!("Envelope not applicable to receiver role, dropping");
            }
        }
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn start_broadcasting(&mut self) -> Result<(), SessionError> {
        if self.role != Role::Broadcaster {
            return Err(SessionError::WrongRole(self.role));
        }
        if self.feed.is_some() {
            tracing::warn!("Broadcast already active");
            return Err(SessionError::AlreadyBroadcasting);
        }

        // Acquisition happens before anything else: a failure here must
        // leave every connection untouched.
        let frames_rx = self.audio_source.open().await?;
        let feed = TrackFeed::new(frames_rx);

        let peers = self.registry.all();
        self.bindings = attach_local_audio(&peers, &feed).await;
        self.feed = Some(feed);

        self.channel.send(SignalEnvelope::StartedBroadcast).await?;
        tracing::info!(recipients = self.bindings.len(), "Broadcast started");
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn stop_broadcasting(&mut self) -> Result<(), SessionError> {
        if self.role != Role::Broadcaster {
            return Err(SessionError::WrongRole(self.role));
        }

        let bindings = std::mem::take(&mut self.bindings);
        if bindings.is_empty() && self.feed.is_none() {
            tracing::debug!("No broadcast active");
        }
        for binding in bindings {
            binding.detach().await;
        }
        self.feed.take();

        tracing::info!("Broadcast stopped");
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn listen_to_broadcaster(&mut self) -> Result<(), SessionError> {
        if self.role != Role::Receiver {
            return Err(SessionError::WrongRole(self.role));
        }
        if self.listening {
            return Err(SessionError::AlreadyListening);
        }

        let peer = match self.registry.get(&self.room.broadcaster_id) {
            Some(peer) => peer,
            None => self.create_receiver_peer().await?,
        };

        self.renderer = Some(RemoteAudioRenderer::arm(
            &peer,
            self.audio_output_tx.clone(),
        ));

        self.channel
            .send(SignalEnvelope::JoinChannelRequest {
                broadcaster_id: self.room.broadcaster_id.clone(),
                receiver_id: self.local_user_id.clone(),
            })
            .await?;

        self.listening = true;
        tracing::info!("Listening to broadcaster");
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn stop_listening(&mut self) -> Result<(), SessionError> {
        if self.role != Role::Receiver {
            return Err(SessionError::WrongRole(self.role));
        }

        self.channel
            .send(SignalEnvelope::LeaveChannelRequest {
                broadcaster_id: self.room.broadcaster_id.clone(),
                receiver_id: self.local_user_id.clone(),
            })
            .await?;

        self.reset_receiver_connection().await;
        tracing::info!("Stopped listening to broadcaster");
        Ok(())
    }

    /// Discards the connection toward the broadcaster and replaces it with a
    /// fresh one, so a later listen can renegotiate cleanly.
    async fn reset_receiver_connection(&mut self) {
        self.renderer.take();
        self.listening = false;
        self.registry.remove(&self.room.broadcaster_id).await;
        if let Err(err) = self.create_receiver_peer().await {
            tracing::warn!(?err, "Failed to recreate receiver connection");
        }
    }

    async fn create_receiver_peer(&mut self) -> Result<Arc<Peer>, SessionError> {
        let peer = self
            .registry
            .create(&self.room.broadcaster_id, self.options.ice.clone())
            .await?;
        self.spawn_peer_pump(&peer);
        Ok(peer)
    }

    /// Routing identities of the logical link toward `peer_user_id`:
    /// `receiver_id` always names the receiver-side participant.
    fn link_ids(&self, peer_user_id: &str) -> (String, String) {
        match self.role {
            Role::Broadcaster => (self.local_user_id.clone(), peer_user_id.to_string()),
            Role::Receiver => (
                self.room.broadcaster_id.clone(),
                self.local_user_id.clone(),
            ),
        }
    }

    /// Forwards one peer's events for as long as the peer lives: locally
    /// gathered ICE candidates are trickled to the remote side, transport
    /// state changes drive the established transition and presence events.
    fn spawn_peer_pump(&self, peer: &Arc<Peer>) {
        let peer = Arc::clone(peer);
        let mut events_rx = peer.subscribe();
        let cancel = peer.cancel_token();
        let channel = Arc::clone(&self.channel);
        let events_tx = self.events_tx.clone();
        let (broadcaster_id, receiver_id) = self.link_ids(peer.user_id());

        tokio::spawn(
            async move {
                let user_id = peer.user_id().to_string();
                loop {
                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => {
                            tracing::trace!(%user_id, "Peer torn down, stopping event pump");
                            break;
                        }

                        event = events_rx.recv() => {
                            match event {
                                Ok(PeerEvent::IceCandidate(candidate)) => {
                                    let envelope = SignalEnvelope::Candidate {
                                        candidate,
                                        broadcaster_id: broadcaster_id.clone(),
                                        receiver_id: receiver_id.clone(),
                                    };
                                    if let Err(err) = channel.send(envelope).await {
                                        tracing::warn!(?err, %user_id, "Failed to trickle ICE candidate");
                                    }
                                }
                                Ok(PeerEvent::ConnectionState(state)) => match state {
                                    PeerConnectionState::Connected => {
                                        peer.mark_established();
                                        emit_event(&events_tx, SessionEvent::PeerConnected {
                                            user_id: user_id.clone(),
                                        });
                                    }
                                    PeerConnectionState::Disconnected
                                    | PeerConnectionState::Failed
                                    | PeerConnectionState::Closed => {
                                        emit_event(&events_tx, SessionEvent::PeerDisconnected {
                                            user_id: user_id.clone(),
                                        });
                                    }
                                    _ => {}
                                },
                                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                    tracing::warn!(skipped, %user_id, "Peer event pump lagged");
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
    }

    /// Broadcaster side: generate the deferred offer for one peer. Runs off
    /// the coordinator so a slow description exchange never delays other
    /// envelopes; abandoned via the peer token if the peer is torn down
    /// mid-negotiation.
    fn spawn_offer_negotiation(&self, peer: Arc<Peer>) {
        let channel = Arc::clone(&self.channel);
        let events_tx = self.events_tx.clone();
        let broadcaster_id = self.local_user_id.clone();
        let cancel = peer.cancel_token();

        tokio::spawn(
            async move {
                let user_id = peer.user_id().to_string();
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        tracing::trace!(%user_id, "Peer torn down, abandoning offer negotiation");
                    }

                    result = async {
                        let offer = peer.create_offer().await?;
                        channel
                            .send(SignalEnvelope::Offer {
                                offer,
                                broadcaster_id,
                                receiver_id: user_id.clone(),
                            })
                            .await?;
                        Ok::<(), SessionError>(())
                    } => {
                        if let Err(err) = result {
                            tracing::warn!(?err, %user_id, "Offer negotiation failed");
                            emit_event(&events_tx, SessionEvent::NegotiationFailed { user_id });
                        }
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );
    }

    /// Broadcaster side: apply a received answer to one peer.
    fn spawn_answer_application(&self, peer: Arc<Peer>, answer: SessionDescription) {
        let events_tx = self.events_tx.clone();
        let cancel = peer.cancel_token();

        tokio::spawn(
            async move {
                let user_id = peer.user_id().to_string();
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        tracing::trace!(%user_id, "Peer torn down, abandoning answer application");
                    }

                    result = peer.accept_answer(&answer) => {
                        if let Err(err) = result {
                            tracing::warn!(?err, %user_id, "Failed to apply answer");
                            emit_event(&events_tx, SessionEvent::NegotiationFailed { user_id });
                        }
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );
    }

    /// Receiver side: apply a received offer and send back the answer.
    fn spawn_offer_acceptance(&self, peer: Arc<Peer>, offer: SessionDescription) {
        let channel = Arc::clone(&self.channel);
        let events_tx = self.events_tx.clone();
        let (broadcaster_id, receiver_id) = self.link_ids(peer.user_id());
        let cancel = peer.cancel_token();

        tokio::spawn(
            async move {
                let user_id = peer.user_id().to_string();
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        tracing::trace!(%user_id, "Peer torn down, abandoning offer acceptance");
                    }

                    result = async {
                        let answer = peer.accept_offer(&offer).await?;
                        channel
                            .send(SignalEnvelope::Answer {
                                answer,
                                broadcaster_id,
                                receiver_id,
                            })
                            .await?;
                        Ok::<(), SessionError>(())
                    } => {
                        if let Err(err) = result {
                            tracing::warn!(?err, %user_id, "Failed to answer offer");
                            emit_event(&events_tx, SessionEvent::NegotiationFailed { user_id });
                        }
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );
    }

    /// Candidates are best-effort: a failure to apply one is logged but does
    /// not count as a failed negotiation.
    fn spawn_candidate_application(peer: Arc<Peer>, candidate: IceCandidate) {
        let cancel = peer.cancel_token();

        tokio::spawn(
            async move {
                let user_id = peer.user_id().to_string();
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        tracing::trace!(%user_id, "Peer torn down, discarding candidate");
                    }

                    result = peer.add_remote_candidate(candidate) => {
                        if let Err(err) = result {
                            tracing::warn!(?err, %user_id, "Failed to add remote ICE candidate");
                        }
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );
    }

    fn publish_connected_users(&self) {
        let users = match self.role {
            Role::Broadcaster => self.registry.user_ids(),
            Role::Receiver => {
                let mut users = self.members.clone();
                users.sort();
                users
            }
        };
        if self.connected_users_tx.send(users).is_err() {
            tracing::trace!("No connected-users watchers left");
        }
    }

    fn emit(&self, event: SessionEvent) {
        emit_event(&self.events_tx, event);
    }
}

fn emit_event(events_tx: &broadcast::Sender<SessionEvent>, event: SessionEvent) {
    if events_tx.receiver_count() > 0
        && let Err(err) = events_tx.send(event)
    {
        tracing::warn!(?err, "Failed to broadcast session event");
    }
}
