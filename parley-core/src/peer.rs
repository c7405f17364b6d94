//! Peer sessions
//!
//! A [`PeerSession`] is one negotiated (or negotiating) media link to one
//! remote participant. The owning state machine keeps its peers in a
//! [`PeerRegistry`], which guarantees at most one session per remote
//! participant and owns the shared [`IceCandidateBuffer`].

use crate::connection::{
    ConnectionError, ConnectionEventSink, ConnectionFactory, MediaConnection, PeerEvent,
};
use crate::ice_buffer::IceCandidateBuffer;
use crate::identity::ParticipantId;
use crate::media::{LocalMedia, LocalTrack, RemoteMedia, RemoteTrack};
use crate::signaling::{SignalChannel, SignalingError, SignalingMessage};
use crate::types::{
    CallId, ConnectionState, IceCandidate, SdpType, SessionDescription, SessionOrigin, SessionToken,
};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Underlying connection failed
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Signaling failed
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// No outgoing video to replace
    #[error("No video sender toward {0}")]
    NoVideoSender(ParticipantId),
}

/// Which signaling family a peer negotiates over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalScope {
    /// `call:*` events for one call
    Call(CallId),
    /// `signal-*` events of the match flow
    Match,
}

/// Addressing for negotiation messages sent by one peer session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRoute {
    /// Signaling family and call context
    pub scope: SignalScope,
    /// Local participant, stamped as sender
    pub local_id: ParticipantId,
}

impl SignalRoute {
    /// Route for a call
    pub fn call(call_id: CallId, local_id: ParticipantId) -> Self {
        Self {
            scope: SignalScope::Call(call_id),
            local_id,
        }
    }

    /// Route for the match flow
    pub fn matched(local_id: ParticipantId) -> Self {
        Self {
            scope: SignalScope::Match,
            local_id,
        }
    }

    fn description(&self, to: &ParticipantId, description: SessionDescription) -> SignalingMessage {
        let from = self.local_id.clone();
        let to = to.clone();
        match (&self.scope, description.sdp_type) {
            (SignalScope::Call(call_id), SdpType::Offer) => SignalingMessage::CallOffer {
                call_id: call_id.clone(),
                from,
                to,
                description,
            },
            (SignalScope::Call(call_id), SdpType::Answer) => SignalingMessage::CallAnswer {
                call_id: call_id.clone(),
                from,
                to,
                description,
            },
            (SignalScope::Match, SdpType::Offer) => SignalingMessage::SignalOffer { from, to, description },
            (SignalScope::Match, SdpType::Answer) => SignalingMessage::SignalAnswer { from, to, description },
        }
    }

    fn candidate(&self, to: &ParticipantId, candidate: IceCandidate) -> SignalingMessage {
        let from = self.local_id.clone();
        let to = to.clone();
        match &self.scope {
            SignalScope::Call(call_id) => SignalingMessage::CallIceCandidate {
                call_id: call_id.clone(),
                from,
                to,
                candidate,
            },
            SignalScope::Match => SignalingMessage::SignalIceCandidate { from, to, candidate },
        }
    }
}

/// One media link to one remote participant
pub struct PeerSession {
    remote_id: ParticipantId,
    is_initiator: bool,
    route: SignalRoute,
    connection: Arc<dyn MediaConnection>,
    signals: Arc<dyn SignalChannel>,
    state: ConnectionState,
    remote_description_set: bool,
    local_offer_outstanding: bool,
    remote_media: Option<RemoteMedia>,
    closed: bool,
}

impl PeerSession {
    /// Allocate a connection toward `remote_id` and attach local tracks
    ///
    /// Missing local media is not an error: the session may be receive-only
    /// or media may be attached later.
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be allocated
    #[tracing::instrument(skip(local_media, route, factory, sink, signals), fields(remote = %remote_id))]
    pub async fn create(
        remote_id: ParticipantId,
        is_initiator: bool,
        local_media: Option<&LocalMedia>,
        route: SignalRoute,
        factory: &dyn ConnectionFactory,
        sink: ConnectionEventSink,
        signals: Arc<dyn SignalChannel>,
    ) -> Result<Self, PeerError> {
        let connection = factory.create(sink).await?;

        match local_media {
            Some(media) => {
                for track in media.tracks() {
                    if let Err(e) = connection.add_track(track.clone()).await {
                        tracing::warn!(track = track.id(), "Failed to attach local track: {}", e);
                    }
                }
                tracing::debug!(tracks = media.tracks().len(), "Attached local media");
            }
            None => tracing::debug!("No local media to attach"),
        }

        tracing::info!(is_initiator, "Peer session created");
        Ok(Self {
            remote_id,
            is_initiator,
            route,
            connection,
            signals,
            state: ConnectionState::New,
            remote_description_set: false,
            local_offer_outstanding: false,
            remote_media: None,
            closed: false,
        })
    }

    /// Remote participant
    pub fn remote_id(&self) -> &ParticipantId {
        &self.remote_id
    }

    /// Whether this side produces the offer
    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// Last reported connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a remote description has been committed
    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    /// Media received so far
    pub fn remote_media(&self) -> Option<&RemoteMedia> {
        self.remote_media.as_ref()
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Produce, commit and send an offer
    ///
    /// Failures are logged; the session stays as it was.
    #[tracing::instrument(skip(self), fields(remote = %self.remote_id))]
    pub async fn initiate_negotiation(&mut self) {
        if !self.is_initiator {
            tracing::debug!("Not the initiator, waiting for remote offer");
            return;
        }
        if self.closed {
            return;
        }
        if let Err(e) = self.send_offer().await {
            tracing::warn!("Negotiation failed: {}", e);
        }
    }

    async fn send_offer(&mut self) -> Result<(), PeerError> {
        tracing::debug!("Creating offer");
        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(offer.clone()).await?;
        self.local_offer_outstanding = true;
        self.state = ConnectionState::Connecting;
        self.signals
            .emit(self.route.description(&self.remote_id, offer))
            .await?;
        tracing::debug!("Offer sent");
        Ok(())
    }

    /// Commit a remote offer, replay buffered candidates and answer
    #[tracing::instrument(skip(self, description, buffer), fields(remote = %self.remote_id))]
    pub async fn receive_remote_offer(&mut self, description: SessionDescription, buffer: &mut IceCandidateBuffer) {
        if self.closed {
            return;
        }
        if let Err(e) = self.answer_offer(description, buffer).await {
            tracing::warn!("Failed to answer remote offer: {}", e);
        }
    }

    async fn answer_offer(
        &mut self,
        description: SessionDescription,
        buffer: &mut IceCandidateBuffer,
    ) -> Result<(), PeerError> {
        self.connection.set_remote_description(description).await?;
        self.remote_description_set = true;
        self.state = ConnectionState::Connecting;
        self.replay_candidates(buffer).await;

        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        self.signals
            .emit(self.route.description(&self.remote_id, answer))
            .await?;
        tracing::debug!("Answer sent");
        Ok(())
    }

    /// Commit a remote answer and replay buffered candidates
    ///
    /// Ignored unless a local offer is outstanding.
    #[tracing::instrument(skip(self, description, buffer), fields(remote = %self.remote_id))]
    pub async fn receive_remote_answer(&mut self, description: SessionDescription, buffer: &mut IceCandidateBuffer) {
        if self.closed || !self.local_offer_outstanding {
            tracing::debug!("No outstanding offer, ignoring answer");
            return;
        }
        match self.connection.set_remote_description(description).await {
            Ok(()) => {
                self.local_offer_outstanding = false;
                self.remote_description_set = true;
                self.replay_candidates(buffer).await;
            }
            Err(e) => tracing::warn!("Failed to apply remote answer: {}", e),
        }
    }

    /// Apply a remote candidate now, or park it until the remote description
    /// is committed
    pub async fn receive_remote_candidate(&mut self, candidate: IceCandidate, buffer: &mut IceCandidateBuffer) {
        if self.closed {
            return;
        }
        if !self.remote_description_set {
            buffer.enqueue(&self.remote_id, candidate);
            return;
        }
        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            tracing::warn!(remote = %self.remote_id, "Failed to apply candidate: {}", e);
        }
    }

    async fn replay_candidates(&mut self, buffer: &mut IceCandidateBuffer) {
        let queued = buffer.drain(&self.remote_id);
        if queued.is_empty() {
            return;
        }
        tracing::debug!(count = queued.len(), "Applying buffered candidates");
        for candidate in queued {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply buffered candidate: {}", e);
            }
        }
    }

    /// Forward a locally discovered candidate to the remote side
    pub async fn forward_local_candidate(&self, candidate: IceCandidate) {
        if self.closed {
            return;
        }
        if let Err(e) = self
            .signals
            .emit(self.route.candidate(&self.remote_id, candidate))
            .await
        {
            tracing::warn!(remote = %self.remote_id, "Failed to send candidate: {}", e);
        }
    }

    /// Publish a received track
    pub fn attach_remote_track(&mut self, track: RemoteTrack) -> &RemoteMedia {
        let media = self
            .remote_media
            .get_or_insert_with(|| RemoteMedia::new(self.remote_id.clone()));
        media.add_track(track);
        media
    }

    /// Record a connection state change
    pub fn set_state(&mut self, state: ConnectionState) {
        tracing::debug!(remote = %self.remote_id, old_state = ?self.state, new_state = ?state, "Connection state changed");
        self.state = state;
    }

    /// Swap the outgoing video track without renegotiation
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::NoVideoSender`] if nothing video is being sent
    pub async fn replace_outgoing_video_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError> {
        match self.connection.replace_video_track(track).await {
            Ok(()) => Ok(()),
            Err(ConnectionError::NoVideoSender) => Err(PeerError::NoVideoSender(self.remote_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Release the connection and forget buffered candidates and remote media
    ///
    /// Returns `false` if the session was already closed.
    pub async fn close(&mut self, buffer: &mut IceCandidateBuffer) -> bool {
        buffer.discard(&self.remote_id);
        self.shutdown().await
    }

    async fn shutdown(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        if let Err(e) = self.connection.close().await {
            tracing::warn!(remote = %self.remote_id, "Connection close failed: {}", e);
        }
        self.state = ConnectionState::Closed;
        self.remote_media = None;
        tracing::info!(remote = %self.remote_id, "Peer session closed");
        true
    }
}

/// Peer sessions of one call or match, keyed by remote participant
pub struct PeerRegistry {
    origin: SessionOrigin,
    factory: Arc<dyn ConnectionFactory>,
    signals: Arc<dyn SignalChannel>,
    events: mpsc::UnboundedSender<PeerEvent>,
    peers: HashMap<ParticipantId, PeerSession>,
    candidates: IceCandidateBuffer,
}

impl PeerRegistry {
    /// Create an empty registry whose connections report on `events`
    pub fn new(
        origin: SessionOrigin,
        factory: Arc<dyn ConnectionFactory>,
        signals: Arc<dyn SignalChannel>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            origin,
            factory,
            signals,
            events,
            peers: HashMap::new(),
            candidates: IceCandidateBuffer::new(),
        }
    }

    /// Make sure a session toward `remote_id` exists
    ///
    /// An existing session is reused as-is. Returns `true` if a new session
    /// was created.
    ///
    /// # Errors
    ///
    /// Returns error if a new connection cannot be allocated
    pub async fn ensure(
        &mut self,
        remote_id: &ParticipantId,
        is_initiator: bool,
        token: SessionToken,
        route: SignalRoute,
        local_media: Option<&LocalMedia>,
    ) -> Result<bool, PeerError> {
        if self.peers.contains_key(remote_id) {
            tracing::debug!(remote = %remote_id, "Reusing existing peer session");
            return Ok(false);
        }
        let sink = ConnectionEventSink::new(self.events.clone(), self.origin, token, remote_id.clone());
        let peer = PeerSession::create(
            remote_id.clone(),
            is_initiator,
            local_media,
            route,
            self.factory.as_ref(),
            sink,
            self.signals.clone(),
        )
        .await?;
        self.peers.insert(remote_id.clone(), peer);
        Ok(true)
    }

    /// Start negotiation toward `remote_id`
    pub async fn initiate(&mut self, remote_id: &ParticipantId) {
        if let Some(peer) = self.peers.get_mut(remote_id) {
            peer.initiate_negotiation().await;
        }
    }

    /// Route a remote offer; returns `false` if no such peer exists
    pub async fn apply_offer(&mut self, remote_id: &ParticipantId, description: SessionDescription) -> bool {
        let Self { peers, candidates, .. } = self;
        match peers.get_mut(remote_id) {
            Some(peer) => {
                peer.receive_remote_offer(description, candidates).await;
                true
            }
            None => false,
        }
    }

    /// Route a remote answer; returns `false` if no such peer exists
    pub async fn apply_answer(&mut self, remote_id: &ParticipantId, description: SessionDescription) -> bool {
        let Self { peers, candidates, .. } = self;
        match peers.get_mut(remote_id) {
            Some(peer) => {
                peer.receive_remote_answer(description, candidates).await;
                true
            }
            None => {
                tracing::debug!(remote = %remote_id, "Answer for unknown peer ignored");
                false
            }
        }
    }

    /// Route a remote candidate
    ///
    /// Candidates for a participant without a session yet are parked until
    /// its session commits a remote description.
    pub async fn apply_candidate(&mut self, remote_id: &ParticipantId, candidate: IceCandidate) {
        let Self { peers, candidates, .. } = self;
        match peers.get_mut(remote_id) {
            Some(peer) => peer.receive_remote_candidate(candidate, candidates).await,
            None => candidates.enqueue(remote_id, candidate),
        }
    }

    /// Forward a locally discovered candidate toward `remote_id`
    pub async fn forward_local_candidate(&self, remote_id: &ParticipantId, candidate: IceCandidate) {
        if let Some(peer) = self.peers.get(remote_id) {
            peer.forward_local_candidate(candidate).await;
        }
    }

    /// Publish a received track; returns the peer's media so far
    pub fn attach_remote_track(&mut self, remote_id: &ParticipantId, track: RemoteTrack) -> Option<RemoteMedia> {
        self.peers
            .get_mut(remote_id)
            .map(|peer| peer.attach_remote_track(track).clone())
    }

    /// Record a connection state change; returns `false` for unknown peers
    pub fn set_state(&mut self, remote_id: &ParticipantId, state: ConnectionState) -> bool {
        match self.peers.get_mut(remote_id) {
            Some(peer) => {
                peer.set_state(state);
                true
            }
            None => false,
        }
    }

    /// Close and forget the session toward `remote_id`
    ///
    /// Buffered candidates for the participant are dropped even when no
    /// session exists. Returns `true` if a session was closed.
    pub async fn close(&mut self, remote_id: &ParticipantId) -> bool {
        let Self { peers, candidates, .. } = self;
        match peers.remove(remote_id) {
            Some(mut peer) => peer.close(candidates).await,
            None => {
                candidates.discard(remote_id);
                false
            }
        }
    }

    /// Close every session and drop every buffered candidate
    ///
    /// Returns the ids of the sessions that were closed.
    pub async fn close_all(&mut self) -> Vec<ParticipantId> {
        let mut peers: Vec<PeerSession> = self.peers.drain().map(|(_, peer)| peer).collect();
        self.candidates.clear();
        join_all(peers.iter_mut().map(|peer| peer.shutdown())).await;
        peers.into_iter().map(|peer| peer.remote_id).collect()
    }

    /// Swap the outgoing video track on every session
    ///
    /// Best effort: individual failures are logged. Fails only when there are
    /// sessions and none of them sends video.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::NoVideoSender`] if no session sends video
    pub async fn replace_video_track(&self, track: &Arc<dyn LocalTrack>) -> Result<usize, PeerError> {
        let mut replaced = 0;
        let mut missing_sender = None;
        for peer in self.peers.values() {
            match peer.replace_outgoing_video_track(track.clone()).await {
                Ok(()) => replaced += 1,
                Err(PeerError::NoVideoSender(id)) => missing_sender = Some(id),
                Err(e) => tracing::warn!(remote = %peer.remote_id(), "Track replacement failed: {}", e),
            }
        }
        match missing_sender {
            Some(id) if replaced == 0 => Err(PeerError::NoVideoSender(id)),
            _ => Ok(replaced),
        }
    }

    /// Session toward `remote_id`
    pub fn get(&self, remote_id: &ParticipantId) -> Option<&PeerSession> {
        self.peers.get(remote_id)
    }

    /// Whether a session toward `remote_id` exists
    pub fn contains(&self, remote_id: &ParticipantId) -> bool {
        self.peers.contains_key(remote_id)
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether there are no sessions
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Media received from every remote participant
    pub fn remote_media(&self) -> Vec<RemoteMedia> {
        self.peers
            .values()
            .filter_map(|peer| peer.remote_media().cloned())
            .collect()
    }

    /// Candidates parked for `remote_id`
    pub fn pending_candidates(&self, remote_id: &ParticipantId) -> usize {
        self.candidates.pending(remote_id)
    }
}
