//! Identity-addressed calls
//!
//! [`CallSessionMachine`] owns at most one live [`CallSession`] at a time and
//! drives its peer sessions: one toward the callee for 1:1 calls, one per
//! member for group calls (the member already present initiates toward each
//! joiner).

use crate::connection::{ConnectionFactory, PeerEvent};
use crate::identity::{Participant, ParticipantId};
use crate::machine::{self, CoreState, MediaSnapshot, SessionCore, SessionError, SessionMachine};
use crate::media::MediaCapability;
use crate::peer::{PeerRegistry, SignalRoute};
use crate::signaling::{SignalChannel, SignalingAck, SignalingMessage};
use crate::types::{
    CallId, CallKind, CallStatus, CameraFacing, ConnectionState, IceCandidate, SessionDescription, SessionEvent,
    SessionOrigin, SessionToken, TeardownReason, TrackKind,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};

/// Call machine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Largest group, local participant included
    pub max_group_participants: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            max_group_participants: 8,
        }
    }
}

/// One call as seen by the local participant
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Server-assigned id
    pub call_id: CallId,
    /// Kind of call
    pub kind: CallKind,
    /// Current status
    pub status: CallStatus,
    /// Remote caller; `None` for calls placed locally
    pub initiator: Option<Participant>,
    /// Remote participants
    pub roster: Vec<Participant>,
    /// Conversation the call was placed from
    pub conversation: Option<String>,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// When the call became active
    pub started_at: Option<DateTime<Utc>>,
    /// When the call ended
    pub ended_at: Option<DateTime<Utc>>,
    token: SessionToken,
}

impl CallSession {
    fn new(token: SessionToken, call_id: CallId, kind: CallKind, status: CallStatus) -> Self {
        Self {
            call_id,
            kind,
            status,
            initiator: None,
            roster: Vec::new(),
            conversation: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            token,
        }
    }

    /// Identity of this session attempt
    pub fn token(&self) -> SessionToken {
        self.token
    }

    /// Whether the call was placed locally
    pub fn is_outgoing(&self) -> bool {
        self.initiator.is_none()
    }

    /// Roster entry for `id`
    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.roster.iter().find(|p| &p.id == id)
    }

    /// Time spent active so far, or in total once ended
    pub fn duration(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.ended_at.unwrap_or_else(Utc::now) - started)
    }

    fn add_participant(&mut self, participant: Participant) -> bool {
        if self.participant(&participant.id).is_some() {
            return false;
        }
        self.roster.push(participant);
        true
    }

    fn remove_participant(&mut self, id: &ParticipantId) -> bool {
        let before = self.roster.len();
        self.roster.retain(|p| &p.id != id);
        self.roster.len() != before
    }
}

/// Ended calls remembered so late signaling for them is dropped
const RETIRED_CALLS: usize = 16;

struct CallState {
    session: Option<CallSession>,
    pending_initiate: Option<SessionToken>,
    pending_offers: HashMap<ParticipantId, SessionDescription>,
    retired: VecDeque<CallId>,
    core: SessionCore,
}

impl CallState {
    fn retire(&mut self, call_id: CallId) {
        if self.retired.contains(&call_id) {
            return;
        }
        if self.retired.len() == RETIRED_CALLS {
            self.retired.pop_front();
        }
        self.retired.push_back(call_id);
    }

    fn is_retired(&self, call_id: &CallId) -> bool {
        self.retired.contains(call_id)
    }

    fn live(&self) -> Option<&CallSession> {
        self.session.as_ref().filter(|s| s.status.is_live())
    }

    /// Live session with the given id; anything else is stale
    fn current(&self, call_id: &CallId, event: &str) -> Option<&CallSession> {
        let session = self.live().filter(|s| &s.call_id == call_id);
        if session.is_none() {
            tracing::debug!(call_id = %call_id, event, "Ignoring event for stale call");
        }
        session
    }

    fn describe(&self) -> String {
        match (&self.session, self.pending_initiate) {
            (Some(s), _) => format!("{:?}", s.status).to_lowercase(),
            (None, Some(_)) => "initiating".to_string(),
            (None, None) => "idle".to_string(),
        }
    }

    fn set_status(&mut self, status: CallStatus) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let old_status = session.status;
        if old_status == status {
            return;
        }
        session.status = status;
        match status {
            CallStatus::Active => {
                session.started_at.get_or_insert_with(Utc::now);
            }
            CallStatus::Ended => session.ended_at = Some(Utc::now()),
            _ => {}
        }
        tracing::info!(call_id = %session.call_id, ?old_status, new_status = ?status, "Call status changed");
        let call_id = session.call_id.clone();
        self.core.emit(SessionEvent::CallStatusChanged { call_id, status });
    }
}

impl CoreState for CallState {
    fn core(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    fn live_token(&self) -> Option<SessionToken> {
        self.live().map(CallSession::token)
    }
}

/// State machine for 1:1 and group calls
pub struct CallSessionMachine {
    local_id: ParticipantId,
    config: CallConfig,
    signals: Arc<dyn SignalChannel>,
    capability: Arc<dyn MediaCapability>,
    state: Mutex<CallState>,
}

impl CallSessionMachine {
    /// Create an idle machine
    ///
    /// Connection events are reported on `peer_events`; view notifications
    /// go to `events`.
    pub fn new(
        local_id: ParticipantId,
        config: CallConfig,
        signals: Arc<dyn SignalChannel>,
        capability: Arc<dyn MediaCapability>,
        factory: Arc<dyn ConnectionFactory>,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let peers = PeerRegistry::new(SessionOrigin::Call, factory, signals.clone(), peer_events);
        Self {
            local_id,
            config,
            signals,
            capability,
            state: Mutex::new(CallState {
                session: None,
                pending_initiate: None,
                pending_offers: HashMap::new(),
                retired: VecDeque::new(),
                core: SessionCore::new(SessionOrigin::Call, peers, events),
            }),
        }
    }

    /// Copy of the current (or last) call
    pub async fn session(&self) -> Option<CallSession> {
        self.state.lock().await.session.clone()
    }

    /// Number of open peer sessions
    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.core.peers.len()
    }

    /// Whether an outgoing call is waiting for media or the server
    pub async fn is_initiating(&self) -> bool {
        self.state.lock().await.pending_initiate.is_some()
    }

    fn route(&self, call_id: &CallId) -> SignalRoute {
        SignalRoute::call(call_id.clone(), self.local_id.clone())
    }

    async fn emit(&self, message: SignalingMessage) {
        let event = message.name();
        if let Err(e) = self.signals.emit(message).await {
            tracing::warn!(event, "Failed to send: {}", e);
        }
    }

    /// Place a call
    ///
    /// Acquires local media for `kind`, asks the server to create the call and
    /// enters CALLING. A 1:1 call immediately opens an initiator peer session
    /// toward the recipient.
    ///
    /// # Errors
    ///
    /// Fails without side effects if another call is in progress, the
    /// recipient list is invalid, media cannot be acquired or the server
    /// refuses. Returns [`SessionError::Cancelled`] if the attempt was ended
    /// while waiting.
    #[tracing::instrument(skip(self, conversation), fields(recipients = recipients.len()))]
    pub async fn initiate(
        &self,
        recipients: Vec<ParticipantId>,
        kind: CallKind,
        conversation: Option<String>,
    ) -> Result<CallId, SessionError> {
        if recipients.is_empty() {
            return Err(SessionError::NoRecipients);
        }
        let requested = recipients.len() + 1;
        if requested > self.config.max_group_participants {
            return Err(SessionError::GroupTooLarge {
                requested,
                limit: self.config.max_group_participants,
            });
        }

        let token = SessionToken::new();
        {
            let mut state = self.state.lock().await;
            if state.pending_initiate.is_some() || state.live().is_some() {
                return Err(SessionError::Busy);
            }
            state.pending_initiate = Some(token);
        }

        let media = match self.capability.acquire(kind.has_video()).await {
            Ok(media) => media,
            Err(e) => {
                self.abandon_initiate(token).await;
                return Err(e.into());
            }
        };
        if self.state.lock().await.pending_initiate != Some(token) {
            media.stop();
            return Err(SessionError::Cancelled);
        }

        let ack = self
            .signals
            .request(SignalingMessage::CallInitiate {
                recipients: recipients.clone(),
                kind,
                conversation: conversation.clone(),
            })
            .await;
        let (call_id, participants) = match ack {
            Ok(SignalingAck::Ok { call_id, participants }) => (call_id, participants),
            Ok(SignalingAck::Error { message }) => {
                media.stop();
                self.abandon_initiate(token).await;
                return Err(SessionError::Rejected(message));
            }
            Err(e) => {
                media.stop();
                self.abandon_initiate(token).await;
                return Err(e.into());
            }
        };

        let mut guard = self.state.lock().await;
        if guard.pending_initiate != Some(token) {
            guard.retire(call_id.clone());
            drop(guard);
            media.stop();
            tracing::info!(call_id = %call_id, "Call ended before the server answered");
            self.emit(SignalingMessage::CallEnd { call_id }).await;
            return Err(SessionError::Cancelled);
        }
        let state = &mut *guard;
        state.pending_initiate = None;

        let mut session = CallSession::new(token, call_id.clone(), kind, CallStatus::Calling);
        session.conversation = conversation;
        for participant in participants {
            if participant.id != self.local_id {
                session.add_participant(participant);
            }
        }
        for id in &recipients {
            if session.participant(id).is_none() {
                session.add_participant(Participant::new(id.clone(), id.as_str()));
            }
        }
        state.pending_offers.clear();
        state.core.attach_media(media);
        state.session = Some(session);
        tracing::info!(call_id = %call_id, ?kind, "Call initiated");
        state.core.emit(SessionEvent::CallStatusChanged {
            call_id: call_id.clone(),
            status: CallStatus::Calling,
        });

        if let [callee] = recipients.as_slice() {
            match state.core.open_peer(callee, true, token, self.route(&call_id)).await {
                Ok(_) => state.core.peers.initiate(callee).await,
                Err(e) => tracing::warn!(callee = %callee, "Could not open peer session: {}", e),
            }
        }
        Ok(call_id)
    }

    async fn abandon_initiate(&self, token: SessionToken) {
        let mut state = self.state.lock().await;
        if state.pending_initiate == Some(token) {
            state.pending_initiate = None;
        }
    }

    /// Accept the ringing call
    ///
    /// Local media is acquired first; only then does the call turn ACTIVE
    /// and the caller's offer, if it already arrived, get answered.
    ///
    /// # Errors
    ///
    /// Fails if nothing is ringing or media cannot be acquired (the call
    /// keeps ringing). Returns [`SessionError::Cancelled`] if the call ended
    /// while media was being acquired.
    #[tracing::instrument(skip(self))]
    pub async fn accept(&self) -> Result<CallId, SessionError> {
        let (token, call_id, kind) = {
            let state = self.state.lock().await;
            match state.session.as_ref() {
                Some(s) if s.status == CallStatus::Ringing => (s.token, s.call_id.clone(), s.kind),
                _ => {
                    return Err(SessionError::InvalidState {
                        operation: "accept",
                        state: state.describe(),
                    })
                }
            }
        };

        let media = self.capability.acquire(kind.has_video()).await?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let still_ringing = state
            .session
            .as_ref()
            .is_some_and(|s| s.token == token && s.status == CallStatus::Ringing);
        if !still_ringing {
            media.stop();
            tracing::info!(call_id = %call_id, "Call ended while acquiring media");
            return Err(SessionError::Cancelled);
        }

        state.core.attach_media(media);
        state.set_status(CallStatus::Active);
        if let Err(e) = self
            .signals
            .emit(SignalingMessage::CallAccept {
                call_id: call_id.clone(),
            })
            .await
        {
            self.teardown(state, TeardownReason::LocalEnd, false).await;
            return Err(e.into());
        }

        let route = self.route(&call_id);
        let caller = state
            .session
            .as_ref()
            .and_then(|s| s.initiator.as_ref())
            .map(|p| p.id.clone());
        if let Some(caller) = caller {
            if let Err(e) = state.core.open_peer(&caller, false, token, route.clone()).await {
                tracing::warn!(caller = %caller, "Could not open peer session: {}", e);
            }
        }
        let held: Vec<_> = state.pending_offers.drain().collect();
        for (from, offer) in held {
            tracing::debug!(from = %from, "Answering held offer");
            if let Err(e) = state.core.open_peer(&from, false, token, route.clone()).await {
                tracing::warn!(from = %from, "Could not open peer session: {}", e);
                continue;
            }
            state.core.peers.apply_offer(&from, offer).await;
        }
        Ok(call_id)
    }

    /// Decline the ringing call
    ///
    /// # Errors
    ///
    /// Fails if nothing is ringing
    #[tracing::instrument(skip(self))]
    pub async fn reject(&self, reason: Option<String>) -> Result<(), SessionError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let call_id = match state.live() {
            Some(s) if s.status == CallStatus::Ringing => s.call_id.clone(),
            _ => {
                return Err(SessionError::InvalidState {
                    operation: "reject",
                    state: state.describe(),
                })
            }
        };
        self.emit(SignalingMessage::CallReject { call_id, reason }).await;
        self.teardown(state, TeardownReason::LocalReject, false).await;
        Ok(())
    }

    /// Hang up
    ///
    /// Ends the live call, or abandons an outgoing call that is still
    /// waiting for media or the server.
    ///
    /// # Errors
    ///
    /// Fails if there is nothing to end
    #[tracing::instrument(skip(self))]
    pub async fn end(&self) -> Result<(), SessionError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let abandoned = state.pending_initiate.take().is_some();

        let ringing = match state.live() {
            Some(s) if s.status == CallStatus::Ringing => Some(s.call_id.clone()),
            Some(_) => None,
            None if abandoned => {
                tracing::info!("Outgoing call abandoned");
                return Ok(());
            }
            None => return Err(SessionError::NoSession),
        };
        match ringing {
            Some(call_id) => {
                self.emit(SignalingMessage::CallReject { call_id, reason: None }).await;
                self.teardown(state, TeardownReason::LocalReject, false).await;
            }
            None => self.teardown(state, TeardownReason::LocalEnd, true).await,
        }
        Ok(())
    }

    async fn teardown(&self, state: &mut CallState, reason: TeardownReason, notify: bool) {
        let Some(call_id) = state.live().map(|s| s.call_id.clone()) else {
            return;
        };
        if notify {
            self.emit(SignalingMessage::CallEnd {
                call_id: call_id.clone(),
            })
            .await;
        }
        state.pending_offers.clear();
        state.core.teardown().await;
        state.retire(call_id.clone());
        state.set_status(CallStatus::Ended);
        tracing::info!(call_id = %call_id, ?reason, "Call torn down");
        state.core.emit(SessionEvent::CallEnded { call_id, reason });
    }

    /// Remove one participant; the call ends when nobody is left
    async fn drop_participant(&self, state: &mut CallState, participant_id: &ParticipantId, reason: TeardownReason) {
        state.pending_offers.remove(participant_id);
        state.core.close_peer(participant_id).await;
        let Some(session) = state.session.as_mut() else {
            return;
        };
        if session.remove_participant(participant_id) {
            tracing::info!(call_id = %session.call_id, participant = %participant_id, "Participant left");
            let call_id = session.call_id.clone();
            state.core.emit(SessionEvent::ParticipantLeft {
                call_id,
                participant_id: participant_id.clone(),
            });
        }
        let alone = state.live().is_some_and(|s| s.roster.is_empty()) && state.core.peers.is_empty();
        if alone {
            self.teardown(state, reason, true).await;
        }
    }

    async fn on_incoming(
        &self,
        state: &mut CallState,
        call_id: CallId,
        kind: CallKind,
        caller: Participant,
        participants: Vec<Participant>,
    ) {
        if state.pending_initiate.is_some() || state.live().is_some() {
            if state.live().is_some_and(|s| s.call_id == call_id) {
                tracing::debug!(call_id = %call_id, "Duplicate incoming call notification");
                return;
            }
            tracing::info!(call_id = %call_id, caller = %caller.id, "Busy, rejecting incoming call");
            state.retire(call_id.clone());
            self.emit(SignalingMessage::CallReject {
                call_id,
                reason: Some("busy".to_string()),
            })
            .await;
            return;
        }

        let mut session = CallSession::new(SessionToken::new(), call_id.clone(), kind, CallStatus::Ringing);
        session.add_participant(caller.clone());
        for participant in participants {
            if participant.id != self.local_id {
                session.add_participant(participant);
            }
        }
        session.initiator = Some(caller.clone());
        state.pending_offers.clear();
        state.session = Some(session);

        tracing::info!(call_id = %call_id, caller = %caller.id, ?kind, "Incoming call");
        state.core.emit(SessionEvent::IncomingCall {
            call_id: call_id.clone(),
            kind,
            caller,
        });
        state.core.emit(SessionEvent::CallStatusChanged {
            call_id,
            status: CallStatus::Ringing,
        });
    }

    async fn on_accepted(&self, state: &mut CallState, call_id: CallId, participant: Participant) {
        if state.current(&call_id, "accepted").is_none() || participant.id == self.local_id {
            return;
        }
        if let Some(session) = state.session.as_mut() {
            if session.add_participant(participant.clone()) {
                state.core.emit(SessionEvent::ParticipantJoined {
                    call_id: call_id.clone(),
                    participant: participant.clone(),
                });
            }
        }
        tracing::info!(call_id = %call_id, participant = %participant.id, "Call accepted by remote");
        if state.live().is_some_and(|s| s.status == CallStatus::Calling) {
            state.set_status(CallStatus::Active);
        }
    }

    async fn on_rejected(&self, state: &mut CallState, call_id: CallId, participant_id: ParticipantId) {
        let Some(status) = state.current(&call_id, "rejected").map(|s| s.status) else {
            return;
        };
        tracing::info!(call_id = %call_id, participant = %participant_id, "Call rejected by remote");
        match status {
            CallStatus::Calling | CallStatus::Ringing => {
                self.teardown(state, TeardownReason::RemoteRejected, false).await;
            }
            _ => {
                self.drop_participant(state, &participant_id, TeardownReason::RemoteRejected)
                    .await;
            }
        }
    }

    async fn on_ended(&self, state: &mut CallState, call_id: CallId, participant_id: Option<ParticipantId>) {
        let Some((status, kind)) = state.current(&call_id, "ended").map(|s| (s.status, s.kind)) else {
            return;
        };
        match (status, participant_id) {
            (CallStatus::Active, Some(participant_id)) if kind.is_group() => {
                self.drop_participant(state, &participant_id, TeardownReason::RemoteEnded)
                    .await;
            }
            _ => self.teardown(state, TeardownReason::RemoteEnded, false).await,
        }
    }

    async fn on_offer(
        &self,
        state: &mut CallState,
        call_id: CallId,
        from: ParticipantId,
        description: SessionDescription,
    ) {
        let Some((status, token)) = state.current(&call_id, "offer").map(|s| (s.status, s.token)) else {
            return;
        };
        if from == self.local_id {
            return;
        }
        if status == CallStatus::Ringing {
            tracing::debug!(from = %from, "Holding offer until the call is accepted");
            state.pending_offers.insert(from, description);
            return;
        }
        if let Err(e) = state.core.open_peer(&from, false, token, self.route(&call_id)).await {
            tracing::warn!(from = %from, "Could not open peer session: {}", e);
            return;
        }
        state.core.peers.apply_offer(&from, description).await;
    }

    async fn on_answer(&self, state: &mut CallState, call_id: CallId, from: ParticipantId, description: SessionDescription) {
        if state.current(&call_id, "answer").is_some() {
            state.core.peers.apply_answer(&from, description).await;
        }
    }

    async fn on_candidate(&self, state: &mut CallState, call_id: CallId, from: ParticipantId, candidate: IceCandidate) {
        if state.current(&call_id, "ice-candidate").is_some() {
            state.core.peers.apply_candidate(&from, candidate).await;
        }
    }

    fn on_presence(
        &self,
        state: &mut CallState,
        call_id: CallId,
        participant_id: ParticipantId,
        update: impl FnOnce(&mut Participant),
    ) {
        if state.current(&call_id, "presence").is_none() {
            return;
        }
        let Some(participant) = state
            .session
            .as_mut()
            .and_then(|s| s.roster.iter_mut().find(|p| p.id == participant_id))
        else {
            return;
        };
        update(participant);
        let participant = participant.clone();
        state
            .core
            .emit(SessionEvent::ParticipantMediaChanged { call_id, participant });
    }

    async fn on_joined(&self, state: &mut CallState, call_id: CallId, participant: Participant) {
        let Some((status, token)) = state.current(&call_id, "participant-joined").map(|s| (s.status, s.token)) else {
            return;
        };
        if participant.id == self.local_id {
            return;
        }
        let id = participant.id.clone();
        if let Some(session) = state.session.as_mut() {
            if session.add_participant(participant.clone()) {
                tracing::info!(call_id = %call_id, participant = %id, "Participant joined");
                state.core.emit(SessionEvent::ParticipantJoined {
                    call_id: call_id.clone(),
                    participant,
                });
            }
        }
        if status == CallStatus::Ringing {
            return;
        }
        if status == CallStatus::Calling {
            state.set_status(CallStatus::Active);
        }
        match state.core.open_peer(&id, true, token, self.route(&call_id)).await {
            Ok(true) => state.core.peers.initiate(&id).await,
            Ok(false) => tracing::debug!(participant = %id, "Already connected to participant"),
            Err(e) => tracing::warn!(participant = %id, "Could not open peer session: {}", e),
        }
    }

    async fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let call_id = state.live()?.call_id.clone();
        let off = !state.core.toggle(kind)?;
        let message = match kind {
            TrackKind::Audio => SignalingMessage::CallToggleMute {
                call_id,
                participant_id: self.local_id.clone(),
                muted: off,
            },
            TrackKind::Video => SignalingMessage::CallToggleVideo {
                call_id,
                participant_id: self.local_id.clone(),
                video_off: off,
            },
        };
        self.emit(message).await;
        Some(off)
    }
}

#[async_trait]
impl SessionMachine for CallSessionMachine {
    fn origin(&self) -> SessionOrigin {
        SessionOrigin::Call
    }

    async fn handle_signal(&self, message: SignalingMessage) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if let Some(call_id) = message.call_id().filter(|id| state.is_retired(id)) {
            tracing::debug!(call_id = %call_id, event = message.name(), "Ignoring event for ended call");
            return;
        }
        match message {
            SignalingMessage::CallIncoming {
                call_id,
                kind,
                caller,
                participants,
            } => self.on_incoming(state, call_id, kind, caller, participants).await,
            SignalingMessage::CallAccepted { call_id, participant } => {
                self.on_accepted(state, call_id, participant).await;
            }
            SignalingMessage::CallRejected {
                call_id, participant_id, ..
            } => self.on_rejected(state, call_id, participant_id).await,
            SignalingMessage::CallEnded {
                call_id, participant_id,
            } => self.on_ended(state, call_id, participant_id).await,
            SignalingMessage::CallOffer {
                call_id,
                from,
                description,
                ..
            } => self.on_offer(state, call_id, from, description).await,
            SignalingMessage::CallAnswer {
                call_id,
                from,
                description,
                ..
            } => self.on_answer(state, call_id, from, description).await,
            SignalingMessage::CallIceCandidate {
                call_id,
                from,
                candidate,
                ..
            } => self.on_candidate(state, call_id, from, candidate).await,
            SignalingMessage::CallToggleMute {
                call_id,
                participant_id,
                muted,
            } => self.on_presence(state, call_id, participant_id, |p| p.is_muted = muted),
            SignalingMessage::CallToggleVideo {
                call_id,
                participant_id,
                video_off,
            } => self.on_presence(state, call_id, participant_id, |p| p.is_video_off = video_off),
            SignalingMessage::ParticipantJoined { call_id, participant } => {
                self.on_joined(state, call_id, participant).await;
            }
            SignalingMessage::ParticipantLeft {
                call_id,
                participant_id,
            } => {
                if state.current(&call_id, "participant-left").is_some() {
                    self.drop_participant(state, &participant_id, TeardownReason::RemoteEnded)
                        .await;
                }
            }
            other => tracing::trace!(event = other.name(), "Not a call event"),
        }
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.accepts(&event) {
            return;
        }
        let participant_id = event.participant_id;
        match state.core.apply_connection_event(&participant_id, event.event).await {
            Some(ConnectionState::Connected) => {
                if state.live().is_some_and(|s| s.status == CallStatus::Calling) {
                    state.set_status(CallStatus::Active);
                }
            }
            Some(s) if s.requires_teardown() => {
                if state.live().is_some_and(|s| s.kind.is_group()) {
                    self.drop_participant(state, &participant_id, TeardownReason::ConnectionFailed)
                        .await;
                } else {
                    self.teardown(state, TeardownReason::ConnectionFailed, true).await;
                }
            }
            _ => {}
        }
    }

    async fn is_live(&self) -> bool {
        self.state.lock().await.live().is_some()
    }

    async fn toggle_mute(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio).await
    }

    async fn toggle_video(&self) -> Option<bool> {
        self.toggle(TrackKind::Video).await
    }

    async fn switch_camera(&self) -> Result<CameraFacing, SessionError> {
        machine::switch_camera(&self.state, self.capability.as_ref()).await
    }

    async fn start_screen_share(&self) -> Result<(), SessionError> {
        machine::start_screen_share(&self.state, self.capability.as_ref()).await
    }

    async fn stop_screen_share(&self) -> Result<(), SessionError> {
        machine::stop_screen_share(&self.state).await
    }

    async fn media_snapshot(&self) -> MediaSnapshot {
        self.state.lock().await.core.snapshot()
    }

    async fn shutdown(&self, reason: TeardownReason) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.pending_initiate = None;
        self.teardown(state, reason, false).await;
    }
}
