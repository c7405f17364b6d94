//! Anonymous pool matching
//!
//! [`MatchSessionMachine`] enters the server's pool, waits to be paired and
//! then negotiates exactly one peer session with the partner. The server
//! decides which side offers.

use crate::connection::{ConnectionFactory, PeerEvent};
use crate::identity::ParticipantId;
use crate::machine::{self, CoreState, MediaSnapshot, SessionCore, SessionError, SessionMachine};
use crate::media::MediaCapability;
use crate::peer::{PeerRegistry, SignalRoute};
use crate::signaling::{SignalChannel, SignalingMessage};
use crate::types::{
    CameraFacing, MatchRole, MatchStatus, SessionEvent, SessionOrigin, SessionToken, TeardownReason, TrackKind,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};

/// Match machine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Send camera video to partners
    pub video: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self { video: true }
    }
}

/// The current partner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchSession {
    /// Assigned role
    pub role: MatchRole,
    /// Transient id of the partner
    pub partner_id: ParticipantId,
    /// Partner display name
    pub partner_name: String,
}

struct MatchState {
    status: MatchStatus,
    token: Option<SessionToken>,
    /// `find-partner` went out for the current token
    in_pool: bool,
    session: Option<MatchSession>,
    core: SessionCore,
}

impl MatchState {
    fn set_status(&mut self, status: MatchStatus) {
        if self.status == status {
            return;
        }
        tracing::info!(old_status = ?self.status, new_status = ?status, "Match status changed");
        self.status = status;
        self.core.emit(SessionEvent::MatchStatusChanged { status });
    }

    /// Whether `from` is the current partner
    fn is_partner(&self, from: &ParticipantId, event: &str) -> bool {
        let matches = self.session.as_ref().is_some_and(|s| &s.partner_id == from);
        if !matches {
            tracing::debug!(from = %from, event, "Ignoring signal from a former partner");
        }
        matches
    }
}

impl CoreState for MatchState {
    fn core(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    fn live_token(&self) -> Option<SessionToken> {
        self.token
    }
}

/// State machine for stranger pairing
pub struct MatchSessionMachine {
    local_id: ParticipantId,
    config: MatchConfig,
    signals: Arc<dyn SignalChannel>,
    capability: Arc<dyn MediaCapability>,
    state: Mutex<MatchState>,
}

impl MatchSessionMachine {
    /// Create an idle machine
    pub fn new(
        local_id: ParticipantId,
        config: MatchConfig,
        signals: Arc<dyn SignalChannel>,
        capability: Arc<dyn MediaCapability>,
        factory: Arc<dyn ConnectionFactory>,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let peers = PeerRegistry::new(SessionOrigin::Match, factory, signals.clone(), peer_events);
        Self {
            local_id,
            config,
            signals,
            capability,
            state: Mutex::new(MatchState {
                status: MatchStatus::Idle,
                token: None,
                in_pool: false,
                session: None,
                core: SessionCore::new(SessionOrigin::Match, peers, events),
            }),
        }
    }

    /// Current status
    pub async fn status(&self) -> MatchStatus {
        self.state.lock().await.status
    }

    /// Current partner, if connected
    pub async fn session(&self) -> Option<MatchSession> {
        self.state.lock().await.session.clone()
    }

    /// Number of open peer sessions (0 or 1)
    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.core.peers.len()
    }

    /// Enter the pool
    ///
    /// Local media is acquired before the server is asked for a partner, so
    /// negotiation never starts without tracks.
    ///
    /// # Errors
    ///
    /// Fails if already searching or connected, if media cannot be acquired,
    /// or if the request cannot be sent. Returns [`SessionError::Cancelled`]
    /// if `leave` ran while media was being acquired.
    #[tracing::instrument(skip(self))]
    pub async fn find_partner(&self) -> Result<(), SessionError> {
        let token = SessionToken::new();
        {
            let mut state = self.state.lock().await;
            if state.status != MatchStatus::Idle {
                return Err(SessionError::InvalidState {
                    operation: "find a partner",
                    state: format!("{:?}", state.status).to_lowercase(),
                });
            }
            state.token = Some(token);
            state.set_status(MatchStatus::Searching);
        }

        let media = match self.capability.acquire(self.config.video).await {
            Ok(media) => media,
            Err(e) => {
                let mut state = self.state.lock().await;
                if state.token == Some(token) {
                    state.token = None;
                    state.set_status(MatchStatus::Idle);
                }
                return Err(e.into());
            }
        };

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.token != Some(token) {
            media.stop();
            return Err(SessionError::Cancelled);
        }
        state.core.attach_media(media);
        if let Err(e) = self.signals.emit(SignalingMessage::FindPartner).await {
            self.teardown(state, TeardownReason::TransportDisconnected, false).await;
            return Err(e.into());
        }
        state.in_pool = true;
        tracing::info!("Searching for a partner");
        Ok(())
    }

    /// Leave the pool or the current partner
    ///
    /// Idle is a no-op.
    ///
    /// # Errors
    ///
    /// Currently always succeeds
    #[tracing::instrument(skip(self))]
    pub async fn leave(&self) -> Result<(), SessionError> {
        let mut guard = self.state.lock().await;
        self.teardown(&mut guard, TeardownReason::LocalEnd, true).await;
        Ok(())
    }

    /// Drop the current partner and search again
    ///
    /// # Errors
    ///
    /// Same as [`find_partner`](Self::find_partner)
    #[tracing::instrument(skip(self))]
    pub async fn next(&self) -> Result<(), SessionError> {
        self.leave().await?;
        self.find_partner().await
    }

    async fn teardown(&self, state: &mut MatchState, reason: TeardownReason, notify: bool) {
        if state.status == MatchStatus::Idle && state.token.is_none() {
            return;
        }
        if notify && state.in_pool {
            if let Err(e) = self.signals.emit(SignalingMessage::LeavePool).await {
                tracing::warn!("Failed to send leave-pool: {}", e);
            }
        }
        state.token = None;
        state.in_pool = false;
        state.session = None;
        state.core.teardown().await;
        state.set_status(MatchStatus::Idle);
        tracing::info!(?reason, "Match torn down");
    }

    async fn on_match_found(&self, state: &mut MatchState, role: MatchRole, partner_id: ParticipantId, partner_name: String) {
        let Some(token) = state.token else {
            tracing::debug!("Match found while idle, ignoring");
            return;
        };
        if state.status != MatchStatus::Searching || state.core.media().is_none() {
            tracing::debug!(status = ?state.status, "Unexpected match notification");
            return;
        }

        tracing::info!(partner = %partner_id, ?role, "Matched with partner");
        state.session = Some(MatchSession {
            role,
            partner_id: partner_id.clone(),
            partner_name: partner_name.clone(),
        });
        state.set_status(MatchStatus::Connected);
        state.core.emit(SessionEvent::MatchFound { role, partner_name });

        let is_initiator = role == MatchRole::Initiator;
        let route = SignalRoute::matched(self.local_id.clone());
        match state.core.open_peer(&partner_id, is_initiator, token, route).await {
            Ok(_) if is_initiator => state.core.peers.initiate(&partner_id).await,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(partner = %partner_id, "Could not open peer session: {}", e);
                self.teardown(state, TeardownReason::ConnectionFailed, true).await;
            }
        }
    }

    async fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let state = self.state.lock().await;
        state.token?;
        state.core.toggle(kind).map(|enabled| !enabled)
    }
}

#[async_trait]
impl SessionMachine for MatchSessionMachine {
    fn origin(&self) -> SessionOrigin {
        SessionOrigin::Match
    }

    async fn handle_signal(&self, message: SignalingMessage) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        match message {
            SignalingMessage::WaitingForPartner => {
                tracing::debug!(status = ?state.status, "Waiting for a partner");
            }
            SignalingMessage::MatchFound {
                role,
                partner_id,
                partner_name,
            } => self.on_match_found(state, role, partner_id, partner_name).await,
            SignalingMessage::SignalOffer { from, description, .. } => {
                if state.is_partner(&from, "signal-offer") {
                    state.core.peers.apply_offer(&from, description).await;
                }
            }
            SignalingMessage::SignalAnswer { from, description, .. } => {
                if state.is_partner(&from, "signal-answer") {
                    state.core.peers.apply_answer(&from, description).await;
                }
            }
            SignalingMessage::SignalIceCandidate { from, candidate, .. } => {
                if state.is_partner(&from, "signal-ice-candidate") {
                    state.core.peers.apply_candidate(&from, candidate).await;
                }
            }
            SignalingMessage::MatchEnded { partner_id } => {
                if let Some(id) = &partner_id {
                    if !state.is_partner(id, "match-ended") {
                        return;
                    }
                }
                if state.session.is_some() {
                    tracing::info!("Partner left");
                    self.teardown(state, TeardownReason::RemoteEnded, false).await;
                }
            }
            other => tracing::trace!(event = other.name(), "Not a match event"),
        }
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.accepts(&event) {
            return;
        }
        let outcome = state
            .core
            .apply_connection_event(&event.participant_id, event.event)
            .await;
        if outcome.is_some_and(|s| s.requires_teardown()) {
            self.teardown(state, TeardownReason::ConnectionFailed, true).await;
        }
    }

    async fn is_live(&self) -> bool {
        self.state.lock().await.status != MatchStatus::Idle
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
        self.teardown(&mut guard, reason, false).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::connection::ConnectionEvent;
    use crate::media::MediaError;
    use crate::signaling::SignalingHandler;
    use crate::testing::{drain_events, FakeConnectionFactory, FakeMediaCapability, MockSignalingTransport};
    use crate::types::{ConnectionState, SessionDescription};

    struct Harness {
        transport: Arc<MockSignalingTransport>,
        capability: Arc<FakeMediaCapability>,
        factory: Arc<FakeConnectionFactory>,
        machine: MatchSessionMachine,
        events: broadcast::Receiver<SessionEvent>,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn harness() -> Harness {
        let transport = Arc::new(MockSignalingTransport::new());
        let capability = Arc::new(FakeMediaCapability::new());
        let factory = Arc::new(FakeConnectionFactory::new());
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = broadcast::channel(64);
        let machine = MatchSessionMachine::new(
            ParticipantId::new("me"),
            MatchConfig::default(),
            Arc::new(SignalingHandler::new(transport.clone())),
            capability.clone(),
            factory.clone(),
            peer_tx,
            events_tx,
        );
        Harness {
            transport,
            capability,
            factory,
            machine,
            events,
            peer_events: peer_rx,
        }
    }

    fn found(role: MatchRole, partner: &str) -> SignalingMessage {
        SignalingMessage::MatchFound {
            role,
            partner_id: ParticipantId::new(partner),
            partner_name: format!("Stranger {partner}"),
        }
    }

    #[tokio::test]
    async fn test_find_partner_then_match_as_initiator() {
        let mut h = harness();
        h.machine.find_partner().await.unwrap();
        assert_eq!(h.machine.status().await, MatchStatus::Searching);
        assert_eq!(h.transport.sent_names(), vec!["find-partner"]);

        h.machine.handle_signal(SignalingMessage::WaitingForPartner).await;
        h.machine.handle_signal(found(MatchRole::Initiator, "p1")).await;

        assert_eq!(h.machine.status().await, MatchStatus::Connected);
        assert_eq!(h.machine.peer_count().await, 1);
        assert_eq!(h.transport.sent_names(), vec!["find-partner", "signal-offer"]);
        let conn = h.factory.connection_for(&ParticipantId::new("p1")).unwrap();
        assert_eq!(conn.track_ids(), vec!["mic-1", "camera-2"]);

        let events = drain_events(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::MatchFound { role: MatchRole::Initiator, partner_name } if partner_name == "Stranger p1"
        )));
    }

    #[tokio::test]
    async fn test_responder_answers_partner_offer() {
        let h = harness();
        h.machine.find_partner().await.unwrap();
        h.machine.handle_signal(found(MatchRole::Responder, "p1")).await;
        assert_eq!(h.transport.sent_names(), vec!["find-partner"]);

        h.machine
            .handle_signal(SignalingMessage::SignalOffer {
                from: ParticipantId::new("p1"),
                to: ParticipantId::new("me"),
                description: SessionDescription::offer("v=0"),
            })
            .await;
        assert_eq!(h.transport.sent_names(), vec!["find-partner", "signal-answer"]);
    }

    #[tokio::test]
    async fn test_find_partner_twice_is_refused() {
        let h = harness();
        h.machine.find_partner().await.unwrap();
        assert!(matches!(
            h.machine.find_partner().await,
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_media_failure_returns_to_idle() {
        let h = harness();
        h.capability.fail_with(MediaError::DeviceBusy("camera".to_string()));
        assert!(matches!(
            h.machine.find_partner().await,
            Err(SessionError::Media(MediaError::DeviceBusy(_)))
        ));
        assert_eq!(h.machine.status().await, MatchStatus::Idle);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_leave_during_acquisition_cancels() {
        let h = harness();
        let gate = h.capability.hold_next();

        let search = h.machine.find_partner();
        let leave = async {
            tokio::task::yield_now().await;
            h.machine.leave().await.unwrap();
            gate.send(()).unwrap();
        };
        let (result, ()) = tokio::join!(search, leave);

        assert_eq!(result, Err(SessionError::Cancelled));
        assert_eq!(h.machine.status().await, MatchStatus::Idle);
        assert!(h.capability.all_released());
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_leave_after_search_notifies_pool() {
        let h = harness();
        h.machine.find_partner().await.unwrap();
        h.machine.leave().await.unwrap();
        assert_eq!(h.transport.sent_names(), vec!["find-partner", "leave-pool"]);

        h.machine.leave().await.unwrap();
        assert_eq!(h.transport.sent_names(), vec!["find-partner", "leave-pool"]);
    }

    #[tokio::test]
    async fn test_partner_disconnect_does_not_notify() {
        let h = harness();
        h.machine.find_partner().await.unwrap();
        h.machine.handle_signal(found(MatchRole::Responder, "p1")).await;
        h.transport.clear_sent();

        h.machine
            .handle_signal(SignalingMessage::MatchEnded {
                partner_id: Some(ParticipantId::new("p1")),
            })
            .await;
        assert_eq!(h.machine.status().await, MatchStatus::Idle);
        assert!(h.transport.sent().is_empty());
        assert_eq!(h.factory.open_connections(), 0);
        assert!(h.capability.all_released());
    }

    #[tokio::test]
    async fn test_match_ended_for_other_partner_ignored() {
        let h = harness();
        h.machine.find_partner().await.unwrap();
        h.machine.handle_signal(found(MatchRole::Responder, "p2")).await;
        h.machine
            .handle_signal(SignalingMessage::MatchEnded {
                partner_id: Some(ParticipantId::new("p1")),
            })
            .await;
        assert_eq!(h.machine.status().await, MatchStatus::Connected);
    }

    #[tokio::test]
    async fn test_connection_failure_leaves_pool() {
        let mut h = harness();
        h.machine.find_partner().await.unwrap();
        h.machine.handle_signal(found(MatchRole::Initiator, "p1")).await;
        let conn = h.factory.connection_for(&ParticipantId::new("p1")).unwrap();

        assert!(conn.emit(ConnectionEvent::StateChanged(ConnectionState::Failed)));
        let event = h.peer_events.try_recv().unwrap();
        h.machine.handle_peer_event(event).await;

        assert_eq!(h.machine.status().await, MatchStatus::Idle);
        assert_eq!(h.transport.sent_names().last(), Some(&"leave-pool"));
    }

    #[tokio::test]
    async fn test_toggle_is_local_only() {
        let h = harness();
        assert_eq!(h.machine.toggle_mute().await, None);
        h.machine.find_partner().await.unwrap();
        h.transport.clear_sent();

        assert_eq!(h.machine.toggle_video().await, Some(true));
        assert_eq!(h.machine.toggle_video().await, Some(false));
        assert!(h.transport.sent().is_empty());
    }
}
