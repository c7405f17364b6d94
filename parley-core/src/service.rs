//! Call orchestration
//!
//! [`CallOrchestrator`] is the only surface the view layer talks to. It owns
//! the signaling handle, both session machines and the dispatch table, and
//! forwards every inbound event to the machine registered for its name.

use crate::call::{CallConfig, CallSession, CallSessionMachine};
use crate::connection::{ConnectionFactory, PeerEvent};
use crate::dispatch::{DispatchTable, Route};
use crate::identity::ParticipantId;
use crate::machine::{MediaSnapshot, SessionError, SessionMachine};
use crate::matching::{MatchConfig, MatchSessionMachine};
use crate::media::MediaCapability;
use crate::signaling::{SignalChannel, SignalingError, SignalingHandler, SignalingMessage, SignalingTransport};
use crate::types::{CallId, CallKind, CameraFacing, MatchRole, MatchStatus, SessionEvent, SessionOrigin, TeardownReason};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Signaling transport error
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Call or match operation failed
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Call machine config
    pub call: CallConfig,
    /// Match machine config
    pub matching: MatchConfig,
    /// Buffered view events per subscriber
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            call: CallConfig::default(),
            matching: MatchConfig::default(),
            event_capacity: 256,
        }
    }
}

impl OrchestratorConfig {
    /// Parse and validate a JSON configuration; missing fields take defaults
    ///
    /// # Errors
    ///
    /// Returns error if the text is not valid JSON or the values are unusable
    pub fn from_json(text: &str) -> Result<Self, ServiceError> {
        let config: Self = serde_json::from_str(text).map_err(|e| ServiceError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values are usable
    ///
    /// # Errors
    ///
    /// Returns error describing the first bad value
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.event_capacity == 0 {
            return Err(ServiceError::ConfigError("event_capacity must be positive".to_string()));
        }
        if self.call.max_group_participants < 2 {
            return Err(ServiceError::ConfigError(
                "max_group_participants must allow at least two participants".to_string(),
            ));
        }
        Ok(())
    }
}

/// Match flow as the view layer sees it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSnapshot {
    /// Current status
    pub status: MatchStatus,
    /// Assigned role while connected
    pub role: Option<MatchRole>,
    /// Partner display name while connected
    pub partner_name: Option<String>,
}

/// Read-only view of the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorSnapshot {
    /// Current or last call
    pub call: Option<CallSession>,
    /// Match flow
    pub matching: MatchSnapshot,
    /// Machine whose media is shown, calls first
    pub active: Option<SessionOrigin>,
    /// Media of the active machine
    pub media: MediaSnapshot,
}

/// Façade over the call and match machines
pub struct CallOrchestrator<T: SignalingTransport> {
    local_id: ParticipantId,
    signaling: Arc<SignalingHandler<T>>,
    calls: CallSessionMachine,
    matches: MatchSessionMachine,
    routes: RwLock<DispatchTable>,
    peer_events: Mutex<mpsc::UnboundedReceiver<PeerEvent>>,
    event_sender: broadcast::Sender<SessionEvent>,
}

impl<T: SignalingTransport + 'static> CallOrchestrator<T> {
    /// Create an orchestrator for `local_id`
    ///
    /// Nothing is sent until [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(
        local_id: ParticipantId,
        signaling: Arc<SignalingHandler<T>>,
        capability: Arc<dyn MediaCapability>,
        factory: Arc<dyn ConnectionFactory>,
        config: OrchestratorConfig,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let (event_sender, _) = broadcast::channel(config.event_capacity);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let signals: Arc<dyn SignalChannel> = signaling.clone();

        let calls = CallSessionMachine::new(
            local_id.clone(),
            config.call,
            signals.clone(),
            capability.clone(),
            factory.clone(),
            peer_tx.clone(),
            event_sender.clone(),
        );
        let matches = MatchSessionMachine::new(
            local_id.clone(),
            config.matching,
            signals,
            capability,
            factory,
            peer_tx,
            event_sender.clone(),
        );

        Ok(Self {
            local_id,
            signaling,
            calls,
            matches,
            routes: RwLock::new(DispatchTable::new()),
            peer_events: Mutex::new(peer_rx),
            event_sender,
        })
    }

    /// Create a builder
    pub fn builder(local_id: ParticipantId, signaling: Arc<SignalingHandler<T>>) -> CallOrchestratorBuilder<T> {
        CallOrchestratorBuilder::new(local_id, signaling)
    }

    /// Local participant
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Call machine
    pub fn calls(&self) -> &CallSessionMachine {
        &self.calls
    }

    /// Match machine
    pub fn matches(&self) -> &MatchSessionMachine {
        &self.matches
    }

    /// Whether the transport is connected and events are routed
    pub fn is_connected(&self) -> bool {
        !self.routes.read().is_empty()
    }

    /// Subscribe to view events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_sender.subscribe()
    }

    /// Connect the transport, start routing and identify
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot connect or identify fails
    #[tracing::instrument(skip(self), fields(user = %self.local_id))]
    pub async fn connect(&self) -> Result<(), ServiceError> {
        tracing::info!("Connecting orchestrator");
        self.signaling.connect().await?;
        self.routes.write().register_defaults();
        if let Err(e) = self
            .signaling
            .send_message(SignalingMessage::Identify {
                user_id: self.local_id.clone(),
            })
            .await
        {
            self.routes.write().clear();
            return Err(e.into());
        }
        tracing::info!("Orchestrator connected");
        Ok(())
    }

    /// Tear down every session, stop routing and disconnect
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to disconnect
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<(), ServiceError> {
        self.shutdown_sessions().await;
        self.signaling.disconnect().await?;
        tracing::info!("Orchestrator disconnected");
        Ok(())
    }

    async fn shutdown_sessions(&self) {
        self.routes.write().clear();
        self.calls.shutdown(TeardownReason::TransportDisconnected).await;
        self.matches.shutdown(TeardownReason::TransportDisconnected).await;
    }

    fn machine(&self, route: Route) -> &dyn SessionMachine {
        match route {
            Route::Call => &self.calls,
            Route::Match => &self.matches,
        }
    }

    async fn active_machine(&self) -> Option<&dyn SessionMachine> {
        if self.calls.is_live().await {
            Some(&self.calls)
        } else if self.matches.is_live().await {
            Some(&self.matches)
        } else {
            None
        }
    }

    /// Local media is held by one flow at a time; refuse `route` while the
    /// other flow holds it
    async fn claim_media(&self, route: Route) -> Result<(), SessionError> {
        let held_elsewhere = match route {
            Route::Call => self.matches.is_live().await,
            Route::Match => self.calls.is_initiating().await || self.calls.media_snapshot().await.local.is_some(),
        };
        if held_elsewhere {
            tracing::info!(?route, "Local media is in use by the other session");
            return Err(SessionError::Busy);
        }
        Ok(())
    }

    /// Route one inbound message
    ///
    /// Events without a registered route are dropped.
    #[tracing::instrument(skip(self, message), fields(event = message.name()))]
    pub async fn handle_message(&self, message: SignalingMessage) {
        let route = self.routes.read().route(message.name());
        match route {
            Some(route) => self.machine(route).handle_signal(message).await,
            None => tracing::trace!("No route for event, dropping"),
        }
    }

    /// Apply one connection event
    pub async fn handle_peer_event(&self, event: PeerEvent) {
        let route = match event.origin {
            SessionOrigin::Call => Route::Call,
            SessionOrigin::Match => Route::Match,
        };
        self.machine(route).handle_peer_event(event).await;
    }

    /// Apply every queued connection event
    ///
    /// For embedders that drive the orchestrator without [`run`](Self::run);
    /// waits while `run` is active. Returns the number of events applied.
    pub async fn pump_peer_events(&self) -> usize {
        let mut applied = 0;
        loop {
            let next = self.peer_events.lock().await.try_recv();
            match next {
                Ok(event) => {
                    self.handle_peer_event(event).await;
                    applied += 1;
                }
                Err(_) => return applied,
            }
        }
    }

    /// Process signaling and connection events until the transport closes
    ///
    /// A closed or failed transport tears down every session as if the
    /// remote side had ended it.
    ///
    /// # Errors
    ///
    /// Returns error if receiving from the transport fails
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<(), ServiceError> {
        let mut peer_events = self.peer_events.lock().await;
        tracing::info!("Event loop started");
        loop {
            tokio::select! {
                received = self.signaling.receive_message() => match received {
                    Ok(Some(message)) => self.handle_message(message).await,
                    Ok(None) => {
                        tracing::info!("Event loop stopped");
                        self.shutdown_sessions().await;
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::error!("Signaling receive failed: {}", e);
                        self.shutdown_sessions().await;
                        return Err(e.into());
                    }
                },
                Some(event) = peer_events.recv() => self.handle_peer_event(event).await,
            }
        }
    }

    /// Place a call
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be placed
    #[tracing::instrument(skip(self, conversation), fields(recipients = recipients.len()))]
    pub async fn initiate_call(
        &self,
        recipients: Vec<ParticipantId>,
        kind: CallKind,
        conversation: Option<String>,
    ) -> Result<CallId, ServiceError> {
        tracing::info!(?kind, "Initiating call");
        self.claim_media(Route::Call).await?;
        let call_id = self.calls.initiate(recipients, kind, conversation).await?;
        tracing::info!(call_id = %call_id, "Call initiated");
        Ok(call_id)
    }

    /// Accept the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing, a match holds local media, or
    /// media cannot be acquired
    #[tracing::instrument(skip(self))]
    pub async fn accept_call(&self) -> Result<CallId, ServiceError> {
        self.claim_media(Route::Call).await?;
        Ok(self.calls.accept().await?)
    }

    /// Decline the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing
    #[tracing::instrument(skip(self))]
    pub async fn reject_call(&self, reason: Option<String>) -> Result<(), ServiceError> {
        Ok(self.calls.reject(reason).await?)
    }

    /// Hang up the current call
    ///
    /// # Errors
    ///
    /// Returns error if there is no call
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) -> Result<(), ServiceError> {
        Ok(self.calls.end().await?)
    }

    /// Enter the matching pool
    ///
    /// # Errors
    ///
    /// Returns error if already matching, a call holds local media, or
    /// media cannot be acquired
    #[tracing::instrument(skip(self))]
    pub async fn find_partner(&self) -> Result<(), ServiceError> {
        self.claim_media(Route::Match).await?;
        Ok(self.matches.find_partner().await?)
    }

    /// Skip to the next partner
    ///
    /// # Errors
    ///
    /// Returns error if re-entering the pool fails
    #[tracing::instrument(skip(self))]
    pub async fn next_partner(&self) -> Result<(), ServiceError> {
        self.claim_media(Route::Match).await?;
        Ok(self.matches.next().await?)
    }

    /// Leave the matching pool
    ///
    /// # Errors
    ///
    /// Returns error if leaving fails
    #[tracing::instrument(skip(self))]
    pub async fn leave_pool(&self) -> Result<(), ServiceError> {
        Ok(self.matches.leave().await?)
    }

    /// Flip the microphone of the active session
    ///
    /// Returns the new muted flag, or `None` when there is nothing to mute.
    pub async fn toggle_mute(&self) -> Option<bool> {
        self.active_machine().await?.toggle_mute().await
    }

    /// Flip the camera of the active session
    ///
    /// Returns the new video-off flag, or `None` when there is no camera.
    pub async fn toggle_video(&self) -> Option<bool> {
        self.active_machine().await?.toggle_video().await
    }

    /// Switch between front and back camera
    ///
    /// # Errors
    ///
    /// Returns error if nothing is live, there is no camera, or the other
    /// camera cannot be acquired
    #[tracing::instrument(skip(self))]
    pub async fn switch_camera(&self) -> Result<CameraFacing, ServiceError> {
        let machine = self.active_machine().await.ok_or(SessionError::NoSession)?;
        Ok(machine.switch_camera().await?)
    }

    /// Share the screen instead of the camera
    ///
    /// # Errors
    ///
    /// Returns error if nothing is live, the session has no video, or
    /// capture is refused
    #[tracing::instrument(skip(self))]
    pub async fn start_screen_share(&self) -> Result<(), ServiceError> {
        let machine = self.active_machine().await.ok_or(SessionError::NoSession)?;
        Ok(machine.start_screen_share().await?)
    }

    /// Return to the camera
    ///
    /// # Errors
    ///
    /// Returns error if the screen is not being shared
    #[tracing::instrument(skip(self))]
    pub async fn stop_screen_share(&self) -> Result<(), ServiceError> {
        let machine = self.active_machine().await.ok_or(SessionError::NoSession)?;
        Ok(machine.stop_screen_share().await?)
    }

    /// Read-only view of calls, matching and media
    pub async fn snapshot(&self) -> OrchestratorSnapshot {
        let partner = self.matches.session().await;
        let matching = MatchSnapshot {
            status: self.matches.status().await,
            role: partner.as_ref().map(|p| p.role),
            partner_name: partner.map(|p| p.partner_name),
        };
        let (active, media) = match self.active_machine().await {
            Some(machine) => (Some(machine.origin()), machine.media_snapshot().await),
            None => (None, MediaSnapshot::default()),
        };
        OrchestratorSnapshot {
            call: self.calls.session().await,
            matching,
            active,
            media,
        }
    }
}

/// Builder for [`CallOrchestrator`]
pub struct CallOrchestratorBuilder<T: SignalingTransport> {
    local_id: ParticipantId,
    signaling: Arc<SignalingHandler<T>>,
    capability: Option<Arc<dyn MediaCapability>>,
    factory: Option<Arc<dyn ConnectionFactory>>,
    config: OrchestratorConfig,
}

impl<T: SignalingTransport + 'static> CallOrchestratorBuilder<T> {
    /// Create a new builder
    pub fn new(local_id: ParticipantId, signaling: Arc<SignalingHandler<T>>) -> Self {
        Self {
            local_id,
            signaling,
            capability: None,
            factory: None,
            config: OrchestratorConfig::default(),
        }
    }

    /// Set the camera/microphone capability
    #[must_use]
    pub fn with_media_capability(mut self, capability: Arc<dyn MediaCapability>) -> Self {
        self.capability = Some(capability);
        self
    }

    /// Set the media connection factory
    ///
    /// Defaults to the `webrtc` backend when that feature is enabled.
    #[must_use]
    pub fn with_connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the orchestrator
    ///
    /// # Errors
    ///
    /// Returns error if no media capability was given, no connection factory
    /// is available, or the configuration is invalid
    pub fn build(self) -> Result<CallOrchestrator<T>, ServiceError> {
        let capability = self
            .capability
            .ok_or_else(|| ServiceError::InitError("no media capability configured".to_string()))?;
        let factory = match self.factory {
            Some(factory) => factory,
            None => default_connection_factory()?,
        };
        CallOrchestrator::new(self.local_id, self.signaling, capability, factory, self.config)
    }
}

#[cfg(feature = "webrtc-backend")]
fn default_connection_factory() -> Result<Arc<dyn ConnectionFactory>, ServiceError> {
    let factory = crate::webrtc_backend::WebRtcConnectionFactory::new(crate::connection::ConnectionConfig::default())
        .map_err(|e| ServiceError::InitError(e.to_string()))?;
    Ok(Arc::new(factory))
}

#[cfg(not(feature = "webrtc-backend"))]
fn default_connection_factory() -> Result<Arc<dyn ConnectionFactory>, ServiceError> {
    Err(ServiceError::InitError(
        "no connection factory configured".to_string(),
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnectionFactory, FakeMediaCapability, MockSignalingTransport};

    fn orchestrator(transport: Arc<MockSignalingTransport>) -> CallOrchestrator<MockSignalingTransport> {
        CallOrchestrator::builder(ParticipantId::new("alice"), Arc::new(SignalingHandler::new(transport)))
            .with_media_capability(Arc::new(FakeMediaCapability::new()))
            .with_connection_factory(Arc::new(FakeConnectionFactory::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_config_from_json() {
        let config = OrchestratorConfig::from_json(r#"{"call":{"max_group_participants":4}}"#).unwrap();
        assert_eq!(config.call.max_group_participants, 4);
        assert!(config.matching.video);
        assert_eq!(config.event_capacity, 256);

        assert!(matches!(
            OrchestratorConfig::from_json(r#"{"event_capacity":0}"#),
            Err(ServiceError::ConfigError(_))
        ));
        assert!(matches!(
            OrchestratorConfig::from_json("not json"),
            Err(ServiceError::ConfigError(_))
        ));
    }

    #[test]
    fn test_builder_requires_capability() {
        let transport = Arc::new(MockSignalingTransport::new());
        let result = CallOrchestrator::builder(ParticipantId::new("alice"), Arc::new(SignalingHandler::new(transport)))
            .with_connection_factory(Arc::new(FakeConnectionFactory::new()))
            .build();
        assert!(matches!(result, Err(ServiceError::InitError(_))));
    }

    #[tokio::test]
    async fn test_connect_identifies_and_routes() {
        let transport = Arc::new(MockSignalingTransport::new());
        let orchestrator = orchestrator(transport.clone());
        assert!(!orchestrator.is_connected());

        orchestrator.connect().await.unwrap();
        assert!(transport.is_connected());
        assert!(orchestrator.is_connected());
        assert_eq!(
            transport.sent(),
            vec![SignalingMessage::Identify {
                user_id: ParticipantId::new("alice")
            }]
        );

        orchestrator.disconnect().await.unwrap();
        assert!(!transport.is_connected());
        assert!(!orchestrator.is_connected());
    }

    #[tokio::test]
    async fn test_events_dropped_before_connect() {
        let transport = Arc::new(MockSignalingTransport::new());
        let orchestrator = orchestrator(transport);
        orchestrator
            .handle_message(SignalingMessage::MatchFound {
                role: MatchRole::Initiator,
                partner_id: ParticipantId::new("p1"),
                partner_name: "Stranger".to_string(),
            })
            .await;
        assert_eq!(orchestrator.snapshot().await.matching, MatchSnapshot::default());
    }

    #[tokio::test]
    async fn test_toggle_without_session() {
        let orchestrator = orchestrator(Arc::new(MockSignalingTransport::new()));
        assert_eq!(orchestrator.toggle_mute().await, None);
        assert!(matches!(
            orchestrator.switch_camera().await,
            Err(ServiceError::Session(SessionError::NoSession))
        ));
        let snapshot = orchestrator.snapshot().await;
        assert!(snapshot.active.is_none());
        assert!(snapshot.call.is_none());
    }
}
