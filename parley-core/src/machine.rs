//! Session machines
//!
//! Identity-addressed calls and pool matches share everything below the
//! membership rules: a [`PeerRegistry`], the local media slot, camera and
//! screen-share handling, and the translation of connection events into view
//! events. That shared part is [`SessionCore`]; the two membership policies
//! implement [`SessionMachine`] on top of it.

use crate::connection::{ConnectionEvent, PeerEvent};
use crate::identity::ParticipantId;
use crate::media::{LocalMedia, LocalTrack, MediaCapability, MediaError, RemoteMedia};
use crate::peer::{PeerError, PeerRegistry, SignalRoute};
use crate::signaling::{SignalingError, SignalingMessage};
use crate::types::{
    CameraFacing, ConnectionState, SessionEvent, SessionOrigin, SessionToken, TeardownReason, TrackKind,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

/// Session machine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation not allowed in the current state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// State at the time
        state: String,
    },

    /// Another call or match holds the session slot or local media
    #[error("Another call or match is in progress")]
    Busy,

    /// Nothing to act on
    #[error("No live session")]
    NoSession,

    /// The session was torn down or replaced while the operation was pending
    #[error("Session superseded before the operation completed")]
    Cancelled,

    /// Call initiated without recipients
    #[error("No recipients given")]
    NoRecipients,

    /// Group larger than configured
    #[error("Group of {requested} exceeds limit of {limit} participants")]
    GroupTooLarge {
        /// Requested size including the local participant
        requested: usize,
        /// Configured limit
        limit: usize,
    },

    /// Server refused the request
    #[error("Rejected by server: {0}")]
    Rejected(String),

    /// Session has no outgoing video
    #[error("No outgoing video track")]
    NoVideoSender,

    /// Media acquisition failed
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Signaling failed
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Peer session failed
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
}

/// Local and remote media of one session as the view layer sees it
#[derive(Debug, Clone, Default)]
pub struct MediaSnapshot {
    /// Local tracks, if acquired
    pub local: Option<LocalMedia>,
    /// Media received per remote participant
    pub remote: Vec<RemoteMedia>,
    /// Local microphone disabled
    pub is_muted: bool,
    /// Local camera disabled or absent
    pub is_video_off: bool,
    /// Screen is being sent instead of the camera
    pub is_screen_sharing: bool,
    /// Camera in use
    pub camera_facing: CameraFacing,
}

/// Behavior shared by the call and match state machines
#[async_trait]
pub trait SessionMachine: Send + Sync {
    /// Which flow this machine drives
    fn origin(&self) -> SessionOrigin;

    /// Apply an inbound signaling message
    async fn handle_signal(&self, message: SignalingMessage);

    /// Apply an event reported by one of this machine's connections
    async fn handle_peer_event(&self, event: PeerEvent);

    /// Whether a non-terminal session exists
    async fn is_live(&self) -> bool;

    /// Flip the local microphone; returns the new muted flag, or `None` when
    /// there is no audio track
    async fn toggle_mute(&self) -> Option<bool>;

    /// Flip the local camera; returns the new video-off flag, or `None` when
    /// there is no video track
    async fn toggle_video(&self) -> Option<bool>;

    /// Switch between front and back camera
    async fn switch_camera(&self) -> Result<CameraFacing, SessionError>;

    /// Send the screen instead of the camera
    async fn start_screen_share(&self) -> Result<(), SessionError>;

    /// Go back to the camera
    async fn stop_screen_share(&self) -> Result<(), SessionError>;

    /// Current local/remote media
    async fn media_snapshot(&self) -> MediaSnapshot;

    /// Tear down whatever is live without notifying signaling
    async fn shutdown(&self, reason: TeardownReason);
}

/// Peers, local media and view notifications of one machine
pub(crate) struct SessionCore {
    origin: SessionOrigin,
    pub(crate) peers: PeerRegistry,
    media: Option<LocalMedia>,
    parked_camera: Option<Arc<dyn LocalTrack>>,
    facing: CameraFacing,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionCore {
    pub(crate) fn new(origin: SessionOrigin, peers: PeerRegistry, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            origin,
            peers,
            media: None,
            parked_camera: None,
            facing: CameraFacing::default(),
            events,
        }
    }

    /// Notify the view layer; having no subscribers is fine
    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn media(&self) -> Option<&LocalMedia> {
        self.media.as_ref()
    }

    pub(crate) fn is_screen_sharing(&self) -> bool {
        self.parked_camera.is_some()
    }

    /// Take ownership of freshly acquired media
    pub(crate) fn attach_media(&mut self, media: LocalMedia) {
        if let Some(previous) = self.media.replace(media.clone()) {
            previous.stop();
        }
        self.emit(SessionEvent::LocalMediaChanged {
            origin: self.origin,
            media: Some(media),
        });
    }

    /// Stop every local track, including a parked camera
    pub(crate) fn release_media(&mut self) {
        if let Some(camera) = self.parked_camera.take() {
            camera.stop();
        }
        self.facing = CameraFacing::default();
        if let Some(media) = self.media.take() {
            media.stop();
            self.emit(SessionEvent::LocalMediaChanged {
                origin: self.origin,
                media: None,
            });
        }
    }

    /// Create a peer toward `remote_id` carrying the current local media
    pub(crate) async fn open_peer(
        &mut self,
        remote_id: &ParticipantId,
        is_initiator: bool,
        token: SessionToken,
        route: SignalRoute,
    ) -> Result<bool, PeerError> {
        self.peers
            .ensure(remote_id, is_initiator, token, route, self.media.as_ref())
            .await
    }

    /// Close one peer; returns `true` if it existed
    pub(crate) async fn close_peer(&mut self, remote_id: &ParticipantId) -> bool {
        let closed = self.peers.close(remote_id).await;
        if closed {
            self.emit(SessionEvent::RemoteMediaRemoved {
                origin: self.origin,
                participant_id: remote_id.clone(),
            });
        }
        closed
    }

    /// Close every peer and release local media
    pub(crate) async fn teardown(&mut self) {
        for remote_id in self.peers.close_all().await {
            self.emit(SessionEvent::RemoteMediaRemoved {
                origin: self.origin,
                participant_id: remote_id,
            });
        }
        self.release_media();
    }

    /// Flip tracks of `kind`; returns the new enabled flag
    pub(crate) fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let enabled = self.media.as_ref()?.toggle(kind)?;
        tracing::debug!(origin = ?self.origin, ?kind, enabled, "Local track toggled");
        Some(enabled)
    }

    /// Apply a connection event
    ///
    /// Returns the new connection state when the event was a state change.
    /// A failed or disconnected peer closes itself.
    pub(crate) async fn apply_connection_event(
        &mut self,
        remote_id: &ParticipantId,
        event: ConnectionEvent,
    ) -> Option<ConnectionState> {
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                self.peers.forward_local_candidate(remote_id, candidate).await;
                None
            }
            ConnectionEvent::RemoteTrack(track) => {
                if let Some(media) = self.peers.attach_remote_track(remote_id, track) {
                    self.emit(SessionEvent::RemoteMediaAvailable {
                        origin: self.origin,
                        media,
                    });
                }
                None
            }
            ConnectionEvent::StateChanged(state) => {
                if !self.peers.set_state(remote_id, state) {
                    return None;
                }
                if state.requires_teardown() {
                    tracing::warn!(remote = %remote_id, ?state, "Peer connection lost");
                    self.close_peer(remote_id).await;
                }
                Some(state)
            }
        }
    }

    /// Swap in a new camera track
    ///
    /// While the screen is shared the camera is only parked for restore.
    async fn apply_camera_track(
        &mut self,
        track: Arc<dyn LocalTrack>,
        facing: CameraFacing,
    ) -> Result<CameraFacing, SessionError> {
        if self.is_screen_sharing() {
            if let Some(old) = self.parked_camera.replace(track) {
                old.stop();
            }
        } else {
            self.peers.replace_video_track(&track).await?;
            let media = self.media.as_mut().ok_or(SessionError::NoVideoSender)?;
            if let Some(old) = media.replace_video_track(track) {
                old.stop();
            }
            let media = media.clone();
            self.emit(SessionEvent::LocalMediaChanged {
                origin: self.origin,
                media: Some(media),
            });
        }
        self.facing = facing;
        Ok(facing)
    }

    async fn apply_screen_track(&mut self, track: Arc<dyn LocalTrack>) -> Result<(), SessionError> {
        self.peers.replace_video_track(&track).await?;
        let media = self.media.as_mut().ok_or(SessionError::NoVideoSender)?;
        let camera = media.replace_video_track(track);
        let media = media.clone();
        self.parked_camera = camera;
        self.emit(SessionEvent::LocalMediaChanged {
            origin: self.origin,
            media: Some(media),
        });
        Ok(())
    }

    async fn restore_camera(&mut self) -> Result<(), SessionError> {
        let camera = self.parked_camera.take().ok_or(SessionError::InvalidState {
            operation: "stop screen share",
            state: "not sharing".to_string(),
        })?;
        if let Err(e) = self.peers.replace_video_track(&camera).await {
            tracing::warn!("Restoring camera on peers failed: {}", e);
        }
        if let Some(media) = self.media.as_mut() {
            if let Some(screen) = media.replace_video_track(camera) {
                screen.stop();
            }
            let media = media.clone();
            self.emit(SessionEvent::LocalMediaChanged {
                origin: self.origin,
                media: Some(media),
            });
        }
        Ok(())
    }

    fn has_video_track(&self) -> bool {
        self.media
            .as_ref()
            .and_then(LocalMedia::video_track)
            .is_some()
    }

    pub(crate) fn snapshot(&self) -> MediaSnapshot {
        MediaSnapshot {
            local: self.media.clone(),
            remote: self.peers.remote_media(),
            is_muted: self
                .media
                .as_ref()
                .is_some_and(|m| m.is_disabled(TrackKind::Audio)),
            is_video_off: !self
                .media
                .as_ref()
                .and_then(LocalMedia::video_track)
                .is_some_and(|t| t.is_enabled()),
            is_screen_sharing: self.is_screen_sharing(),
            camera_facing: self.facing,
        }
    }
}

/// Machine state that owns a [`SessionCore`]
pub(crate) trait CoreState: Send {
    fn core(&mut self) -> &mut SessionCore;

    /// Token of the live session, `None` when nothing is live
    fn live_token(&self) -> Option<SessionToken>;

    /// Whether `event` belongs to the live session and a known peer
    fn accepts(&mut self, event: &PeerEvent) -> bool {
        if self.live_token() != Some(event.token) {
            tracing::trace!(remote = %event.participant_id, "Dropping event from superseded session");
            return false;
        }
        self.core().peers.contains(&event.participant_id)
    }
}

/// Acquire the other camera and swap it in on every peer
pub(crate) async fn switch_camera<S: CoreState>(
    state: &Mutex<S>,
    capability: &dyn MediaCapability,
) -> Result<CameraFacing, SessionError> {
    let (token, facing) = {
        let mut guard = state.lock().await;
        let token = guard.live_token().ok_or(SessionError::NoSession)?;
        let core = guard.core();
        if !core.has_video_track() && !core.is_screen_sharing() {
            return Err(SessionError::NoVideoSender);
        }
        (token, core.facing.flipped())
    };

    let track = capability.acquire_camera(facing).await?;

    let mut guard = state.lock().await;
    if guard.live_token() != Some(token) {
        track.stop();
        return Err(SessionError::Cancelled);
    }
    let result = guard.core().apply_camera_track(track.clone(), facing).await;
    match &result {
        Ok(_) => tracing::info!(?facing, "Camera switched"),
        Err(_) => track.stop(),
    }
    result
}

/// Acquire a screen capture and send it instead of the camera
pub(crate) async fn start_screen_share<S: CoreState>(
    state: &Mutex<S>,
    capability: &dyn MediaCapability,
) -> Result<(), SessionError> {
    let token = {
        let mut guard = state.lock().await;
        let token = guard.live_token().ok_or(SessionError::NoSession)?;
        let core = guard.core();
        if core.is_screen_sharing() {
            return Err(SessionError::InvalidState {
                operation: "start screen share",
                state: "already sharing".to_string(),
            });
        }
        if !core.has_video_track() {
            return Err(SessionError::NoVideoSender);
        }
        token
    };

    let track = capability.acquire_screen().await?;

    let mut guard = state.lock().await;
    if guard.live_token() != Some(token) {
        track.stop();
        return Err(SessionError::Cancelled);
    }
    if let Err(e) = guard.core().apply_screen_track(track.clone()).await {
        track.stop();
        return Err(e);
    }
    tracing::info!("Screen share started");
    Ok(())
}

/// Put the parked camera back on every peer
pub(crate) async fn stop_screen_share<S: CoreState>(state: &Mutex<S>) -> Result<(), SessionError> {
    let mut guard = state.lock().await;
    if guard.live_token().is_none() {
        return Err(SessionError::NoSession);
    }
    guard.core().restore_camera().await?;
    tracing::info!("Screen share stopped");
    Ok(())
}
