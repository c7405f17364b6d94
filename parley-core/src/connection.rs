//! Media connection abstraction layer
//!
//! Separates the session layer from whatever actually moves media (the
//! `webrtc` crate, a browser binding, a test double). A [`PeerSession`]
//! owns exactly one [`MediaConnection`]; connections report asynchronous
//! happenings (discovered candidates, remote tracks, state changes) through
//! a [`ConnectionEventSink`] so they are applied in order by the owning
//! state machine instead of from inside backend callbacks.
//!
//! [`PeerSession`]: crate::peer::PeerSession

use crate::identity::ParticipantId;
use crate::media::{LocalTrack, RemoteTrack};
use crate::types::{ConnectionState, IceCandidate, SessionDescription, SessionOrigin, SessionToken};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Media connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Connection could not be allocated
    #[error("Connection setup failed: {0}")]
    Setup(String),

    /// Description could not be produced or applied
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Candidate could not be applied
    #[error("Invalid candidate: {0}")]
    Candidate(String),

    /// Track type not understood by this backend
    #[error("Unsupported track: {0}")]
    UnsupportedTrack(String),

    /// No outgoing video to replace
    #[error("No video sender on this connection")]
    NoVideoSender,

    /// Connection already closed
    #[error("Connection closed")]
    Closed,
}

/// Something a media connection observed on its own
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A local network-path candidate was discovered
    LocalCandidate(IceCandidate),
    /// A remote track arrived
    RemoteTrack(RemoteTrack),
    /// Connection state changed
    StateChanged(ConnectionState),
}

/// A [`ConnectionEvent`] tagged with the session it belongs to
#[derive(Debug, Clone)]
pub struct PeerEvent {
    /// Owning machine
    pub origin: SessionOrigin,
    /// Session the connection was created for
    pub token: SessionToken,
    /// Remote participant of the connection
    pub participant_id: ParticipantId,
    /// What happened
    pub event: ConnectionEvent,
}

/// Handle a connection uses to report events
///
/// Cheap to clone; backends move clones into their callbacks.
#[derive(Debug, Clone)]
pub struct ConnectionEventSink {
    tx: mpsc::UnboundedSender<PeerEvent>,
    origin: SessionOrigin,
    token: SessionToken,
    participant_id: ParticipantId,
}

impl ConnectionEventSink {
    /// Create a sink that tags every event with the given session
    pub fn new(
        tx: mpsc::UnboundedSender<PeerEvent>,
        origin: SessionOrigin,
        token: SessionToken,
        participant_id: ParticipantId,
    ) -> Self {
        Self {
            tx,
            origin,
            token,
            participant_id,
        }
    }

    /// Remote participant this sink reports for
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Report an event
    ///
    /// Returns `false` if nobody is listening any more.
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        let delivered = self
            .tx
            .send(PeerEvent {
                origin: self.origin,
                token: self.token,
                participant_id: self.participant_id.clone(),
                event,
            })
            .is_ok();
        if !delivered {
            tracing::trace!(participant = %self.participant_id, "Dropping connection event, receiver gone");
        }
        delivered
    }
}

/// STUN/TURN server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Media connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// ICE servers used for candidate gathering
    pub ice_servers: Vec<IceServer>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                username: None,
                credential: None,
            }],
        }
    }
}

/// One media connection to one remote participant
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Attach an outgoing track
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot send this track
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), ConnectionError>;

    /// Produce an offer
    ///
    /// # Errors
    ///
    /// Returns error if negotiation fails
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    /// Produce an answer to the committed remote offer
    ///
    /// # Errors
    ///
    /// Returns error if negotiation fails
    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    /// Commit a local description
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), ConnectionError>;

    /// Commit a remote description
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), ConnectionError>;

    /// Apply a remote candidate
    ///
    /// # Errors
    ///
    /// Returns error if the candidate is rejected
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    /// Swap the outgoing video track without renegotiation
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NoVideoSender`] if no video is being sent
    async fn replace_video_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), ConnectionError>;

    /// Release the connection
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails to close cleanly
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Allocates media connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Allocate a connection that reports through `sink`
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be allocated
    async fn create(&self, sink: ConnectionEventSink) -> Result<Arc<dyn MediaConnection>, ConnectionError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = SessionToken::new();
        let sink = ConnectionEventSink::new(tx, SessionOrigin::Match, token, ParticipantId::new("p1"));

        assert!(sink.emit(ConnectionEvent::StateChanged(ConnectionState::Connecting)));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.origin, SessionOrigin::Match);
        assert_eq!(event.token, token);
        assert_eq!(event.participant_id, ParticipantId::new("p1"));
        assert!(matches!(
            event.event,
            ConnectionEvent::StateChanged(ConnectionState::Connecting)
        ));
    }

    #[test]
    fn test_sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = ConnectionEventSink::new(tx, SessionOrigin::Call, SessionToken::new(), ParticipantId::new("p1"));
        drop(rx);
        assert!(!sink.emit(ConnectionEvent::StateChanged(ConnectionState::Closed)));
    }

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.ice_servers[0].urls[0].starts_with("stun:"));

        let parsed: ConnectionConfig = serde_json::from_str(
            r#"{"ice_servers":[{"urls":["turn:turn.example.org:3478"],"username":"u","credential":"c"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.ice_servers[0].username.as_deref(), Some("u"));

        let empty: ConnectionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, ConnectionConfig::default());
    }
}
