//! Call signaling types and data structures

use crate::identity::{Participant, ParticipantId};
use crate::media::{LocalMedia, RemoteMedia};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-assigned identifier for a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    /// Wrap a server-assigned call id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally minted identity of one call or match attempt
///
/// Every asynchronous operation captures the token of the session it started
/// for and compares it again once it resumes; a mismatch means the session was
/// torn down or replaced in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(pub Uuid);

impl SessionToken {
    /// Create a new random token
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of an identity-addressed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    /// One-to-one voice call
    #[serde(rename = "AUDIO_1TO1")]
    Audio1to1,
    /// One-to-one video call
    #[serde(rename = "VIDEO_1TO1")]
    Video1to1,
    /// Group voice call
    #[serde(rename = "AUDIO_GROUP")]
    AudioGroup,
    /// Group video call
    #[serde(rename = "VIDEO_GROUP")]
    VideoGroup,
}

impl CallKind {
    /// Whether local video must be acquired for this call
    pub fn has_video(&self) -> bool {
        matches!(self, Self::Video1to1 | Self::VideoGroup)
    }

    /// Whether this is a group call
    pub fn is_group(&self) -> bool {
        matches!(self, Self::AudioGroup | Self::VideoGroup)
    }
}

/// Status of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    /// Outgoing, nobody accepted yet
    Calling,
    /// Incoming, awaiting the local decision
    Ringing,
    /// At least one participant accepted
    Active,
    /// Terminal
    Ended,
}

impl CallStatus {
    /// Whether the session still holds resources
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Ended)
    }
}

/// Status of the anonymous pairing flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    /// Not in the pool
    #[default]
    Idle,
    /// In the pool, waiting for a partner
    Searching,
    /// Paired with a partner
    Connected,
}

/// Server-assigned role in a matched pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchRole {
    /// Produces the offer
    Initiator,
    /// Answers the offer
    Responder,
}

/// State of the underlying media connection to one remote participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Allocated, nothing negotiated
    #[default]
    New,
    /// Negotiating
    Connecting,
    /// Media path established
    Connected,
    /// Media path lost, may recover
    Disconnected,
    /// Media path failed
    Failed,
    /// Closed locally
    Closed,
}

impl ConnectionState {
    /// States after which the peer session tears itself down
    pub fn requires_teardown(&self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected)
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Negotiated session parameters exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network-path candidate for the direct media connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// SDP media ID
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate with no media line information
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone or other audio source
    Audio,
    /// Camera or screen
    Video,
}

/// Which camera a video track comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    /// Front camera
    #[default]
    User,
    /// Back camera
    Environment,
}

impl CameraFacing {
    /// The other camera
    pub fn flipped(self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }
}

/// Which state machine a peer session belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionOrigin {
    /// Identity-addressed call
    Call,
    /// Anonymous pool match
    Match,
}

/// Why a session was torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownReason {
    /// Local user ended or left
    LocalEnd,
    /// Local user rejected an incoming call
    LocalReject,
    /// A remote participant ended the call or the partner left
    RemoteEnded,
    /// A remote participant rejected the call
    RemoteRejected,
    /// The last media connection failed
    ConnectionFailed,
    /// The signaling transport went away
    TransportDisconnected,
}

/// Notification for the view layer
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Incoming call is ringing
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Kind of call
        kind: CallKind,
        /// Who is calling
        caller: Participant,
    },
    /// Call status changed
    CallStatusChanged {
        /// Call identifier
        call_id: CallId,
        /// New status
        status: CallStatus,
    },
    /// Call was torn down
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why
        reason: TeardownReason,
    },
    /// Participant added to the roster
    ParticipantJoined {
        /// Call identifier
        call_id: CallId,
        /// The participant
        participant: Participant,
    },
    /// Participant removed from the roster
    ParticipantLeft {
        /// Call identifier
        call_id: CallId,
        /// The participant
        participant_id: ParticipantId,
    },
    /// Remote mute/video flags changed
    ParticipantMediaChanged {
        /// Call identifier
        call_id: CallId,
        /// Updated participant
        participant: Participant,
    },
    /// A remote participant's media is ready to render
    RemoteMediaAvailable {
        /// Which machine
        origin: SessionOrigin,
        /// The media
        media: RemoteMedia,
    },
    /// A remote participant's media is gone
    RemoteMediaRemoved {
        /// Which machine
        origin: SessionOrigin,
        /// Whose media
        participant_id: ParticipantId,
    },
    /// Local media acquired, replaced or released
    LocalMediaChanged {
        /// Which machine
        origin: SessionOrigin,
        /// Current local media, `None` once released
        media: Option<LocalMedia>,
    },
    /// Match flow status changed
    MatchStatusChanged {
        /// New status
        status: MatchStatus,
    },
    /// Partner found
    MatchFound {
        /// Assigned role
        role: MatchRole,
        /// Partner display name
        partner_name: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_session_token() {
        let t1 = SessionToken::new();
        let t2 = SessionToken::new();
        assert_ne!(t1, t2);
    }

    #[test]
    fn test_call_kind() {
        assert!(CallKind::VideoGroup.has_video());
        assert!(CallKind::VideoGroup.is_group());
        assert!(!CallKind::Audio1to1.has_video());
        assert!(!CallKind::Video1to1.is_group());

        let json = serde_json::to_string(&CallKind::Video1to1).unwrap();
        assert_eq!(json, "\"VIDEO_1TO1\"");
        let parsed: CallKind = serde_json::from_str("\"AUDIO_GROUP\"").unwrap();
        assert_eq!(parsed, CallKind::AudioGroup);
    }

    #[test]
    fn test_connection_state_teardown() {
        assert!(ConnectionState::Failed.requires_teardown());
        assert!(ConnectionState::Disconnected.requires_teardown());
        assert!(!ConnectionState::Connecting.requires_teardown());
        assert!(!ConnectionState::Closed.requires_teardown());
    }

    #[test]
    fn test_ice_candidate_wire_format() {
        let json = r#"{"candidate":"candidate:1 1 UDP 2122260223 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let c: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_mline_index, Some(0));
    }

    #[test]
    fn test_camera_facing() {
        assert_eq!(CameraFacing::User.flipped(), CameraFacing::Environment);
        assert_eq!(CameraFacing::default().flipped().flipped(), CameraFacing::User);
    }
}
