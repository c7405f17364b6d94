//! Participant identity
//!
//! Call sessions address participants by stable account ids. Match sessions
//! only ever know the partner by a transient id handed out by the pool and a
//! display name.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Identifier of a participant on the signaling server
///
/// For call sessions this is the account id; for match sessions it is the
/// ephemeral id the pool assigned to the partner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    /// Create a new participant id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A participant of a call session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Participant identifier
    #[serde(rename = "userId")]
    pub id: ParticipantId,
    /// Name shown in the call UI
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    /// Avatar reference (URL or asset key)
    #[serde(rename = "avatarRef", default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Whether the participant's microphone is muted
    #[serde(rename = "isMuted", default)]
    pub is_muted: bool,
    /// Whether the participant's camera is off
    #[serde(rename = "isVideoOff", default)]
    pub is_video_off: bool,
}

impl Participant {
    /// Create a participant with default presence flags
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar: None,
            is_muted: false,
            is_video_off: false,
        }
    }

    /// Set the avatar reference
    #[must_use]
    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}
