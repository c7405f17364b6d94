//! Local and remote media handles
//!
//! Camera and microphone acquisition belongs to the embedding application
//! (permission prompts, device pickers). This module only describes what the
//! session layer needs from it:
//!
//! - [`MediaCapability`] - the awaited "give me tracks" capability
//! - [`LocalTrack`] - an opaque outgoing track that can be enabled/disabled/stopped
//! - [`LocalMedia`] - the set of tracks held by one call or match
//! - [`RemoteMedia`] - tracks received from one remote participant, handed
//!   to the view layer as-is

use crate::identity::ParticipantId;
use crate::types::{CameraFacing, TrackKind};
use async_trait::async_trait;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User refused camera/microphone access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device held by another application
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Stream error
    #[error("Stream error: {0}")]
    StreamError(String),
}

/// Outgoing media track produced by a [`MediaCapability`]
///
/// Implementations use interior mutability: the enabled flag is flipped by
/// mute/video toggles while the track is shared with every peer connection.
pub trait LocalTrack: Send + Sync + Debug {
    /// Track identifier
    fn id(&self) -> &str;

    /// Audio or video
    fn kind(&self) -> TrackKind;

    /// Whether the track currently produces media
    fn is_enabled(&self) -> bool;

    /// Enable or disable the track without renegotiation
    fn set_enabled(&self, enabled: bool);

    /// Release the underlying device
    fn stop(&self);

    /// Access the concrete track, used by connection backends to recover
    /// their own track type
    fn as_any(&self) -> &dyn Any;
}

/// Camera/microphone capability
///
/// Every method may suspend indefinitely while the user answers a permission
/// prompt.
#[async_trait]
pub trait MediaCapability: Send + Sync {
    /// Acquire microphone and, when `wants_video`, camera tracks
    ///
    /// # Errors
    ///
    /// Returns error if permission is denied or a device is unavailable
    async fn acquire(&self, wants_video: bool) -> Result<LocalMedia, MediaError>;

    /// Acquire a single camera track facing the given direction
    ///
    /// # Errors
    ///
    /// Returns error if the camera is unavailable
    async fn acquire_camera(&self, facing: CameraFacing) -> Result<Arc<dyn LocalTrack>, MediaError>;

    /// Acquire a screen capture video track
    ///
    /// # Errors
    ///
    /// Returns error if the user cancels the picker or capture is unsupported
    async fn acquire_screen(&self) -> Result<Arc<dyn LocalTrack>, MediaError>;
}

/// Local tracks held by one call or match
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<Arc<dyn LocalTrack>>,
}

impl LocalMedia {
    /// Wrap acquired tracks
    pub fn new(tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        Self { tracks }
    }

    /// All tracks
    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    /// First track of the given kind
    pub fn track(&self, kind: TrackKind) -> Option<&Arc<dyn LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// First audio track
    pub fn audio_track(&self) -> Option<&Arc<dyn LocalTrack>> {
        self.track(TrackKind::Audio)
    }

    /// First video track
    pub fn video_track(&self) -> Option<&Arc<dyn LocalTrack>> {
        self.track(TrackKind::Video)
    }

    /// Flip the enabled flag of every track of `kind`
    ///
    /// Returns the new enabled state, or `None` when no such track exists.
    pub fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let current = self.track(kind)?.is_enabled();
        let next = !current;
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(next);
        }
        Some(next)
    }

    /// Whether tracks of `kind` exist and are all disabled
    pub fn is_disabled(&self, kind: TrackKind) -> bool {
        self.track(kind).is_some_and(|t| !t.is_enabled())
    }

    /// Swap the video track, returning the previous one
    ///
    /// The new track inherits the enabled flag of the old one.
    pub fn replace_video_track(&mut self, track: Arc<dyn LocalTrack>) -> Option<Arc<dyn LocalTrack>> {
        match self.tracks.iter().position(|t| t.kind() == TrackKind::Video) {
            Some(index) => {
                track.set_enabled(self.tracks[index].is_enabled());
                Some(std::mem::replace(&mut self.tracks[index], track))
            }
            None => {
                self.tracks.push(track);
                None
            }
        }
    }

    /// Stop every track
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
        tracing::debug!(tracks = self.tracks.len(), "Local media released");
    }
}

/// A track received from a remote participant
#[derive(Clone)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
    /// Stream the track belongs to
    pub stream_id: String,
    /// Backend-specific handle the view layer renders from
    pub handle: Arc<dyn Any + Send + Sync>,
}

impl Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

/// Media received from one remote participant
#[derive(Debug, Clone)]
pub struct RemoteMedia {
    /// Whose media this is
    pub participant_id: ParticipantId,
    /// Received tracks
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteMedia {
    /// Empty media for a participant
    pub fn new(participant_id: ParticipantId) -> Self {
        Self {
            participant_id,
            tracks: Vec::new(),
        }
    }

    /// Add a track, replacing one with the same id
    pub fn add_track(&mut self, track: RemoteTrack) {
        self.tracks.retain(|t| t.id != track.id);
        self.tracks.push(track);
    }

    /// Whether a video track was received
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }
}
