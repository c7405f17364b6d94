//! Media connections backed by the `webrtc` crate
//!
//! - [`WebRtcConnectionFactory`] - allocates [`RTCPeerConnection`]s sharing one API instance
//! - [`WebRtcConnection`] - [`MediaConnection`] over a single peer connection
//! - [`WebRtcLocalTrack`] - sample-fed outgoing track
//! - [`SampleMediaCapability`] - hands out sample-fed tracks; the embedder
//!   writes encoded frames into them

use crate::connection::{ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionEventSink, ConnectionFactory, MediaConnection};
use crate::media::{LocalMedia, LocalTrack, MediaCapability, MediaError, RemoteTrack};
use crate::types::{CameraFacing, ConnectionState, IceCandidate, SdpType, SessionDescription, TrackKind};
use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/VP8".to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Outgoing track the embedder feeds encoded samples into
#[derive(Debug)]
pub struct WebRtcLocalTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl WebRtcLocalTrack {
    /// Opus audio track
    pub fn audio(id: impl Into<String>) -> Self {
        Self::with_codec(id.into(), TrackKind::Audio, opus_capability())
    }

    /// VP8 video track
    pub fn video(id: impl Into<String>) -> Self {
        Self::with_codec(id.into(), TrackKind::Video, vp8_capability())
    }

    fn with_codec(id: String, kind: TrackKind, codec: RTCRtpCodecCapability) -> Self {
        let stream = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        let track = Arc::new(TrackLocalStaticSample::new(codec, id.clone(), stream.to_string()));
        tracing::debug!(track_id = %id, ?kind, "Sample track created");
        Self {
            id,
            kind,
            track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// Underlying `webrtc` track
    pub fn webrtc_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.track
    }

    /// Whether [`stop`](LocalTrack::stop) was called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Write one encoded sample
    ///
    /// Samples written while the track is disabled or stopped are dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the track rejects the sample
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), MediaError> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(());
        }
        self.track
            .write_sample(sample)
            .await
            .map_err(|e| MediaError::StreamError(e.to_string()))
    }
}

impl LocalTrack for WebRtcLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.enabled.store(false, Ordering::Release);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn webrtc_track_of(track: &Arc<dyn LocalTrack>) -> Result<Arc<dyn TrackLocal + Send + Sync>, ConnectionError> {
    track
        .as_any()
        .downcast_ref::<WebRtcLocalTrack>()
        .map(|t| {
            let inner: Arc<dyn TrackLocal + Send + Sync> = t.webrtc_track().clone();
            inner
        })
        .ok_or_else(|| ConnectionError::UnsupportedTrack(track.id().to_string()))
}

/// Hands out sample-fed tracks
///
/// There is no device behind the tracks; the embedder encodes frames from
/// whatever source it owns and writes them with
/// [`WebRtcLocalTrack::write_sample`].
#[derive(Debug, Default)]
pub struct SampleMediaCapability {
    issued: AtomicU64,
}

impl SampleMediaCapability {
    /// Create a capability
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}-{n}")
    }
}

#[async_trait]
impl MediaCapability for SampleMediaCapability {
    async fn acquire(&self, wants_video: bool) -> Result<LocalMedia, MediaError> {
        let mut tracks: Vec<Arc<dyn LocalTrack>> = vec![Arc::new(WebRtcLocalTrack::audio(self.next_id("audio")))];
        if wants_video {
            tracks.push(Arc::new(WebRtcLocalTrack::video(self.next_id("video"))));
        }
        Ok(LocalMedia::new(tracks))
    }

    async fn acquire_camera(&self, facing: CameraFacing) -> Result<Arc<dyn LocalTrack>, MediaError> {
        let prefix = match facing {
            CameraFacing::User => "video",
            CameraFacing::Environment => "video-rear",
        };
        Ok(Arc::new(WebRtcLocalTrack::video(self.next_id(prefix))))
    }

    async fn acquire_screen(&self) -> Result<Arc<dyn LocalTrack>, MediaError> {
        Ok(Arc::new(WebRtcLocalTrack::video(self.next_id("screen"))))
    }
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        RTPCodecType::Unspecified => None,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, ConnectionError> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| ConnectionError::Negotiation(format!("Invalid SDP: {e}")))
}

/// Allocates `webrtc` peer connections
pub struct WebRtcConnectionFactory {
    api: API,
    config: ConnectionConfig,
}

impl WebRtcConnectionFactory {
    /// Create a factory with the default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns error if the media engine cannot be configured
    pub fn new(config: ConnectionConfig) -> Result<Self, ConnectionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| ConnectionError::Setup(format!("Failed to register codecs: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| ConnectionError::Setup(format!("Failed to register interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, config })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    #[tracing::instrument(skip(self, sink), fields(participant = %sink.participant_id()))]
    async fn create(&self, sink: ConnectionEventSink) -> Result<Arc<dyn MediaConnection>, ConnectionError> {
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(|e| {
                    tracing::error!("Failed to create peer connection: {}", e);
                    ConnectionError::Setup(format!("Failed to create peer connection: {e}"))
                })?,
        );
        WebRtcConnection::install_callbacks(&peer_connection, &sink);
        tracing::debug!("Created peer connection");
        Ok(Arc::new(WebRtcConnection { peer_connection }))
    }
}

/// [`MediaConnection`] over one [`RTCPeerConnection`]
pub struct WebRtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
}

impl WebRtcConnection {
    fn install_callbacks(peer_connection: &RTCPeerConnection, sink: &ConnectionEventSink) {
        let candidates = sink.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidates.clone();
            Box::pin(async move {
                // `None` marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(ConnectionEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let states = sink.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = states.clone();
            Box::pin(async move {
                if let Some(state) = connection_state(state) {
                    sink.emit(ConnectionEvent::StateChanged(state));
                }
            })
        }));

        let tracks = sink.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = tracks.clone();
                Box::pin(async move {
                    let Some(kind) = track_kind(track.kind()) else {
                        tracing::debug!("Ignoring remote track of unknown kind");
                        return;
                    };
                    sink.emit(ConnectionEvent::RemoteTrack(RemoteTrack {
                        id: track.id(),
                        kind,
                        stream_id: track.stream_id(),
                        handle: track,
                    }));
                })
            },
        ));
    }

    /// Underlying peer connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

#[async_trait]
impl MediaConnection for WebRtcConnection {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), ConnectionError> {
        let inner = webrtc_track_of(&track)?;
        self.peer_connection
            .add_track(inner)
            .await
            .map_err(|e| ConnectionError::Setup(format!("Failed to add track: {e}")))?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| ConnectionError::Negotiation(format!("Failed to create offer: {e}")))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| ConnectionError::Negotiation(format!("Failed to create answer: {e}")))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), ConnectionError> {
        self.peer_connection
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| ConnectionError::Negotiation(format!("Failed to set local description: {e}")))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), ConnectionError> {
        self.peer_connection
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| ConnectionError::Negotiation(format!("Failed to set remote description: {e}")))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| ConnectionError::Candidate(e.to_string()))
    }

    async fn replace_video_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), ConnectionError> {
        let inner = webrtc_track_of(&track)?;
        for sender in self.peer_connection.get_senders().await {
            let is_video = sender
                .track()
                .await
                .is_some_and(|current| current.kind() == RTPCodecType::Video);
            if is_video {
                return sender
                    .replace_track(Some(inner))
                    .await
                    .map_err(|e| ConnectionError::Setup(format!("Failed to replace track: {e}")));
            }
        }
        Err(ConnectionError::NoVideoSender)
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| ConnectionError::Setup(format!("Failed to close peer connection: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::ParticipantId;
    use crate::testing::FakeTrack;
    use crate::types::{SessionOrigin, SessionToken};
    use tokio::sync::mpsc;

    fn offline_factory() -> WebRtcConnectionFactory {
        WebRtcConnectionFactory::new(ConnectionConfig { ice_servers: vec![] }).unwrap()
    }

    fn sink() -> (ConnectionEventSink, mpsc::UnboundedReceiver<crate::connection::PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionEventSink::new(tx, SessionOrigin::Call, SessionToken::new(), ParticipantId::new("bob")),
            rx,
        )
    }

    #[test]
    fn test_local_track_toggle_and_stop() {
        let track = WebRtcLocalTrack::audio("audio-1");
        assert_eq!(track.kind(), TrackKind::Audio);
        assert!(track.is_enabled());

        track.set_enabled(false);
        assert!(!track.is_enabled());

        track.set_enabled(true);
        track.stop();
        assert!(track.is_stopped());
        assert!(!track.is_enabled());
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            connection_state(RTCPeerConnectionState::Failed),
            Some(ConnectionState::Failed)
        );
        assert_eq!(connection_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(track_kind(RTPCodecType::Video), Some(TrackKind::Video));
    }

    #[tokio::test]
    async fn test_sample_capability_issues_tracks() {
        let capability = SampleMediaCapability::new();
        let media = capability.acquire(true).await.unwrap();
        assert!(media.audio_track().is_some());
        assert!(media.video_track().is_some());

        let audio_only = capability.acquire(false).await.unwrap();
        assert!(audio_only.video_track().is_none());
    }

    #[tokio::test]
    async fn test_offer_carries_added_tracks() {
        let factory = offline_factory();
        let (sink, _rx) = sink();
        let connection = factory.create(sink).await.unwrap();

        let audio: Arc<dyn LocalTrack> = Arc::new(WebRtcLocalTrack::audio("audio-1"));
        connection.add_track(audio).await.unwrap();

        let offer = connection.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("opus"));

        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_track_rejected() {
        let factory = offline_factory();
        let (sink, _rx) = sink();
        let connection = factory.create(sink).await.unwrap();

        let foreign: Arc<dyn LocalTrack> = Arc::new(FakeTrack::new("mic", TrackKind::Audio));
        assert!(matches!(
            connection.add_track(foreign).await,
            Err(ConnectionError::UnsupportedTrack(_))
        ));
    }

    #[tokio::test]
    async fn test_replace_without_video_sender() {
        let factory = offline_factory();
        let (sink, _rx) = sink();
        let connection = factory.create(sink).await.unwrap();

        let camera: Arc<dyn LocalTrack> = Arc::new(WebRtcLocalTrack::video("video-1"));
        assert_eq!(
            connection.replace_video_track(camera).await,
            Err(ConnectionError::NoVideoSender)
        );
    }
}
