//! In-process doubles for driving the orchestrator without a server,
//! devices or a network
//!
//! - [`MockSignalingTransport`] records outbound messages, answers requests
//!   with a scripted acknowledgment and replays queued inbound messages
//! - [`FakeMediaCapability`] hands out [`FakeTrack`]s and can hold an
//!   acquisition open to model a pending permission prompt
//! - [`FakeConnectionFactory`] allocates [`FakeConnection`]s that record every
//!   negotiation step and let tests inject connection events

use crate::connection::{ConnectionError, ConnectionEvent, ConnectionEventSink, ConnectionFactory, MediaConnection};
use crate::identity::{Participant, ParticipantId};
use crate::media::{LocalMedia, LocalTrack, MediaCapability, MediaError};
use crate::signaling::{SignalingAck, SignalingMessage, SignalingTransport};
use crate::types::{CallId, CameraFacing, IceCandidate, SessionDescription, SessionEvent, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber writing to the test harness
///
/// Honors `RUST_LOG`, defaulting to `parley_core=debug`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = try_init_tracing();
}

/// Install a `tracing` subscriber, failing if one is already installed
///
/// # Errors
///
/// Returns error if a global subscriber was already set
pub fn try_init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley_core=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

/// Collect every view event currently queued on `rx`
pub fn drain_events(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

/// Failure injected into [`MockSignalingTransport`]
#[derive(Error, Debug)]
#[error("mock transport failure: {0}")]
pub struct MockTransportError(String);

/// Recording signaling transport
pub struct MockSignalingTransport {
    sent: Mutex<Vec<SignalingMessage>>,
    ack: Mutex<Option<SignalingAck>>,
    request_gate: Mutex<Option<oneshot::Receiver<()>>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<SignalingMessage>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalingMessage>>,
    fail_sends: AtomicBool,
    connected: AtomicBool,
    calls_created: AtomicUsize,
}

impl MockSignalingTransport {
    /// Create a transport with an empty inbound queue
    ///
    /// Without a scripted acknowledgment, `call:initiate` is answered with
    /// `call-<n>` and a roster built from the recipient ids.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sent: Mutex::new(Vec::new()),
            ack: Mutex::new(None),
            request_gate: Mutex::new(None),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            fail_sends: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            calls_created: AtomicUsize::new(0),
        }
    }

    /// Everything sent or requested so far
    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    /// Wire names of everything sent so far
    pub fn sent_names(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(SignalingMessage::name).collect()
    }

    /// Forget recorded messages
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Queue an inbound message
    pub fn push_inbound(&self, message: SignalingMessage) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(message);
        }
    }

    /// Close the inbound side; `receive` yields `None` once drained
    pub fn close_inbound(&self) {
        self.inbound_tx.lock().take();
    }

    /// Answer every following request with `ack`
    pub fn set_ack(&self, ack: SignalingAck) {
        *self.ack.lock() = Some(ack);
    }

    /// Hold the next request until the returned sender fires or is dropped
    pub fn hold_next_request(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.request_gate.lock() = Some(rx);
        tx
    }

    /// Make sends and requests fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Whether `connect` was called more recently than `disconnect`
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn scripted_ack(&self, message: &SignalingMessage) -> SignalingAck {
        if let Some(ack) = self.ack.lock().clone() {
            return ack;
        }
        let n = self.calls_created.fetch_add(1, Ordering::SeqCst) + 1;
        let participants = match message {
            SignalingMessage::CallInitiate { recipients, .. } => recipients
                .iter()
                .map(|id| Participant::new(id.clone(), id.as_str()))
                .collect(),
            _ => Vec::new(),
        };
        SignalingAck::Ok {
            call_id: CallId::new(format!("call-{n}")),
            participants,
        }
    }
}

impl Default for MockSignalingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingTransport for MockSignalingTransport {
    type Error = MockTransportError;

    async fn connect(&self) -> Result<(), Self::Error> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), Self::Error> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(MockTransportError(format!("send of {} refused", message.name())));
        }
        self.sent.lock().push(message);
        Ok(())
    }

    async fn request(&self, message: SignalingMessage) -> Result<SignalingAck, Self::Error> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(MockTransportError(format!("request {} refused", message.name())));
        }
        self.sent.lock().push(message.clone());
        let gate = self.request_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(self.scripted_ack(&message))
    }

    async fn receive(&self) -> Result<Option<SignalingMessage>, Self::Error> {
        Ok(self.inbound_rx.lock().await.recv().await)
    }
}

/// Local track that only remembers its flags
#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeTrack {
    /// Create an enabled, running track
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// Whether `stop` was called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Media capability handing out [`FakeTrack`]s
pub struct FakeMediaCapability {
    failure: Mutex<Option<MediaError>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    acquisitions: AtomicUsize,
    issued: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeMediaCapability {
    /// Create a capability that grants everything immediately
    pub fn new() -> Self {
        Self {
            failure: Mutex::new(None),
            gate: Mutex::new(None),
            acquisitions: AtomicUsize::new(0),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Fail every following acquisition with `error`
    pub fn fail_with(&self, error: MediaError) {
        *self.failure.lock() = Some(error);
    }

    /// Grant acquisitions again
    pub fn succeed(&self) {
        self.failure.lock().take();
    }

    /// Hold the next acquisition open, like an unanswered permission prompt,
    /// until the returned sender fires or is dropped
    pub fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock() = Some(rx);
        tx
    }

    /// Number of completed acquisitions (successful or not)
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Every track handed out so far
    pub fn issued_tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.issued.lock().clone()
    }

    /// Whether every track handed out so far was stopped
    pub fn all_released(&self) -> bool {
        self.issued.lock().iter().all(|t| t.is_stopped())
    }

    async fn wait_and_check(&self) -> Result<(), MediaError> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        match self.failure.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn issue(&self, prefix: &str, kind: TrackKind) -> Arc<FakeTrack> {
        let mut issued = self.issued.lock();
        let track = Arc::new(FakeTrack::new(format!("{prefix}-{}", issued.len() + 1), kind));
        issued.push(track.clone());
        track
    }
}

impl Default for FakeMediaCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaCapability for FakeMediaCapability {
    async fn acquire(&self, wants_video: bool) -> Result<LocalMedia, MediaError> {
        self.wait_and_check().await?;
        let mut tracks: Vec<Arc<dyn LocalTrack>> = vec![self.issue("mic", TrackKind::Audio)];
        if wants_video {
            tracks.push(self.issue("camera", TrackKind::Video));
        }
        Ok(LocalMedia::new(tracks))
    }

    async fn acquire_camera(&self, facing: CameraFacing) -> Result<Arc<dyn LocalTrack>, MediaError> {
        self.wait_and_check().await?;
        let prefix = match facing {
            CameraFacing::User => "camera",
            CameraFacing::Environment => "rear-camera",
        };
        Ok(self.issue(prefix, TrackKind::Video))
    }

    async fn acquire_screen(&self) -> Result<Arc<dyn LocalTrack>, MediaError> {
        self.wait_and_check().await?;
        Ok(self.issue("screen", TrackKind::Video))
    }
}

/// Connection that records what the session layer asked of it
pub struct FakeConnection {
    sink: ConnectionEventSink,
    fail_negotiation: bool,
    tracks: Mutex<Vec<Arc<dyn LocalTrack>>>,
    local_descriptions: Mutex<Vec<SessionDescription>>,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    replaced_video: Mutex<Vec<String>>,
    offers: AtomicUsize,
    closed: AtomicBool,
}

impl FakeConnection {
    fn new(sink: ConnectionEventSink, fail_negotiation: bool) -> Self {
        Self {
            sink,
            fail_negotiation,
            tracks: Mutex::new(Vec::new()),
            local_descriptions: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            replaced_video: Mutex::new(Vec::new()),
            offers: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Remote participant of this connection
    pub fn participant_id(&self) -> &ParticipantId {
        self.sink.participant_id()
    }

    /// Inject a connection event as if the backend observed it
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        self.sink.emit(event)
    }

    /// Ids of attached outgoing tracks
    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.lock().iter().map(|t| t.id().to_string()).collect()
    }

    /// Committed local descriptions
    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.local_descriptions.lock().clone()
    }

    /// Committed remote descriptions
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote_descriptions.lock().clone()
    }

    /// Applied remote candidates, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    /// Ids of tracks swapped in through `replace_video_track`
    pub fn replaced_video_ids(&self) -> Vec<String> {
        self.replaced_video.lock().clone()
    }

    /// Number of offers produced
    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaConnection for FakeConnection {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), ConnectionError> {
        self.tracks.lock().push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        if self.fail_negotiation {
            return Err(ConnectionError::Negotiation("offer refused".to_string()));
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::offer(format!("offer-{}-{n}", self.participant_id())))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        if self.fail_negotiation {
            return Err(ConnectionError::Negotiation("answer refused".to_string()));
        }
        if self.remote_descriptions.lock().is_empty() {
            return Err(ConnectionError::Negotiation("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer(format!("answer-{}", self.participant_id())))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), ConnectionError> {
        self.local_descriptions.lock().push(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), ConnectionError> {
        self.remote_descriptions.lock().push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        if self.remote_descriptions.lock().is_empty() {
            return Err(ConnectionError::Candidate("remote description not set".to_string()));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), ConnectionError> {
        let mut tracks = self.tracks.lock();
        let slot = tracks
            .iter_mut()
            .find(|t| t.kind() == TrackKind::Video)
            .ok_or(ConnectionError::NoVideoSender)?;
        self.replaced_video.lock().push(track.id().to_string());
        *slot = track;
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory recording every [`FakeConnection`] it allocates
pub struct FakeConnectionFactory {
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    fail_negotiation: AtomicBool,
}

impl FakeConnectionFactory {
    /// Create an empty factory
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            fail_negotiation: AtomicBool::new(false),
        }
    }

    /// Make connections allocated from now on fail to negotiate
    pub fn fail_negotiation(&self, fail: bool) {
        self.fail_negotiation.store(fail, Ordering::SeqCst);
    }

    /// Number of connections allocated
    pub fn created(&self) -> usize {
        self.connections.lock().len()
    }

    /// Every connection allocated, in order
    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().clone()
    }

    /// Most recent connection toward `participant_id`
    pub fn connection_for(&self, participant_id: &ParticipantId) -> Option<Arc<FakeConnection>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|c| c.participant_id() == participant_id)
            .cloned()
    }

    /// Connections not yet closed
    pub fn open_connections(&self) -> usize {
        self.connections.lock().iter().filter(|c| !c.is_closed()).count()
    }
}

impl Default for FakeConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn create(&self, sink: ConnectionEventSink) -> Result<Arc<dyn MediaConnection>, ConnectionError> {
        let connection = Arc::new(FakeConnection::new(sink, self.fail_negotiation.load(Ordering::SeqCst)));
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}
