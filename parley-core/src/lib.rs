//! Parley - call signaling and peer-session orchestration
//!
//! This library coordinates real-time audio/video sessions between
//! participants over a server-relayed signaling channel. It features:
//!
//! - **Identity-addressed calls**: 1:1 and group calls with ringing,
//!   accept/reject, presence and remote mute/video state
//! - **Anonymous matching**: pool-based pairing with server-assigned roles
//! - **Mesh negotiation**: one peer session per remote participant, with
//!   network-path candidates buffered until they can be applied
//! - **Media controls**: mute, video off, camera switch and screen share
//!   without renegotiation
//! - **Pluggable media**: the `webrtc` crate by default, any
//!   [`ConnectionFactory`] otherwise
//!
//! # Examples
//!
//! ```rust,no_run
//! use parley_core::prelude::*;
//! use parley_core::testing::{FakeConnectionFactory, FakeMediaCapability, MockSignalingTransport};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let transport = Arc::new(MockSignalingTransport::new());
//! let signaling = Arc::new(SignalingHandler::new(transport));
//!
//! let orchestrator = CallOrchestrator::builder(ParticipantId::new("alice"), signaling)
//!     .with_media_capability(Arc::new(FakeMediaCapability::new()))
//!     .with_connection_factory(Arc::new(FakeConnectionFactory::new()))
//!     .build()?;
//!
//! orchestrator.connect().await?;
//!
//! // Place a video call
//! let call_id = orchestrator
//!     .initiate_call(vec![ParticipantId::new("bob")], CallKind::Video1to1, None)
//!     .await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core types and data structures
pub mod types;

/// Participant identity
pub mod identity;

/// Signaling protocol and handlers
pub mod signaling;

/// Local and remote media handles
pub mod media;

/// Media connection abstraction layer
pub mod connection;

/// Candidate buffering for peers not yet negotiated
pub mod ice_buffer;

/// Per-participant negotiation
pub mod peer;

/// Behavior shared by the session machines
pub mod machine;

/// Identity-addressed calls
pub mod call;

/// Anonymous pool matching
pub mod matching;

/// Inbound event routing
pub mod dispatch;

/// Orchestrator and configuration
pub mod service;

/// In-process doubles for tests and demos
pub mod testing;

/// `webrtc` crate backend (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_backend;

// Re-export main types at crate root
pub use call::{CallConfig, CallSession, CallSessionMachine};
pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionEventSink, ConnectionFactory, IceServer,
    MediaConnection, PeerEvent,
};
pub use dispatch::{DispatchTable, Route};
pub use ice_buffer::IceCandidateBuffer;
pub use identity::{Participant, ParticipantId};
pub use machine::{MediaSnapshot, SessionError, SessionMachine};
pub use matching::{MatchConfig, MatchSession, MatchSessionMachine};
pub use media::{LocalMedia, LocalTrack, MediaCapability, MediaError, RemoteMedia, RemoteTrack};
pub use peer::{PeerError, PeerRegistry, PeerSession, SignalRoute, SignalScope};
pub use service::{
    CallOrchestrator, CallOrchestratorBuilder, MatchSnapshot, OrchestratorConfig, OrchestratorSnapshot, ServiceError,
};
pub use signaling::{
    SignalChannel, SignalingAck, SignalingError, SignalingHandler, SignalingMessage, SignalingTransport,
};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_backend::{SampleMediaCapability, WebRtcConnection, WebRtcConnectionFactory, WebRtcLocalTrack};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::identity::{Participant, ParticipantId};
    pub use crate::media::{LocalTrack, MediaCapability};
    pub use crate::service::{CallOrchestrator, CallOrchestratorBuilder, OrchestratorConfig, ServiceError};
    pub use crate::signaling::{SignalingHandler, SignalingMessage, SignalingTransport};
    pub use crate::types::{
        CallId, CallKind, CallStatus, CameraFacing, MatchRole, MatchStatus, SessionEvent, TeardownReason,
    };
    #[cfg(feature = "webrtc-backend")]
    pub use crate::webrtc_backend::{SampleMediaCapability, WebRtcConnectionFactory};
}
