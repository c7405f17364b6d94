//! Call signaling protocol
//!
//! Named events exchanged with the coordination server: call setup and
//! teardown, session descriptions and candidates for identity-addressed
//! calls, and the pool-matching flow for anonymous calls.
//!
//! Every message travels as `{"event": "<name>", "payload": {...}}`.

use crate::identity::{Participant, ParticipantId};
use crate::types::{CallId, CallKind, IceCandidate, MatchRole, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Transport is not connected
    #[error("Signaling transport not connected")]
    NotConnected,
}

/// Wire names of every signaling event
pub mod events {
    /// Announce the local user to the server
    pub const IDENTIFY: &str = "identify";
    /// Request call creation (acknowledged)
    pub const CALL_INITIATE: &str = "call:initiate";
    /// Someone is calling us
    pub const CALL_INCOMING: &str = "call:incoming";
    /// Local acceptance
    pub const CALL_ACCEPT: &str = "call:accept";
    /// A participant accepted
    pub const CALL_ACCEPTED: &str = "call:accepted";
    /// Local rejection
    pub const CALL_REJECT: &str = "call:reject";
    /// A participant rejected
    pub const CALL_REJECTED: &str = "call:rejected";
    /// Local end
    pub const CALL_END: &str = "call:end";
    /// A participant ended the call
    pub const CALL_ENDED: &str = "call:ended";
    /// Session description offer
    pub const CALL_OFFER: &str = "call:offer";
    /// Session description answer
    pub const CALL_ANSWER: &str = "call:answer";
    /// Network-path candidate
    pub const CALL_ICE_CANDIDATE: &str = "call:ice-candidate";
    /// Microphone presence flag
    pub const CALL_TOGGLE_MUTE: &str = "call:toggle-mute";
    /// Camera presence flag
    pub const CALL_TOGGLE_VIDEO: &str = "call:toggle-video";
    /// Group member joined
    pub const PARTICIPANT_JOINED: &str = "group-call:participant-joined";
    /// Group member left
    pub const PARTICIPANT_LEFT: &str = "group-call:participant-left";
    /// Enter the matching pool
    pub const FIND_PARTNER: &str = "find-partner";
    /// Pool has nobody to pair with yet
    pub const WAITING_FOR_PARTNER: &str = "waiting-for-partner";
    /// Pool paired us
    pub const MATCH_FOUND: &str = "match-found";
    /// Match session description offer
    pub const SIGNAL_OFFER: &str = "signal-offer";
    /// Match session description answer
    pub const SIGNAL_ANSWER: &str = "signal-answer";
    /// Match network-path candidate
    pub const SIGNAL_ICE_CANDIDATE: &str = "signal-ice-candidate";
    /// Leave the pool or the current match
    pub const LEAVE_POOL: &str = "leave-pool";
    /// Partner went away
    pub const MATCH_ENDED: &str = "match-ended";
}

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "payload")]
pub enum SignalingMessage {
    /// Announce the local user
    #[serde(rename = "identify")]
    Identify {
        /// Local user
        user_id: ParticipantId,
    },

    // === Identity-addressed calls ===
    /// Ask the server to create a call
    #[serde(rename = "call:initiate")]
    CallInitiate {
        /// Who to ring
        recipients: Vec<ParticipantId>,
        /// Kind of call
        kind: CallKind,
        /// Conversation the call belongs to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation: Option<String>,
    },

    /// Incoming call notification
    #[serde(rename = "call:incoming")]
    CallIncoming {
        /// Call identifier
        call_id: CallId,
        /// Kind of call
        kind: CallKind,
        /// Who is calling
        caller: Participant,
        /// Everyone invited
        #[serde(default)]
        participants: Vec<Participant>,
    },

    /// Local acceptance
    #[serde(rename = "call:accept")]
    CallAccept {
        /// Call identifier
        call_id: CallId,
    },

    /// A participant accepted
    #[serde(rename = "call:accepted")]
    CallAccepted {
        /// Call identifier
        call_id: CallId,
        /// Who accepted
        participant: Participant,
    },

    /// Local rejection
    #[serde(rename = "call:reject")]
    CallReject {
        /// Call identifier
        call_id: CallId,
        /// Optional reason
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// A participant rejected
    #[serde(rename = "call:rejected")]
    CallRejected {
        /// Call identifier
        call_id: CallId,
        /// Who rejected
        participant_id: ParticipantId,
        /// Optional reason
        #[serde(default)]
        reason: Option<String>,
    },

    /// Local end
    #[serde(rename = "call:end")]
    CallEnd {
        /// Call identifier
        call_id: CallId,
    },

    /// A participant ended the call
    #[serde(rename = "call:ended")]
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Who ended it, absent when the server closed the call
        #[serde(default)]
        participant_id: Option<ParticipantId>,
    },

    /// Offer for one peer of a call
    #[serde(rename = "call:offer")]
    CallOffer {
        /// Call identifier
        call_id: CallId,
        /// Sender
        from: ParticipantId,
        /// Target
        to: ParticipantId,
        /// The offer
        description: SessionDescription,
    },

    /// Answer for one peer of a call
    #[serde(rename = "call:answer")]
    CallAnswer {
        /// Call identifier
        call_id: CallId,
        /// Sender
        from: ParticipantId,
        /// Target
        to: ParticipantId,
        /// The answer
        description: SessionDescription,
    },

    /// Candidate for one peer of a call
    #[serde(rename = "call:ice-candidate")]
    CallIceCandidate {
        /// Call identifier
        call_id: CallId,
        /// Sender
        from: ParticipantId,
        /// Target
        to: ParticipantId,
        /// The candidate
        candidate: IceCandidate,
    },

    /// Microphone presence broadcast
    #[serde(rename = "call:toggle-mute")]
    CallToggleMute {
        /// Call identifier
        call_id: CallId,
        /// Whose microphone
        participant_id: ParticipantId,
        /// New flag
        muted: bool,
    },

    /// Camera presence broadcast
    #[serde(rename = "call:toggle-video")]
    CallToggleVideo {
        /// Call identifier
        call_id: CallId,
        /// Whose camera
        participant_id: ParticipantId,
        /// New flag
        video_off: bool,
    },

    /// Group member joined
    #[serde(rename = "group-call:participant-joined")]
    ParticipantJoined {
        /// Call identifier
        call_id: CallId,
        /// The new member
        participant: Participant,
    },

    /// Group member left
    #[serde(rename = "group-call:participant-left")]
    ParticipantLeft {
        /// Call identifier
        call_id: CallId,
        /// The member
        participant_id: ParticipantId,
    },

    // === Anonymous pool matching ===
    /// Enter the pool
    #[serde(rename = "find-partner")]
    FindPartner,

    /// Still waiting for a partner
    #[serde(rename = "waiting-for-partner")]
    WaitingForPartner,

    /// Paired with a partner
    #[serde(rename = "match-found")]
    MatchFound {
        /// Assigned role
        role: MatchRole,
        /// Transient partner id
        partner_id: ParticipantId,
        /// Partner display name
        partner_name: String,
    },

    /// Offer to the partner
    #[serde(rename = "signal-offer")]
    SignalOffer {
        /// Sender
        from: ParticipantId,
        /// Target
        to: ParticipantId,
        /// The offer
        description: SessionDescription,
    },

    /// Answer to the partner
    #[serde(rename = "signal-answer")]
    SignalAnswer {
        /// Sender
        from: ParticipantId,
        /// Target
        to: ParticipantId,
        /// The answer
        description: SessionDescription,
    },

    /// Candidate for the partner
    #[serde(rename = "signal-ice-candidate")]
    SignalIceCandidate {
        /// Sender
        from: ParticipantId,
        /// Target
        to: ParticipantId,
        /// The candidate
        candidate: IceCandidate,
    },

    /// Leave the pool or current match
    #[serde(rename = "leave-pool")]
    LeavePool,

    /// Partner went away
    #[serde(rename = "match-ended")]
    MatchEnded {
        /// Departed partner, when the server says who
        #[serde(default)]
        partner_id: Option<ParticipantId>,
    },
}

impl SignalingMessage {
    /// Wire name of the event
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify { .. } => events::IDENTIFY,
            Self::CallInitiate { .. } => events::CALL_INITIATE,
            Self::CallIncoming { .. } => events::CALL_INCOMING,
            Self::CallAccept { .. } => events::CALL_ACCEPT,
            Self::CallAccepted { .. } => events::CALL_ACCEPTED,
            Self::CallReject { .. } => events::CALL_REJECT,
            Self::CallRejected { .. } => events::CALL_REJECTED,
            Self::CallEnd { .. } => events::CALL_END,
            Self::CallEnded { .. } => events::CALL_ENDED,
            Self::CallOffer { .. } => events::CALL_OFFER,
            Self::CallAnswer { .. } => events::CALL_ANSWER,
            Self::CallIceCandidate { .. } => events::CALL_ICE_CANDIDATE,
            Self::CallToggleMute { .. } => events::CALL_TOGGLE_MUTE,
            Self::CallToggleVideo { .. } => events::CALL_TOGGLE_VIDEO,
            Self::ParticipantJoined { .. } => events::PARTICIPANT_JOINED,
            Self::ParticipantLeft { .. } => events::PARTICIPANT_LEFT,
            Self::FindPartner => events::FIND_PARTNER,
            Self::WaitingForPartner => events::WAITING_FOR_PARTNER,
            Self::MatchFound { .. } => events::MATCH_FOUND,
            Self::SignalOffer { .. } => events::SIGNAL_OFFER,
            Self::SignalAnswer { .. } => events::SIGNAL_ANSWER,
            Self::SignalIceCandidate { .. } => events::SIGNAL_ICE_CANDIDATE,
            Self::LeavePool => events::LEAVE_POOL,
            Self::MatchEnded { .. } => events::MATCH_ENDED,
        }
    }

    /// Call the message refers to, if any
    #[must_use]
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::CallIncoming { call_id, .. }
            | Self::CallAccept { call_id }
            | Self::CallAccepted { call_id, .. }
            | Self::CallReject { call_id, .. }
            | Self::CallRejected { call_id, .. }
            | Self::CallEnd { call_id }
            | Self::CallEnded { call_id, .. }
            | Self::CallOffer { call_id, .. }
            | Self::CallAnswer { call_id, .. }
            | Self::CallIceCandidate { call_id, .. }
            | Self::CallToggleMute { call_id, .. }
            | Self::CallToggleVideo { call_id, .. }
            | Self::ParticipantJoined { call_id, .. }
            | Self::ParticipantLeft { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    /// Encode for the wire
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from the wire
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a known event
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Acknowledgment of a request round trip
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SignalingAck {
    /// Call created
    Ok {
        /// Server-assigned call id
        call_id: CallId,
        /// Initial roster
        #[serde(default)]
        participants: Vec<Participant>,
    },
    /// Request refused
    Error {
        /// Server explanation
        message: String,
    },
}

/// Signaling transport trait
///
/// Implement this for the concrete channel to the coordination server
/// (websocket, socket.io bridge, in-process loopback, ...). Messages on one
/// connection are delivered in order.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open the connection
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Close the connection
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Send a fire-and-forget message
    async fn send(&self, message: SignalingMessage) -> Result<(), Self::Error>;

    /// Send a message and wait for the server's acknowledgment
    async fn request(&self, message: SignalingMessage) -> Result<SignalingAck, Self::Error>;

    /// Receive the next inbound message
    ///
    /// Returns `Ok(None)` once the connection is closed. Must be
    /// cancellation safe: a dropped call must not lose a message.
    async fn receive(&self) -> Result<Option<SignalingMessage>, Self::Error>;
}

/// Outbound half of signaling as seen by state machines and peer sessions
#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Send a fire-and-forget message
    async fn emit(&self, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Send a message and wait for its acknowledgment
    async fn request(&self, message: SignalingMessage) -> Result<SignalingAck, SignalingError>;
}

/// Signaling handler wrapping a concrete transport
pub struct SignalingHandler<T: SignalingTransport> {
    transport: Arc<T>,
}

impl<T: SignalingTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Open the transport connection
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot connect
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), SignalingError> {
        tracing::info!("Connecting signaling transport");
        self.transport
            .connect()
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))
    }

    /// Close the transport connection
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to close
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<(), SignalingError> {
        tracing::info!("Disconnecting signaling transport");
        self.transport
            .disconnect()
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))
    }

    /// Send a signaling message
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, message), fields(event = message.name()))]
    pub async fn send_message(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        tracing::debug!("Sending signaling message");
        self.transport
            .send(message)
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))
    }

    /// Send a request and wait for its acknowledgment
    ///
    /// # Errors
    ///
    /// Returns error if the round trip fails
    #[tracing::instrument(skip(self, message), fields(event = message.name()))]
    pub async fn request(&self, message: SignalingMessage) -> Result<SignalingAck, SignalingError> {
        tracing::debug!("Sending signaling request");
        let ack = self
            .transport
            .request(message)
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))?;
        tracing::debug!(ack = ?ack, "Received acknowledgment");
        Ok(ack)
    }

    /// Receive a signaling message
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails
    pub async fn receive_message(&self) -> Result<Option<SignalingMessage>, SignalingError> {
        let message = self
            .transport
            .receive()
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))?;
        match &message {
            Some(m) => tracing::debug!(event = m.name(), "Received signaling message"),
            None => tracing::info!("Signaling transport closed"),
        }
        Ok(message)
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

#[async_trait]
impl<T: SignalingTransport> SignalChannel for SignalingHandler<T> {
    async fn emit(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.send_message(message).await
    }

    async fn request(&self, message: SignalingMessage) -> Result<SignalingAck, SignalingError> {
        SignalingHandler::request(self, message).await
    }
}
