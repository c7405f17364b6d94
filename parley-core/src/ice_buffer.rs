//! Early-candidate buffering
//!
//! Remote candidates can overtake the description they belong to. Until a
//! peer's remote description is committed its candidates are parked here,
//! keyed by remote participant, and replayed in arrival order afterwards.

use crate::identity::ParticipantId;
use crate::types::IceCandidate;
use std::collections::HashMap;

/// Per-participant queue of candidates awaiting a remote description
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    queues: HashMap<ParticipantId, Vec<IceCandidate>>,
}

impl IceCandidateBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a candidate for `participant_id`
    pub fn enqueue(&mut self, participant_id: &ParticipantId, candidate: IceCandidate) {
        let queue = self.queues.entry(participant_id.clone()).or_default();
        queue.push(candidate);
        tracing::trace!(participant = %participant_id, queued = queue.len(), "Buffered remote candidate");
    }

    /// Take every parked candidate for `participant_id`, in arrival order
    ///
    /// Returns an empty list if nothing is queued or it was already drained.
    pub fn drain(&mut self, participant_id: &ParticipantId) -> Vec<IceCandidate> {
        self.queues.remove(participant_id).unwrap_or_default()
    }

    /// Number of candidates parked for `participant_id`
    pub fn pending(&self, participant_id: &ParticipantId) -> usize {
        self.queues.get(participant_id).map_or(0, Vec::len)
    }

    /// Drop everything parked for `participant_id`
    pub fn discard(&mut self, participant_id: &ParticipantId) {
        if let Some(dropped) = self.queues.remove(participant_id) {
            tracing::trace!(participant = %participant_id, dropped = dropped.len(), "Discarded buffered candidates");
        }
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.queues.clear();
    }

    /// Whether nothing is parked
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
