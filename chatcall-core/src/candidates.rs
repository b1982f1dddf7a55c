//! Remote ICE candidate queue
//!
//! Candidates can arrive before the remote description has been applied.
//! They wait here in arrival order and are applied as one batch once the
//! description is in place.

use crate::peer::RtcPeer;
use crate::types::IceCandidate;
use std::collections::VecDeque;

/// Pending remote candidates for one peer connection
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    remote_description_set: bool,
}

impl CandidateQueue {
    /// Empty queue, remote description not yet applied
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue seeded with candidates received before the connection existed
    pub fn with_pending(candidates: impl IntoIterator<Item = IceCandidate>) -> Self {
        Self {
            pending: candidates.into_iter().collect(),
            remote_description_set: false,
        }
    }

    /// Append a candidate in arrival order
    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Whether candidates can go straight to the connection
    pub fn is_flushable(&self) -> bool {
        self.remote_description_set
    }

    /// Record that the remote description has been applied
    pub fn mark_remote_description_set(&mut self) {
        self.remote_description_set = true;
    }

    /// Number of queued candidates
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Apply every queued candidate in arrival order.
    ///
    /// A candidate the connection rejects is logged and skipped; the rest of
    /// the batch is still applied. Returns how many were accepted.
    pub async fn flush(&mut self, peer: &dyn RtcPeer) -> usize {
        let mut applied = 0;
        while let Some(candidate) = self.pending.pop_front() {
            match peer.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!(error = %e, "queued ICE candidate rejected"),
            }
        }
        if applied > 0 {
            tracing::debug!(applied, "flushed queued ICE candidates");
        }
        applied
    }

    /// Drop everything and forget the remote description
    pub fn clear(&mut self) {
        self.pending.clear();
        self.remote_description_set = false;
    }
}
