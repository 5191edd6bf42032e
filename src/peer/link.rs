use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::connection::{LocalTrack, RtcConnection};
use crate::error::Result;
use crate::signaling::{IceCandidate, PeerId, SessionDescription};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NegotiationPhase {
    #[default]
    Idle,
    OfferSent,
    OfferReceived,
    Stable,
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationPhase::Idle => write!(f, "Idle"),
            NegotiationPhase::OfferSent => write!(f, "OfferSent"),
            NegotiationPhase::OfferReceived => write!(f, "OfferReceived"),
            NegotiationPhase::Stable => write!(f, "Stable"),
        }
    }
}

#[derive(Debug, Default)]
struct LinkState {
    phase: NegotiationPhase,
    /// Bumped every time an offer goes out; stale deadlines compare against it.
    generation: u64,
    remote_description_set: bool,
    ice_queue: VecDeque<IceCandidate>,
    attached: HashSet<String>,
}

/// Negotiation context for one remote participant.
///
/// Candidate application and remote-description application both run under
/// the state lock, so a candidate can never overtake the drain of the queue.
pub struct PeerLink {
    peer_id: PeerId,
    connection: Arc<dyn RtcConnection>,
    state: Mutex<LinkState>,
}

impl PeerLink {
    pub fn new(peer_id: PeerId, connection: Arc<dyn RtcConnection>) -> Self {
        Self {
            peer_id,
            connection,
            state: Mutex::new(LinkState::default()),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn connection(&self) -> &Arc<dyn RtcConnection> {
        &self.connection
    }

    pub async fn phase(&self) -> NegotiationPhase {
        self.state.lock().await.phase
    }

    pub(crate) async fn set_phase(&self, phase: NegotiationPhase) {
        let mut state = self.state.lock().await;
        debug!("Link {}: {} -> {}", self.peer_id, state.phase, phase);
        state.phase = phase;
    }

    /// Moves to `OfferSent` and returns the new negotiation generation.
    pub(crate) async fn begin_offer(&self) -> u64 {
        let mut state = self.state.lock().await;
        debug!("Link {}: {} -> OfferSent", self.peer_id, state.phase);
        state.phase = NegotiationPhase::OfferSent;
        state.generation += 1;
        state.generation
    }

    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    pub async fn has_remote_description(&self) -> bool {
        self.state.lock().await.remote_description_set
    }

    pub async fn queued_candidates(&self) -> usize {
        self.state.lock().await.ice_queue.len()
    }

    /// Applies the candidate now if a remote description is in place,
    /// otherwise queues it behind the ones already waiting.
    pub async fn enqueue_or_apply(&self, candidate: IceCandidate) {
        let mut state = self.state.lock().await;
        if !state.remote_description_set {
            debug!(
                "Queueing candidate for {} ({} waiting)",
                self.peer_id,
                state.ice_queue.len() + 1
            );
            state.ice_queue.push_back(candidate);
            return;
        }
        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            warn!("Failed to add ICE candidate for {}: {}", self.peer_id, e);
        }
    }

    /// Sets the remote description. The first successful call also drains
    /// the candidate queue in arrival order.
    pub async fn apply_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.state.lock().await;
        self.connection.set_remote_description(desc).await?;
        if state.remote_description_set {
            return Ok(());
        }
        state.remote_description_set = true;

        let queued: Vec<IceCandidate> = state.ice_queue.drain(..).collect();
        if !queued.is_empty() {
            debug!("Draining {} queued candidates for {}", queued.len(), self.peer_id);
        }
        for candidate in queued {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                warn!("Failed to add queued ICE candidate for {}: {}", self.peer_id, e);
            }
        }
        Ok(())
    }

    /// Attaches a local track unless it is already attached. Returns whether
    /// a sender was added.
    pub async fn attach_track(&self, track: &LocalTrack) -> Result<bool> {
        let mut state = self.state.lock().await;
        let id = track.id().to_owned();
        if state.attached.contains(&id) {
            debug!("Track {} already attached to {}, skipping", id, self.peer_id);
            return Ok(false);
        }
        self.connection.add_track(Arc::clone(track)).await?;
        debug!("Track {} attached to {}", id, self.peer_id);
        state.attached.insert(id);
        Ok(true)
    }

    pub async fn detach_track(&self, track_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.attached.contains(track_id) {
            return Ok(false);
        }
        self.connection.remove_track(track_id).await?;
        state.attached.remove(track_id);
        Ok(true)
    }

    pub async fn attached_tracks(&self) -> usize {
        self.state.lock().await.attached.len()
    }

    pub async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            warn!("Error closing connection to {}: {}", self.peer_id, e);
        }
    }
}
