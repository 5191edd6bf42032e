use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::peer::ConnectionState;
use crate::signaling::PeerId;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub id: PeerId,
    pub name: String,
    pub email: String,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub connection: ConnectionState,
    /// Ids of the tracks received from this participant.
    pub remote_tracks: Vec<String>,
}

impl ParticipantState {
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// Everything a UI needs to render the call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallState {
    pub local_id: Option<PeerId>,
    pub room: Option<String>,
    pub name: String,
    pub email: String,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub participants: BTreeMap<PeerId, ParticipantState>,
}

impl CallState {
    pub fn participant(&self, id: &str) -> Option<&ParticipantState> {
        self.participants.get(id)
    }
}

/// Publishes [`CallState`] snapshots to any number of subscribers.
#[derive(Clone)]
pub struct CallMonitor {
    state: Arc<watch::Sender<CallState>>,
    receiver: watch::Receiver<CallState>,
}

impl CallMonitor {
    pub fn new() -> Self {
        let (state, receiver) = watch::channel(CallState::default());
        Self {
            state: Arc::new(state),
            receiver,
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut CallState)) {
        self.state.send_modify(f);
    }

    /// Applies `f` to the participant if it is known. Returns whether it was.
    pub fn update_participant(&self, id: &str, f: impl FnOnce(&mut ParticipantState)) -> bool {
        self.state
            .send_if_modified(|state| match state.participants.get_mut(id) {
                Some(participant) => {
                    f(participant);
                    true
                }
                None => false,
            })
    }

    pub fn snapshot(&self) -> CallState {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.receiver.clone()
    }
}

impl Default for CallMonitor {
    fn default() -> Self {
        Self::new()
    }
}
