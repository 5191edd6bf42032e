use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;
use crate::signaling::{IceCandidate, PeerId, SessionDescription};

/// A local media track that can be attached to any number of links.
pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "New"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Failed => write!(f, "Failed"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// A track received from a remote participant.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// Native handle for reading RTP; absent for in-memory connections.
    pub handle: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Something the native connection reported for one link.
#[derive(Debug, Clone)]
pub enum LinkEventKind {
    IceCandidate(IceCandidate),
    NegotiationNeeded,
    Track(RemoteTrack),
    StateChanged(ConnectionState),
}

#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub peer_id: PeerId,
    pub kind: LinkEventKind,
}

/// Where a connection's callbacks go. Tagged with the remote peer id so the
/// session loop can route every event back to its link.
#[derive(Clone)]
pub struct LinkEventSink {
    peer_id: PeerId,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEventSink {
    pub fn new(peer_id: PeerId, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { peer_id, tx }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn emit(&self, kind: LinkEventKind) {
        let _ = self.tx.send(LinkEvent {
            peer_id: self.peer_id.clone(),
            kind,
        });
    }
}

/// The native peer connection behind one link.
#[async_trait]
pub trait RtcConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_track(&self, track: LocalTrack) -> Result<()>;

    async fn remove_track(&self, track_id: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates connections, wiring their callbacks to `events` before returning.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, events: LinkEventSink) -> Result<Arc<dyn RtcConnection>>;
}
