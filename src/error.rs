use thiserror::Error;

use crate::peer::NegotiationPhase;

/// Errors raised by the relay, the signaling client and the negotiation layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] webrtc::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A frame that is not a known signaling event.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A well-formed signaling event that does not fit the link's phase.
    #[error("Unexpected {event} from {peer_id} while {phase}")]
    UnexpectedSignal {
        event: &'static str,
        peer_id: String,
        phase: NegotiationPhase,
    },

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Camera or microphone could not be acquired.
    #[error("Media error: {0}")]
    Media(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

pub type Result<T> = std::result::Result<T, Error>;
