//! Per-peer negotiation: one [`PeerLink`] per remote participant, created
//! through a [`ConnectionFactory`] so the native stack can be swapped for an
//! in-memory one.

pub mod connection;
pub mod link;
pub mod loopback;
pub mod negotiation;
pub mod registry;
pub mod webrtc;

pub use connection::{
    ConnectionFactory, ConnectionState, LinkEvent, LinkEventKind, LinkEventSink, LocalTrack,
    MediaKind, RemoteTrack, RtcConnection,
};
pub use link::{NegotiationPhase, PeerLink};
pub use loopback::{LoopbackConnection, LoopbackFactory, LoopbackRecord};
pub use negotiation::{Negotiator, PendingOffer};
pub use registry::ConnectionRegistry;
pub use self::webrtc::{WebRtcConnection, WebRtcConnectionFactory};
