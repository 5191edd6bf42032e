//! In-memory connections.
//!
//! A [`LoopbackConnection`] follows the offer/answer rules of a real peer
//! connection (signaling states, candidate checks, negotiation-needed after
//! track changes) but produces synthetic SDP and never touches the network.
//! It records everything done to it, which makes it the connection of choice
//! for driving the negotiation layer without a media stack.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use super::connection::{
    ConnectionFactory, ConnectionState, LinkEventKind, LinkEventSink, LocalTrack, MediaKind,
    RemoteTrack, RtcConnection,
};
use crate::error::{Error, Result};
use crate::signaling::{IceCandidate, PeerId, SdpType, SessionDescription};

/// Everything that was done to one connection.
#[derive(Debug, Clone, Default)]
pub struct LoopbackRecord {
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    /// Remote candidates accepted, in application order.
    pub candidates: Vec<IceCandidate>,
    /// Ids of the tracks currently sent.
    pub senders: Vec<String>,
    pub offers_created: usize,
    pub answers_created: usize,
    pub rollbacks: usize,
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

struct Inner {
    record: LoopbackRecord,
    signaling: SignalingState,
    /// (track id, stream id, kind) for every sender.
    tracks: Vec<(String, String, MediaKind)>,
    seen_remote_tracks: HashSet<String>,
    connected: bool,
    gathered: bool,
    version: u32,
}

pub struct LoopbackConnection {
    events: LinkEventSink,
    session_id: u32,
    inner: Mutex<Inner>,
}

impl LoopbackConnection {
    pub fn new(events: LinkEventSink) -> Self {
        Self {
            events,
            session_id: rand::random::<u32>(),
            inner: Mutex::new(Inner {
                record: LoopbackRecord::default(),
                signaling: SignalingState::Stable,
                tracks: Vec::new(),
                seen_remote_tracks: HashSet::new(),
                connected: false,
                gathered: false,
                version: 0,
            }),
        }
    }

    pub async fn record(&self) -> LoopbackRecord {
        self.inner.lock().await.record.clone()
    }

    fn render_sdp(&self, inner: &mut Inner) -> String {
        inner.version += 1;
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.session_id, inner.version
        );
        for (track_id, stream_id, kind) in &inner.tracks {
            let media = match kind {
                MediaKind::Audio => "audio",
                MediaKind::Video => "video",
            };
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:{} {}\r\n",
                media, stream_id, track_id
            ));
        }
        sdp
    }

    fn surface_remote_tracks(&self, inner: &mut Inner, sdp: &str) {
        let mut kind = MediaKind::Audio;
        for line in sdp.lines() {
            if let Some(media) = line.strip_prefix("m=") {
                kind = if media.starts_with("video") {
                    MediaKind::Video
                } else {
                    MediaKind::Audio
                };
            } else if let Some(msid) = line.strip_prefix("a=msid:") {
                let mut parts = msid.split_whitespace();
                let (Some(stream_id), Some(track_id)) = (parts.next(), parts.next()) else {
                    continue;
                };
                if inner.seen_remote_tracks.insert(track_id.to_string()) {
                    self.events.emit(LinkEventKind::Track(RemoteTrack {
                        id: track_id.to_string(),
                        stream_id: stream_id.to_string(),
                        kind,
                        handle: None,
                    }));
                }
            }
        }
    }

    fn after_description(&self, inner: &mut Inner) {
        if !inner.gathered && inner.record.local.is_some() {
            inner.gathered = true;
            let port = 40000 + (self.session_id % 20000);
            self.events.emit(LinkEventKind::IceCandidate(IceCandidate {
                candidate: format!("candidate:1 1 udp 2130706431 127.0.0.1 {} typ host", port),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
        }
        let negotiated = inner.record.local.is_some()
            && inner.record.remote.is_some()
            && inner.signaling == SignalingState::Stable;
        if negotiated && !inner.connected {
            inner.connected = true;
            self.events
                .emit(LinkEventKind::StateChanged(ConnectionState::Connected));
        }
    }

    fn tracks_changed(&self, inner: &Inner) {
        if inner.record.remote.is_some() && inner.signaling == SignalingState::Stable {
            self.events.emit(LinkEventKind::NegotiationNeeded);
        }
    }

    fn invalid_state(op: &str, state: SignalingState) -> Error {
        Error::Connection(format!("{} not allowed in signaling state {:?}", op, state))
    }
}

fn ensure_open(inner: &Inner) -> Result<()> {
    if inner.record.closed {
        return Err(Error::Connection("connection closed".to_string()));
    }
    Ok(())
}

#[async_trait]
impl RtcConnection for LoopbackConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut inner = self.inner.lock().await;
        ensure_open(&inner)?;
        inner.record.offers_created += 1;
        Ok(SessionDescription::offer(self.render_sdp(&mut inner)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut inner = self.inner.lock().await;
        ensure_open(&inner)?;
        if inner.signaling != SignalingState::HaveRemoteOffer {
            return Err(Self::invalid_state("createAnswer", inner.signaling));
        }
        inner.record.answers_created += 1;
        Ok(SessionDescription::answer(self.render_sdp(&mut inner)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut inner = self.inner.lock().await;
        ensure_open(&inner)?;
        match desc.sdp_type {
            SdpType::Offer => {
                if inner.signaling == SignalingState::HaveRemoteOffer {
                    return Err(Self::invalid_state("local offer", inner.signaling));
                }
                inner.signaling = SignalingState::HaveLocalOffer;
            }
            SdpType::Answer | SdpType::Pranswer => {
                if inner.signaling != SignalingState::HaveRemoteOffer {
                    return Err(Self::invalid_state("local answer", inner.signaling));
                }
                inner.signaling = SignalingState::Stable;
            }
            SdpType::Rollback => {
                if inner.signaling != SignalingState::HaveLocalOffer {
                    return Err(Self::invalid_state("rollback", inner.signaling));
                }
                inner.signaling = SignalingState::Stable;
                inner.record.rollbacks += 1;
                return Ok(());
            }
        }
        inner.record.local = Some(desc);
        self.after_description(&mut inner);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut inner = self.inner.lock().await;
        ensure_open(&inner)?;
        match desc.sdp_type {
            SdpType::Offer => {
                if inner.signaling != SignalingState::Stable {
                    return Err(Self::invalid_state("remote offer", inner.signaling));
                }
                inner.signaling = SignalingState::HaveRemoteOffer;
            }
            SdpType::Answer | SdpType::Pranswer => {
                if inner.signaling != SignalingState::HaveLocalOffer {
                    return Err(Self::invalid_state("remote answer", inner.signaling));
                }
                inner.signaling = SignalingState::Stable;
            }
            SdpType::Rollback => {
                return Err(Self::invalid_state("remote rollback", inner.signaling));
            }
        }
        self.surface_remote_tracks(&mut inner, &desc.sdp);
        inner.record.remote = Some(desc);
        self.after_description(&mut inner);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut inner = self.inner.lock().await;
        ensure_open(&inner)?;
        if inner.record.remote.is_none() {
            return Err(Error::Connection(
                "remote description not set".to_string(),
            ));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(Error::Connection(format!(
                "invalid candidate: {}",
                candidate.candidate
            )));
        }
        inner.record.candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: LocalTrack) -> Result<()> {
        let mut inner = self.inner.lock().await;
        ensure_open(&inner)?;
        let id = track.id().to_string();
        if inner.record.senders.contains(&id) {
            return Err(Error::Connection(format!("sender for {} already exists", id)));
        }
        let kind = match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        };
        inner
            .tracks
            .push((id.clone(), track.stream_id().to_string(), kind));
        inner.record.senders.push(id);
        self.tracks_changed(&inner);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        ensure_open(&inner)?;
        if !inner.record.senders.iter().any(|id| id == track_id) {
            return Err(Error::Connection(format!("no sender for {}", track_id)));
        }
        inner.record.senders.retain(|id| id != track_id);
        inner.tracks.retain(|(id, _, _)| id != track_id);
        self.tracks_changed(&inner);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.record.closed {
            return Ok(());
        }
        inner.record.closed = true;
        self.events
            .emit(LinkEventKind::StateChanged(ConnectionState::Closed));
        Ok(())
    }
}

/// Hands out [`LoopbackConnection`]s and keeps the latest one per peer.
#[derive(Default)]
pub struct LoopbackFactory {
    connections: Mutex<HashMap<PeerId, Arc<LoopbackConnection>>>,
    created: AtomicUsize,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connection(&self, peer_id: &str) -> Option<Arc<LoopbackConnection>> {
        self.connections.lock().await.get(peer_id).cloned()
    }

    /// Number of connections created over the factory's lifetime.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for LoopbackFactory {
    async fn create(&self, events: LinkEventSink) -> Result<Arc<dyn RtcConnection>> {
        let peer_id = events.peer_id().to_string();
        let connection = Arc::new(LoopbackConnection::new(events));
        self.connections
            .lock()
            .await
            .insert(peer_id, Arc::clone(&connection));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(connection as Arc<dyn RtcConnection>)
    }
}
