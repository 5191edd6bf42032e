use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::connection::{
    ConnectionFactory, ConnectionState, LinkEventKind, LinkEventSink, LocalTrack, MediaKind,
    RemoteTrack, RtcConnection,
};
use crate::error::{Error, Result};
use crate::signaling::{IceCandidate, SessionDescription};

/// Builds `webrtc` peer connections that share one media engine.
pub struct WebRtcConnectionFactory {
    api: API,
    stun_servers: Vec<String>,
}

impl WebRtcConnectionFactory {
    pub fn new(stun_servers: Vec<String>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, stun_servers })
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(&self, events: LinkEventSink) -> Result<Arc<dyn RtcConnection>> {
        let mut config = RTCConfiguration::default();
        if !self.stun_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }];
        }
        let peer_connection = Arc::new(self.api.new_peer_connection(config).await?);

        let sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(LinkEventKind::IceCandidate(from_rtc_candidate(init))),
                    Err(e) => warn!("Unusable local candidate for {}: {}", sink.peer_id(), e),
                }
            })
        }));

        let sink = events.clone();
        peer_connection.on_negotiation_needed(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                debug!("Negotiation needed for {}", sink.peer_id());
                sink.emit(LinkEventKind::NegotiationNeeded);
            })
        }));

        let sink = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => MediaKind::Video,
                        _ => MediaKind::Audio,
                    };
                    info!("Remote {:?} track from {}", kind, sink.peer_id());
                    sink.emit(LinkEventKind::Track(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                        handle: Some(track),
                    }));
                })
            },
        ));

        let sink = events;
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };
                    info!("Peer {} connection state: {}", sink.peer_id(), state);
                    sink.emit(LinkEventKind::StateChanged(state));
                })
            },
        ));

        Ok(Arc::new(WebRtcConnection {
            peer_connection,
            senders: Mutex::new(HashMap::new()),
        }) as Arc<dyn RtcConnection>)
    }
}

pub struct WebRtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    Ok(serde_json::from_value(serde_json::to_value(desc)?)?)
}

fn from_rtc_description(desc: &RTCSessionDescription) -> Result<SessionDescription> {
    Ok(serde_json::from_value(serde_json::to_value(desc)?)?)
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut desc = to_rtc_description(desc)?;
        // The native stack only accepts a rollback that carries the offer
        // being rolled back.
        if desc.sdp_type == RTCSdpType::Rollback && desc.sdp.is_empty() {
            match self.peer_connection.pending_local_description().await {
                Some(pending) => desc.sdp = pending.sdp,
                None => {
                    return Err(Error::Connection(
                        "no pending local offer to roll back".to_string(),
                    ))
                }
            }
        }
        self.peer_connection.set_local_description(desc).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: LocalTrack) -> Result<()> {
        let id = track.id().to_owned();
        let sender = self.peer_connection.add_track(track).await?;

        // Drain RTCP so the interceptors keep running.
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().await.insert(id, sender);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        let sender = self.senders.lock().await.remove(track_id);
        if let Some(sender) = sender {
            self.peer_connection.remove_track(&sender).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::link::{NegotiationPhase, PeerLink};
    use crate::peer::negotiation::Negotiator;
    use crate::peer::test_support::audio_track;
    use tokio::sync::mpsc;

    async fn native_link(factory: &WebRtcConnectionFactory, peer_id: &str) -> PeerLink {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = factory
            .create(LinkEventSink::new(peer_id.to_string(), tx))
            .await
            .unwrap();
        PeerLink::new(peer_id.to_string(), connection)
    }

    fn negotiator(id: &str) -> Negotiator {
        let mut n = Negotiator::new();
        n.set_local_id(id.to_string());
        n
    }

    #[test]
    fn test_rollback_converts_to_native() {
        let native = to_rtc_description(SessionDescription::rollback()).unwrap();
        assert_eq!(native.sdp_type, RTCSdpType::Rollback);
    }

    #[test]
    fn test_answer_round_trips_through_native() {
        let desc = SessionDescription::answer("v=0\r\n");
        let native = to_rtc_description(desc.clone()).unwrap();
        assert_eq!(native.sdp_type, RTCSdpType::Answer);
        assert_eq!(from_rtc_description(&native).unwrap(), desc);
    }

    #[tokio::test]
    async fn test_factory_builds_connection() {
        let factory = WebRtcConnectionFactory::new(vec![
            "stun:stun.l.google.com:19302".to_string(),
        ])
        .unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let connection = factory
            .create(LinkEventSink::new("b".to_string(), tx))
            .await
            .unwrap();
        let offer = connection.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, crate::signaling::SdpType::Offer);
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_glare_rollback_on_native_connections() {
        let factory = WebRtcConnectionFactory::new(Vec::new()).unwrap();
        // Link held by "a" towards "b", and the reverse.
        let on_a = native_link(&factory, "b").await;
        let on_b = native_link(&factory, "a").await;
        let (na, nb) = (negotiator("a"), negotiator("b"));
        let tracks_a = vec![audio_track("mic-a")];
        let tracks_b = vec![audio_track("mic-b")];

        let offer_a = na.initiate(&on_a, &tracks_a).await.unwrap().unwrap().offer;
        let offer_b = nb.initiate(&on_b, &tracks_b).await.unwrap().unwrap().offer;

        assert!(na
            .accept_offer(&on_a, offer_b, &tracks_a)
            .await
            .unwrap()
            .is_none());
        assert_eq!(on_a.phase().await, NegotiationPhase::OfferSent);

        let ans = nb
            .accept_offer(&on_b, offer_a, &tracks_b)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ans.sdp_type, crate::signaling::SdpType::Answer);
        assert_eq!(on_b.phase().await, NegotiationPhase::Stable);

        na.accept_answer(&on_a, ans, "call:accepted").await.unwrap();
        assert_eq!(on_a.phase().await, NegotiationPhase::Stable);

        on_a.close().await;
        on_b.close().await;
    }

    #[tokio::test]
    async fn test_rollback_without_offer_is_rejected() {
        let factory = WebRtcConnectionFactory::new(Vec::new()).unwrap();
        let link = native_link(&factory, "b").await;
        let result = link
            .connection()
            .set_local_description(SessionDescription::rollback())
            .await;
        assert!(matches!(result, Err(Error::Connection(_))));
        link.close().await;
    }
}
