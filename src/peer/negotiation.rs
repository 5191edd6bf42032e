//! Offer/answer sequencing for a single link.
//!
//! ```text
//! caller:  Idle --initiate--> OfferSent --answer--> Stable
//! callee:  Idle --offer--> OfferReceived --answer sent--> Stable
//! renegotiation:  Stable --negotiation needed--> OfferSent --answer--> Stable
//! ```
//!
//! Offer collisions are settled by comparing participant ids: the side with
//! the lower id keeps its offer, the other side rolls its own back and answers.

use tracing::{debug, info, warn};

use super::connection::LocalTrack;
use super::link::{NegotiationPhase, PeerLink};
use crate::error::{Error, Result};
use crate::signaling::{PeerId, SessionDescription};

/// An offer that was set locally and now waits for its answer.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOffer {
    pub offer: SessionDescription,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct Negotiator {
    local_id: Option<PeerId>,
}

impl Negotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local_id(&mut self, id: PeerId) {
        self.local_id = Some(id);
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    /// Whether we give way when our offer collides with `remote`'s.
    /// Until the relay has told us our id we always give way.
    pub fn is_polite(&self, remote: &str) -> bool {
        match &self.local_id {
            Some(local) => local.as_str() > remote,
            None => true,
        }
    }

    /// Starts the first exchange on an idle link. Returns `None` when the
    /// link is already negotiating or connected.
    pub async fn initiate(
        &self,
        link: &PeerLink,
        tracks: &[LocalTrack],
    ) -> Result<Option<PendingOffer>> {
        let phase = link.phase().await;
        if phase != NegotiationPhase::Idle {
            debug!("Not calling {}: link is {}", link.peer_id(), phase);
            return Ok(None);
        }
        attach_all(link, tracks).await?;
        self.make_offer(link).await.map(Some)
    }

    /// Handles a negotiation-needed signal. Only a `Stable` link produces a
    /// new offer; anything else already has an exchange in flight.
    pub async fn renegotiate(&self, link: &PeerLink) -> Result<Option<PendingOffer>> {
        let phase = link.phase().await;
        if phase != NegotiationPhase::Stable {
            debug!(
                "Dropping negotiation-needed for {}: link is {}",
                link.peer_id(),
                phase
            );
            return Ok(None);
        }
        self.make_offer(link).await.map(Some)
    }

    async fn make_offer(&self, link: &PeerLink) -> Result<PendingOffer> {
        let offer = link.connection().create_offer().await?;
        link.connection()
            .set_local_description(offer.clone())
            .await?;
        let generation = link.begin_offer().await;
        Ok(PendingOffer { offer, generation })
    }

    /// Answers a remote offer. Returns `None` when the offer lost a collision
    /// with our own and was ignored.
    pub async fn accept_offer(
        &self,
        link: &PeerLink,
        offer: SessionDescription,
        tracks: &[LocalTrack],
    ) -> Result<Option<SessionDescription>> {
        if link.phase().await == NegotiationPhase::OfferSent {
            if !self.is_polite(link.peer_id()) {
                info!("Offer collision with {}: keeping our offer", link.peer_id());
                return Ok(None);
            }
            info!("Offer collision with {}: rolling back our offer", link.peer_id());
            link.connection()
                .set_local_description(SessionDescription::rollback())
                .await?;
        }

        link.set_phase(NegotiationPhase::OfferReceived).await;
        match answer(link, offer, tracks).await {
            Ok(ans) => {
                link.set_phase(NegotiationPhase::Stable).await;
                Ok(Some(ans))
            }
            Err(e) => {
                warn!("Answering {} failed: {}", link.peer_id(), e);
                let fallback = if link.has_remote_description().await {
                    NegotiationPhase::Stable
                } else {
                    NegotiationPhase::Idle
                };
                link.set_phase(fallback).await;
                Err(e)
            }
        }
    }

    /// Applies the answer to our outstanding offer.
    pub async fn accept_answer(
        &self,
        link: &PeerLink,
        answer: SessionDescription,
        event: &'static str,
    ) -> Result<()> {
        let phase = link.phase().await;
        if phase != NegotiationPhase::OfferSent {
            return Err(Error::UnexpectedSignal {
                event,
                peer_id: link.peer_id().to_string(),
                phase,
            });
        }
        link.apply_remote_description(answer).await?;
        link.set_phase(NegotiationPhase::Stable).await;
        Ok(())
    }
}

async fn answer(
    link: &PeerLink,
    offer: SessionDescription,
    tracks: &[LocalTrack],
) -> Result<SessionDescription> {
    link.apply_remote_description(offer).await?;
    attach_all(link, tracks).await?;
    let ans = link.connection().create_answer().await?;
    link.connection().set_local_description(ans.clone()).await?;
    Ok(ans)
}

async fn attach_all(link: &PeerLink, tracks: &[LocalTrack]) -> Result<()> {
    for track in tracks {
        link.attach_track(track).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::connection::LinkEventKind;
    use crate::peer::test_support::{audio_track, open_link, video_track};
    use crate::signaling::SdpType;

    fn negotiator(id: &str) -> Negotiator {
        let mut n = Negotiator::new();
        n.set_local_id(id.to_string());
        n
    }

    #[tokio::test]
    async fn test_caller_path_reaches_stable() {
        let (caller, caller_conn, _f1) = open_link("b").await;
        let (callee, _callee_conn, _f2) = open_link("a").await;
        let tracks = vec![audio_track("mic")];

        let pending = negotiator("a")
            .initiate(&caller, &tracks)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.offer.sdp_type, SdpType::Offer);
        assert_eq!(pending.generation, 1);
        assert_eq!(caller.phase().await, NegotiationPhase::OfferSent);
        assert_eq!(caller_conn.record().await.senders, vec!["mic".to_string()]);

        let ans = negotiator("b")
            .accept_offer(&callee, pending.offer, &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(callee.phase().await, NegotiationPhase::Stable);

        negotiator("a")
            .accept_answer(&caller, ans, "call:accepted")
            .await
            .unwrap();
        assert_eq!(caller.phase().await, NegotiationPhase::Stable);
        assert!(caller.has_remote_description().await);
    }

    #[tokio::test]
    async fn test_initiate_twice_sends_one_offer() {
        let (link, conn, _f) = open_link("b").await;
        let n = negotiator("a");
        assert!(n.initiate(&link, &[]).await.unwrap().is_some());
        assert!(n.initiate(&link, &[]).await.unwrap().is_none());
        assert_eq!(conn.record().await.offers_created, 1);
    }

    #[tokio::test]
    async fn test_negotiation_needed_ignored_unless_stable() {
        let (link, conn, _f) = open_link("b").await;
        let n = negotiator("a");

        assert!(n.renegotiate(&link).await.unwrap().is_none());

        n.initiate(&link, &[]).await.unwrap();
        assert!(n.renegotiate(&link).await.unwrap().is_none());
        assert!(n.renegotiate(&link).await.unwrap().is_none());
        assert_eq!(conn.record().await.offers_created, 1);
        assert_eq!(link.generation().await, 1);
    }

    #[tokio::test]
    async fn test_renegotiate_from_stable() {
        let (link, conn, _f) = open_link("b").await;
        let n = negotiator("a");
        let remote_offer = SessionDescription::offer("v=0\r\n");
        n.accept_offer(&link, remote_offer, &[]).await.unwrap();
        assert_eq!(link.phase().await, NegotiationPhase::Stable);

        let pending = n.renegotiate(&link).await.unwrap().unwrap();
        assert_eq!(pending.generation, 1);
        assert_eq!(link.phase().await, NegotiationPhase::OfferSent);
        assert_eq!(conn.record().await.offers_created, 1);
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_rejected() {
        let (link, _conn, _f) = open_link("b").await;
        let err = negotiator("a")
            .accept_answer(&link, SessionDescription::answer("v=0\r\n"), "peer:nego:final")
            .await
            .unwrap_err();
        match err {
            Error::UnexpectedSignal { event, peer_id, phase } => {
                assert_eq!(event, "peer:nego:final");
                assert_eq!(peer_id, "b");
                assert_eq!(phase, NegotiationPhase::Idle);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_glare_lower_id_keeps_offer() {
        let (link, conn, _f) = open_link("b").await;
        let n = negotiator("a");
        n.initiate(&link, &[]).await.unwrap();

        let result = n
            .accept_offer(&link, SessionDescription::offer("v=0\r\n"), &[])
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(link.phase().await, NegotiationPhase::OfferSent);
        assert_eq!(conn.record().await.rollbacks, 0);
    }

    #[tokio::test]
    async fn test_glare_higher_id_rolls_back_and_answers() {
        let (link, conn, _f) = open_link("a").await;
        let n = negotiator("b");
        n.initiate(&link, &[]).await.unwrap();

        let ans = n
            .accept_offer(&link, SessionDescription::offer("v=0\r\n"), &[])
            .await
            .unwrap();
        assert!(ans.is_some());
        assert_eq!(link.phase().await, NegotiationPhase::Stable);
        let record = conn.record().await;
        assert_eq!(record.rollbacks, 1);
        assert_eq!(record.answers_created, 1);
    }

    #[tokio::test]
    async fn test_callee_attaches_tracks_into_answer() {
        let (link, conn, _f) = open_link("a").await;
        let tracks = vec![audio_track("mic"), video_track("cam")];
        let ans = negotiator("b")
            .accept_offer(&link, SessionDescription::offer("v=0\r\n"), &tracks)
            .await
            .unwrap()
            .unwrap();
        assert!(ans.sdp.contains("a=msid:local-stream mic"));
        assert!(ans.sdp.contains("a=msid:local-stream cam"));
        assert_eq!(conn.record().await.senders.len(), 2);
    }

    #[tokio::test]
    async fn test_offer_surfaces_remote_tracks() {
        let (link, _conn, mut events) = open_link("a").await;
        let offer = SessionDescription::offer(
            "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:remote-stream cam\r\n",
        );
        negotiator("b").accept_offer(&link, offer, &[]).await.unwrap();

        let mut tracks = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let LinkEventKind::Track(track) = event.kind {
                tracks.push(track);
            }
        }
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, "cam");
        assert_eq!(tracks[0].stream_id, "remote-stream");
    }
}
