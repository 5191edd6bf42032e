//! Client side of a call.
//!
//! A [`SessionCoordinator`] owns every [`PeerLink`] of the local participant
//! and reacts to three inputs: frames from the relay, callbacks from the
//! native connections, and commands from the application. All of them are
//! processed one at a time on a single task, so two negotiation steps for the
//! same link never interleave.

pub mod state;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::peer::{
    ConnectionFactory, ConnectionRegistry, ConnectionState, LinkEvent, LinkEventKind, LocalTrack,
    NegotiationPhase, Negotiator, PeerLink, PendingOffer, RemoteTrack,
};
use crate::signaling::{ClientMessage, JoinRequest, PeerId, ServerMessage, SessionDescription};

pub use state::{CallMonitor, CallState, ParticipantState};

/// Requests from the application to the session loop.
pub enum SessionCommand {
    JoinRoom {
        room: String,
        name: String,
        email: String,
    },
    ToggleAudio,
    ToggleVideo,
    /// Publish a local track to every current and future peer.
    AddTrack(LocalTrack),
    /// Stop publishing the track with this id.
    RemoveTrack(String),
    EndCall,
}

impl fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionCommand::JoinRoom { room, name, email } => f
                .debug_struct("JoinRoom")
                .field("room", room)
                .field("name", name)
                .field("email", email)
                .finish(),
            SessionCommand::ToggleAudio => write!(f, "ToggleAudio"),
            SessionCommand::ToggleVideo => write!(f, "ToggleVideo"),
            SessionCommand::AddTrack(track) => f.debug_tuple("AddTrack").field(&track.id()).finish(),
            SessionCommand::RemoveTrack(id) => f.debug_tuple("RemoveTrack").field(id).finish(),
            SessionCommand::EndCall => write!(f, "EndCall"),
        }
    }
}

/// Discrete notifications; continuous state lives in [`CallState`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Joined { room: String },
    RoomFull { room: String },
    RemoteTrack { peer_id: PeerId, track: RemoteTrack },
    PeerConnectionState { peer_id: PeerId, state: ConnectionState },
    NegotiationFailed { peer_id: PeerId },
    CallEnded,
}

#[derive(Debug)]
struct Deadline {
    peer_id: PeerId,
    generation: u64,
}

pub struct SessionCoordinator {
    negotiator: Negotiator,
    registry: ConnectionRegistry,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    signaling: mpsc::Sender<ClientMessage>,
    events: mpsc::UnboundedSender<SessionEvent>,
    monitor: CallMonitor,
    local_tracks: Vec<LocalTrack>,
    negotiation_timeout: Duration,
    deadline_tx: mpsc::UnboundedSender<Deadline>,
    deadline_rx: mpsc::UnboundedReceiver<Deadline>,
}

impl SessionCoordinator {
    /// `signaling` carries outgoing frames to the relay. The returned
    /// receiver yields [`SessionEvent`]s for as long as the coordinator lives.
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        signaling: mpsc::Sender<ClientMessage>,
        negotiation_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (deadline_tx, deadline_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            negotiator: Negotiator::new(),
            registry: ConnectionRegistry::new(factory, link_tx),
            link_rx,
            signaling,
            events,
            monitor: CallMonitor::new(),
            local_tracks: Vec::new(),
            negotiation_timeout,
            deadline_tx,
            deadline_rx,
        };
        (coordinator, events_rx)
    }

    pub fn monitor(&self) -> CallMonitor {
        self.monitor.clone()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Runs until `EndCall` or until the relay stream closes. Every link is
    /// closed on the way out.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<ServerMessage>,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) {
        let mut commands_open = true;

        loop {
            tokio::select! {
                msg = inbound.recv() => {
                    let Some(msg) = msg else {
                        info!("Relay stream closed");
                        break;
                    };
                    let event = msg.event_name();
                    if let Err(e) = self.handle_server_message(msg).await {
                        warn!("Failed to handle {}: {}", event, e);
                    }
                }
                Some(event) = self.link_rx.recv() => {
                    if let Err(e) = self.handle_link_event(event).await {
                        warn!("Failed to handle link event: {}", e);
                    }
                }
                Some(deadline) = self.deadline_rx.recv() => {
                    self.expire_negotiation(&deadline.peer_id, deadline.generation).await;
                }
                cmd = commands.recv(), if commands_open => {
                    let Some(cmd) = cmd else {
                        commands_open = false;
                        continue;
                    };
                    let end = matches!(cmd, SessionCommand::EndCall);
                    if let Err(e) = self.handle_command(cmd).await {
                        warn!("Command failed: {}", e);
                    }
                    if end {
                        break;
                    }
                }
            }
        }

        self.registry.close_all().await;
        self.monitor.update(|s| s.participants.clear());
        info!("Session loop stopped");
    }

    pub async fn handle_server_message(&mut self, msg: ServerMessage) -> Result<()> {
        debug!("<- {}", msg.event_name());
        match msg {
            ServerMessage::Ready { id } => {
                info!("Relay assigned id {}", id);
                self.negotiator.set_local_id(id.clone());
                self.monitor.update(|s| s.local_id = Some(id));
            }
            ServerMessage::Joined(JoinRequest { email, room, name }) => {
                info!("Joined room {}", room);
                let joined = room.clone();
                self.monitor.update(|s| {
                    s.room = Some(joined);
                    s.name = name;
                    s.email = email;
                });
                self.emit(SessionEvent::Joined { room });
            }
            ServerMessage::RoomFull { room } => {
                warn!("Room {} is full", room);
                self.emit(SessionEvent::RoomFull { room });
            }
            ServerMessage::UserJoined { email, id, name } => {
                if self.negotiator.local_id() == Some(id.as_str()) {
                    return Ok(());
                }
                info!("{} joined ({})", id, email);
                self.record_participant(&id, Some(name), Some(email));
                self.call(&id).await?;
            }
            ServerMessage::Welcome { from, email, name } => {
                self.record_participant(&from, Some(name), Some(email));
            }
            ServerMessage::IncomingCall { from, offer, name } => {
                let known = self.monitor.snapshot().participants.contains_key(&from);
                self.record_participant(&from, Some(name), None);
                if !known {
                    let (email, name) = self.identity();
                    self.send(ClientMessage::Welcome {
                        to: from.clone(),
                        email,
                        name,
                    })
                    .await?;
                }
                if let Some(ans) = self.answer_offer(&from, offer).await? {
                    let (_, name) = self.identity();
                    self.send(ClientMessage::CallAccepted { to: from, ans, name })
                        .await?;
                }
            }
            ServerMessage::CallAccepted { from, ans, .. } => {
                let link = self.expect_link(&from, "call:accepted").await?;
                self.negotiator
                    .accept_answer(&link, ans, "call:accepted")
                    .await?;
                info!("Call with {} established", from);
            }
            ServerMessage::NegoNeeded { from, offer } => {
                if self.live_link(&from).await?.is_none() {
                    debug!("Dropping peer:nego:needed from departed peer {}", from);
                    return Ok(());
                }
                if let Some(ans) = self.answer_offer(&from, offer).await? {
                    self.send(ClientMessage::NegoDone { to: from, ans }).await?;
                }
            }
            ServerMessage::NegoFinal { from, ans } => {
                let link = self.expect_link(&from, "peer:nego:final").await?;
                self.negotiator
                    .accept_answer(&link, ans, "peer:nego:final")
                    .await?;
                debug!("Renegotiation with {} complete", from);
            }
            ServerMessage::IceCandidate { from, candidate } => {
                // May precede the offer; the link queues it until then.
                match self.live_link(&from).await? {
                    Some(link) => link.enqueue_or_apply(candidate).await,
                    None => debug!("Dropping candidate from departed peer {}", from),
                }
            }
            ServerMessage::ToggledAudio { id, is_muted } => {
                if !self
                    .monitor
                    .update_participant(&id, |p| p.is_muted = is_muted)
                {
                    return Err(Error::PeerNotFound(id));
                }
            }
            ServerMessage::ToggledVideo { id, is_video_off } => {
                if !self
                    .monitor
                    .update_participant(&id, |p| p.is_video_off = is_video_off)
                {
                    return Err(Error::PeerNotFound(id));
                }
            }
            ServerMessage::CallEnded { from } => {
                info!("{} ended the call", from);
                self.remove_peer(&from).await;
            }
            ServerMessage::UserLeft { id } => {
                info!("{} left", id);
                self.remove_peer(&id).await;
            }
        }
        Ok(())
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) -> Result<()> {
        let LinkEvent { peer_id, kind } = event;
        match kind {
            LinkEventKind::IceCandidate(candidate) => {
                if self.registry.get(&peer_id).await.is_none() {
                    debug!("Dropping local candidate for closed link {}", peer_id);
                    return Ok(());
                }
                self.send(ClientMessage::IceCandidate {
                    to: peer_id,
                    candidate,
                })
                .await?;
            }
            LinkEventKind::NegotiationNeeded => {
                let Some(link) = self.registry.get(&peer_id).await else {
                    return Ok(());
                };
                if let Some(pending) = self.negotiator.renegotiate(&link).await? {
                    self.arm_deadline(&peer_id, pending.generation);
                    self.send(ClientMessage::NegoNeeded {
                        to: peer_id,
                        offer: pending.offer,
                    })
                    .await?;
                }
            }
            LinkEventKind::Track(track) => {
                info!("Track {} ({:?}) from {}", track.id, track.kind, peer_id);
                let id = track.id.clone();
                self.monitor.update_participant(&peer_id, |p| {
                    if !p.remote_tracks.contains(&id) {
                        p.remote_tracks.push(id);
                    }
                });
                self.emit(SessionEvent::RemoteTrack { peer_id, track });
            }
            LinkEventKind::StateChanged(state) => {
                if self.registry.get(&peer_id).await.is_none() {
                    debug!("Link {} is gone, ignoring state {}", peer_id, state);
                    return Ok(());
                }
                self.monitor
                    .update_participant(&peer_id, |p| p.connection = state);
                self.emit(SessionEvent::PeerConnectionState { peer_id, state });
            }
        }
        Ok(())
    }

    pub async fn handle_command(&mut self, cmd: SessionCommand) -> Result<()> {
        debug!("Command {:?}", cmd);
        match cmd {
            SessionCommand::JoinRoom { room, name, email } => {
                let (n, e) = (name.clone(), email.clone());
                self.monitor.update(|s| {
                    s.name = n;
                    s.email = e;
                });
                self.send(ClientMessage::JoinRoom(JoinRequest { email, room, name }))
                    .await?;
            }
            SessionCommand::ToggleAudio => {
                let mut muted = false;
                self.monitor.update(|s| {
                    s.is_muted = !s.is_muted;
                    muted = s.is_muted;
                });
                if let Some(room) = self.monitor.snapshot().room {
                    self.send(ClientMessage::ToggleAudio {
                        room,
                        is_muted: muted,
                    })
                    .await?;
                }
            }
            SessionCommand::ToggleVideo => {
                let mut off = false;
                self.monitor.update(|s| {
                    s.is_video_off = !s.is_video_off;
                    off = s.is_video_off;
                });
                if let Some(room) = self.monitor.snapshot().room {
                    self.send(ClientMessage::ToggleVideo {
                        room,
                        is_video_off: off,
                    })
                    .await?;
                }
            }
            SessionCommand::AddTrack(track) => {
                if self.local_tracks.iter().any(|t| t.id() == track.id()) {
                    debug!("Track {} already published", track.id());
                    return Ok(());
                }
                self.local_tracks.push(Arc::clone(&track));
                // Idle links pick the track up when they negotiate.
                for link in self.registry.links().await {
                    if link.phase().await != NegotiationPhase::Idle {
                        link.attach_track(&track).await?;
                    }
                }
            }
            SessionCommand::RemoveTrack(track_id) => {
                self.local_tracks.retain(|t| t.id() != track_id);
                for link in self.registry.links().await {
                    link.detach_track(&track_id).await?;
                }
            }
            SessionCommand::EndCall => self.end_call().await,
        }
        Ok(())
    }

    /// Tells every peer the call is over and drops all links and local media.
    pub async fn end_call(&mut self) {
        for peer_id in self.registry.peer_ids().await {
            if let Err(e) = self.send(ClientMessage::CallEnded { to: peer_id }).await {
                warn!("Could not announce call end: {}", e);
                break;
            }
        }
        self.local_tracks.clear();
        self.registry.close_all().await;
        self.monitor.update(|s| s.participants.clear());
        self.emit(SessionEvent::CallEnded);
        info!("Call ended");
    }

    /// Gives up on an offer that was never answered. Deadlines that belong
    /// to an older offer, or to a link that moved on, are ignored.
    pub async fn expire_negotiation(&mut self, peer_id: &str, generation: u64) {
        let Some(link) = self.registry.get(peer_id).await else {
            return;
        };
        if link.phase().await != NegotiationPhase::OfferSent
            || link.generation().await != generation
        {
            debug!("Stale negotiation deadline for {}", peer_id);
            return;
        }

        warn!(
            "Negotiation with {} timed out after {:?}",
            peer_id, self.negotiation_timeout
        );
        self.registry.close(peer_id).await;
        self.monitor
            .update_participant(peer_id, |p| p.connection = ConnectionState::Failed);
        self.emit(SessionEvent::NegotiationFailed {
            peer_id: peer_id.to_string(),
        });
    }

    /// Handles every link event that is already waiting. Returns how many
    /// were processed.
    pub async fn process_pending_link_events(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(event) = self.link_rx.try_recv() {
            if let Err(e) = self.handle_link_event(event).await {
                warn!("Failed to handle link event: {}", e);
            }
            processed += 1;
        }
        processed
    }

    async fn call(&mut self, peer_id: &str) -> Result<()> {
        let link = self.registry.open(peer_id).await?;
        let Some(PendingOffer { offer, generation }) =
            self.negotiator.initiate(&link, &self.local_tracks).await?
        else {
            return Ok(());
        };
        self.arm_deadline(peer_id, generation);
        let (_, name) = self.identity();
        self.send(ClientMessage::Call {
            to: peer_id.to_string(),
            offer,
            name,
        })
        .await
    }

    async fn answer_offer(
        &mut self,
        peer_id: &str,
        offer: SessionDescription,
    ) -> Result<Option<SessionDescription>> {
        let link = self.registry.open(peer_id).await?;
        self.negotiator
            .accept_offer(&link, offer, &self.local_tracks)
            .await
    }

    /// The link to `peer_id`, opened on demand while the peer is still a
    /// participant. `None` once the peer has left or the call has ended.
    async fn live_link(&self, peer_id: &str) -> Result<Option<Arc<PeerLink>>> {
        if let Some(link) = self.registry.get(peer_id).await {
            return Ok(Some(link));
        }
        if self.monitor.snapshot().participants.contains_key(peer_id) {
            return self.registry.open(peer_id).await.map(Some);
        }
        Ok(None)
    }

    async fn expect_link(&self, peer_id: &str, event: &'static str) -> Result<Arc<PeerLink>> {
        self.registry
            .get(peer_id)
            .await
            .ok_or_else(|| Error::UnexpectedSignal {
                event,
                peer_id: peer_id.to_string(),
                phase: NegotiationPhase::Idle,
            })
    }

    async fn remove_peer(&mut self, peer_id: &str) {
        self.registry.close(peer_id).await;
        self.monitor.update(|s| {
            s.participants.remove(peer_id);
        });
    }

    fn record_participant(&self, id: &str, name: Option<String>, email: Option<String>) {
        self.monitor.update(|s| {
            let participant = s
                .participants
                .entry(id.to_string())
                .or_insert_with(|| ParticipantState::new(id));
            if let Some(name) = name.filter(|n| !n.is_empty()) {
                participant.name = name;
            }
            if let Some(email) = email.filter(|e| !e.is_empty()) {
                participant.email = email;
            }
        });
    }

    fn identity(&self) -> (String, String) {
        let state = self.monitor.snapshot();
        (state.email, state.name)
    }

    fn arm_deadline(&self, peer_id: &str, generation: u64) {
        let tx = self.deadline_tx.clone();
        let peer_id = peer_id.to_string();
        let timeout = self.negotiation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Deadline {
                peer_id,
                generation,
            });
        });
    }

    async fn send(&self, msg: ClientMessage) -> Result<()> {
        debug!("-> {}", msg.event_name());
        self.signaling
            .send(msg)
            .await
            .map_err(|_| Error::Signaling("relay connection closed".to_string()))
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
