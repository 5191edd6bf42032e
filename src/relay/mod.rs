//! Room membership relay.
//!
//! The relay assigns every connection an id, keeps track of which room each
//! id is in, and forwards named events. It never looks inside offers,
//! answers or candidates.

pub mod rooms;
pub mod server;

use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::signaling::{ClientMessage, JoinRequest, PeerId, ServerMessage};
use rooms::{Departure, JoinOutcome, Participant, RoomTable};

pub use server::RelayServer;

/// Outbound queue of one connected client.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Fresh, unguessable participant id: 128 random bits as hex.
pub fn new_peer_id() -> PeerId {
    format!("{:032x}", rand::random::<u128>())
}

pub struct Relay {
    rooms: Mutex<RoomTable>,
    outboxes: RwLock<HashMap<PeerId, Outbox>>,
}

impl Relay {
    pub fn new(max_room_size: usize) -> Self {
        Self {
            rooms: Mutex::new(RoomTable::new(max_room_size)),
            outboxes: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a new connection and tells it its id.
    pub async fn connect(&self, outbox: Outbox) -> PeerId {
        let id = new_peer_id();
        let _ = outbox.send(ServerMessage::Ready { id: id.clone() });
        self.outboxes.write().await.insert(id.clone(), outbox);
        info!("Participant connected: {}", id);
        id
    }

    /// Drops the connection, notifying whoever is left in its room.
    pub async fn disconnect(&self, id: &str) {
        self.outboxes.write().await.remove(id);
        let departure = self.rooms.lock().await.leave(id);
        if let Some(departure) = departure {
            self.announce_departure(id, &departure).await;
        }
        info!("Participant disconnected: {}", id);
    }

    /// Routes one event received from `from`.
    pub async fn handle(&self, from: &str, msg: ClientMessage) {
        debug!("{} -> {}", from, msg.event_name());
        match msg {
            ClientMessage::JoinRoom(request) => self.join(from, request).await,
            ClientMessage::ToggleAudio { room, is_muted } => {
                self.broadcast_toggle(from, &room, ServerMessage::ToggledAudio {
                    id: from.to_string(),
                    is_muted,
                })
                .await
            }
            ClientMessage::ToggleVideo { room, is_video_off } => {
                self.broadcast_toggle(from, &room, ServerMessage::ToggledVideo {
                    id: from.to_string(),
                    is_video_off,
                })
                .await
            }
            directed => self.forward(from, directed).await,
        }
    }

    async fn join(&self, from: &str, request: JoinRequest) {
        let participant = Participant {
            id: from.to_string(),
            name: request.name.clone(),
            email: request.email.clone(),
        };
        let outcome = self.rooms.lock().await.join(participant, &request.room);

        match outcome {
            JoinOutcome::Full => {
                info!("Room {} is full, rejecting {}", request.room, from);
                self.deliver(from, ServerMessage::RoomFull { room: request.room })
                    .await;
            }
            JoinOutcome::AlreadyMember => {
                self.deliver(from, ServerMessage::Joined(request)).await;
            }
            JoinOutcome::Joined { existing, left } => {
                if let Some(departure) = left {
                    self.announce_departure(from, &departure).await;
                }
                info!(
                    "{} joined room {} ({} already present)",
                    from,
                    request.room,
                    existing.len()
                );
                let joined = ServerMessage::UserJoined {
                    email: request.email.clone(),
                    id: from.to_string(),
                    name: request.name.clone(),
                };
                self.broadcast(&existing, joined).await;
                self.deliver(from, ServerMessage::Joined(request)).await;
            }
        }
    }

    async fn broadcast_toggle(&self, from: &str, room: &str, msg: ServerMessage) {
        let recipients = {
            let rooms = self.rooms.lock().await;
            match rooms.room_of(from) {
                Some(actual) if actual == room => rooms.others(from),
                Some(actual) => {
                    warn!(
                        "{} toggled media for room {} but is in {}, dropping",
                        from, room, actual
                    );
                    return;
                }
                None => {
                    debug!("{} toggled media outside any room, dropping", from);
                    return;
                }
            }
        };
        self.broadcast(&recipients, msg).await;
    }

    async fn forward(&self, from: &str, msg: ClientMessage) {
        let Some(to) = msg.recipient().map(str::to_owned) else {
            return;
        };
        if !self.rooms.lock().await.share_room(from, &to) {
            debug!(
                "Dropping {} from {} to {}: not in the same room",
                msg.event_name(),
                from,
                to
            );
            return;
        }

        let from = from.to_string();
        let delivered = match msg {
            ClientMessage::Welcome { email, name, .. } => {
                ServerMessage::Welcome { from, email, name }
            }
            ClientMessage::Call { offer, name, .. } => {
                ServerMessage::IncomingCall { from, offer, name }
            }
            ClientMessage::CallAccepted { ans, name, .. } => {
                ServerMessage::CallAccepted { from, ans, name }
            }
            ClientMessage::NegoNeeded { offer, .. } => ServerMessage::NegoNeeded { from, offer },
            ClientMessage::NegoDone { ans, .. } => ServerMessage::NegoFinal { from, ans },
            ClientMessage::IceCandidate { candidate, .. } => {
                ServerMessage::IceCandidate { from, candidate }
            }
            ClientMessage::CallEnded { .. } => ServerMessage::CallEnded { from },
            ClientMessage::JoinRoom(_)
            | ClientMessage::ToggleAudio { .. }
            | ClientMessage::ToggleVideo { .. } => return,
        };
        self.deliver(&to, delivered).await;
    }

    async fn announce_departure(&self, id: &str, departure: &Departure) {
        debug!("{} left room {}", id, departure.room);
        self.broadcast(
            &departure.remaining,
            ServerMessage::UserLeft { id: id.to_string() },
        )
        .await;
    }

    async fn deliver(&self, to: &str, msg: ServerMessage) {
        let outboxes = self.outboxes.read().await;
        match outboxes.get(to) {
            Some(outbox) => {
                if outbox.send(msg).is_err() {
                    debug!("Outbox for {} is closed", to);
                }
            }
            None => debug!("Dropping {} for unknown participant {}", msg.event_name(), to),
        }
    }

    async fn broadcast(&self, recipients: &[PeerId], msg: ServerMessage) {
        let outboxes = self.outboxes.read().await;
        for id in recipients {
            if let Some(outbox) = outboxes.get(id) {
                let _ = outbox.send(msg.clone());
            }
        }
    }

    pub async fn room_members(&self, room: &str) -> Vec<PeerId> {
        self.rooms
            .lock()
            .await
            .room(room)
            .map(|r| r.member_ids())
            .unwrap_or_default()
    }
}
