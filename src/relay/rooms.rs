use std::collections::HashMap;

use crate::signaling::PeerId;

/// A connected participant as the relay sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: PeerId,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct Room {
    pub name: String,
    pub members: Vec<Participant>,
}

impl Room {
    pub fn new(name: String) -> Self {
        Self {
            name,
            members: Vec::new(),
        }
    }

    pub fn member_ids(&self) -> Vec<PeerId> {
        self.members.iter().map(|p| p.id.clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.iter().any(|p| p.id == id)
    }

    fn remove_member(&mut self, id: &str) {
        self.members.retain(|p| p.id != id);
    }
}

/// Result of a join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The room already holds `max_room_size` members; nothing changed.
    Full,
    /// The participant was already a member of this room.
    AlreadyMember,
    Joined {
        /// Members present before the join, in join order.
        existing: Vec<PeerId>,
        /// The room the participant had to leave first, with its remaining members.
        left: Option<Departure>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room: String,
    pub remaining: Vec<PeerId>,
}

/// Room membership for the whole relay.
///
/// Rooms are created on first join and dropped as soon as they are empty.
/// A participant is a member of at most one room.
#[derive(Debug)]
pub struct RoomTable {
    rooms: HashMap<String, Room>,
    membership: HashMap<PeerId, String>,
    max_room_size: usize,
}

impl RoomTable {
    pub fn new(max_room_size: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            membership: HashMap::new(),
            max_room_size,
        }
    }

    /// Capacity check and insertion in one step.
    pub fn join(&mut self, participant: Participant, room: &str) -> JoinOutcome {
        if self.membership.get(&participant.id).map(String::as_str) == Some(room) {
            return JoinOutcome::AlreadyMember;
        }

        if let Some(target) = self.rooms.get(room) {
            if target.members.len() >= self.max_room_size {
                return JoinOutcome::Full;
            }
        }

        let left = self.leave(&participant.id);

        let target = self
            .rooms
            .entry(room.to_string())
            .or_insert_with(|| Room::new(room.to_string()));
        let existing = target.member_ids();
        self.membership
            .insert(participant.id.clone(), room.to_string());
        target.members.push(participant);

        JoinOutcome::Joined { existing, left }
    }

    /// Removes the participant from its room, dropping the room if it empties.
    pub fn leave(&mut self, id: &str) -> Option<Departure> {
        let room_name = self.membership.remove(id)?;
        let room = self.rooms.get_mut(&room_name)?;
        room.remove_member(id);
        let remaining = room.member_ids();
        if remaining.is_empty() {
            self.rooms.remove(&room_name);
        }
        Some(Departure {
            room: room_name,
            remaining,
        })
    }

    pub fn room_of(&self, id: &str) -> Option<&str> {
        self.membership.get(id).map(String::as_str)
    }

    pub fn room(&self, name: &str) -> Option<&Room> {
        self.rooms.get(name)
    }

    /// Everyone in `id`'s room except `id` itself.
    pub fn others(&self, id: &str) -> Vec<PeerId> {
        self.room_of(id)
            .and_then(|name| self.rooms.get(name))
            .map(|room| {
                room.members
                    .iter()
                    .filter(|p| p.id != id)
                    .map(|p| p.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn share_room(&self, a: &str, b: &str) -> bool {
        match (self.room_of(a), self.room_of(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
