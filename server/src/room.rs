//! Race room lifecycle and membership
//!
//! A room moves Waiting -> Racing -> Finished, never backwards; Finished is
//! terminal and the room is garbage-collected once its last member leaves.
//! The room owns only member ids: player state stays in the session
//! registry, and the network layer resolves fan-out through `members()`.

use log::info;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Waiting,
    Racing,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    Full,
    AlreadyMember,
    InvalidTransition(RoomStatus),
}

impl fmt::Display for RoomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomError::Full => write!(f, "room is at capacity"),
            RoomError::AlreadyMember => write!(f, "player already in room"),
            RoomError::InvalidTransition(status) => {
                write!(f, "invalid transition from {:?}", status)
            }
        }
    }
}

impl std::error::Error for RoomError {}

#[derive(Debug)]
pub struct Room {
    pub id: u32,
    pub name: String,
    members: Vec<u32>,
    pub capacity: usize,
    pub status: RoomStatus,
    pub created_at: u64,
}

impl Room {
    pub fn new(id: u32, name: String, capacity: usize, created_at: u64) -> Self {
        Self {
            id,
            name,
            members: Vec::new(),
            capacity,
            status: RoomStatus::Waiting,
            created_at,
        }
    }

    /// Adds a member while waiting. Joining a full room or joining twice is
    /// rejected at the boundary, never partially applied.
    pub fn add_member(&mut self, player_id: u32) -> Result<(), RoomError> {
        if self.status != RoomStatus::Waiting {
            return Err(RoomError::InvalidTransition(self.status));
        }
        if self.members.len() >= self.capacity {
            return Err(RoomError::Full);
        }
        if self.members.contains(&player_id) {
            return Err(RoomError::AlreadyMember);
        }
        self.members.push(player_id);
        Ok(())
    }

    /// Removes a member in any state; a disconnect never blocks the race for
    /// the rest. Returns whether the player was present.
    pub fn remove_member(&mut self, player_id: u32) -> bool {
        let before = self.members.len();
        self.members.retain(|&id| id != player_id);
        self.members.len() != before
    }

    pub fn members(&self) -> &[u32] {
        &self.members
    }

    pub fn contains(&self, player_id: u32) -> bool {
        self.members.contains(&player_id)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_racing(&self) -> bool {
        self.status == RoomStatus::Racing
    }

    pub fn start(&mut self) -> Result<(), RoomError> {
        if self.status != RoomStatus::Waiting {
            return Err(RoomError::InvalidTransition(self.status));
        }
        self.status = RoomStatus::Racing;
        info!("Room {} ({}) started racing", self.id, self.name);
        Ok(())
    }

    pub fn finish(&mut self) -> Result<(), RoomError> {
        if self.status != RoomStatus::Racing {
            return Err(RoomError::InvalidTransition(self.status));
        }
        self.status = RoomStatus::Finished;
        info!("Room {} ({}) finished", self.id, self.name);
        Ok(())
    }
}

/// All live rooms, indexed by id.
pub struct RoomManager {
    rooms: HashMap<u32, Room>,
    next_room_id: u32,
    created_total: u32,
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: HashMap::new(),
            next_room_id: 1,
            created_total: 0,
        }
    }

    /// Creates a waiting room and fills it with the paired players. The
    /// capacity is fixed for the room's lifetime.
    pub fn create(&mut self, member_ids: &[u32], capacity: usize, now_ms: u64) -> u32 {
        let room_id = self.next_room_id;
        self.next_room_id += 1;
        self.created_total += 1;

        let mut room = Room::new(
            room_id,
            format!("Race #{}", self.created_total),
            capacity,
            now_ms,
        );
        for &player_id in member_ids.iter().take(capacity) {
            // Ids come from the matchmaking pool, which never double-allocates.
            let _ = room.add_member(player_id);
        }

        info!(
            "Room {} ({}) created with {:?}",
            room.id, room.name, room.members
        );
        self.rooms.insert(room_id, room);
        room_id
    }

    pub fn get(&self, room_id: u32) -> Option<&Room> {
        self.rooms.get(&room_id)
    }

    pub fn get_mut(&mut self, room_id: u32) -> Option<&mut Room> {
        self.rooms.get_mut(&room_id)
    }

    /// Removes `player_id` from its room. A room left empty is destroyed;
    /// otherwise the remaining member ids are returned for notification.
    pub fn remove_member(&mut self, room_id: u32, player_id: u32) -> Option<Vec<u32>> {
        let room = self.rooms.get_mut(&room_id)?;
        if !room.remove_member(player_id) {
            return None;
        }

        if room.is_empty() {
            info!("Room {} empty, destroying", room_id);
            self.rooms.remove(&room_id);
            Some(Vec::new())
        } else {
            Some(room.members().to_vec())
        }
    }

    pub fn racing_room_ids(&self) -> Vec<u32> {
        self.rooms
            .values()
            .filter(|r| r.is_racing())
            .map(|r| r.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
