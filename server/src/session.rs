//! Session registry mapping connection identity to player state
//!
//! The registry is the longest-lived owner of a `Player`: rooms and the
//! rating engine only borrow members for the duration of a race. Connection
//! identity is the UDP peer address; a reconnecting client re-binds a fresh
//! address to its existing player via `restore`.

use log::{debug, info};
use shared::{InputState, PlayerSnapshot, Vec3};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One connected identity and its authoritative kinematic state.
#[derive(Debug, Clone)]
pub struct Player {
    pub id: u32,
    pub username: String,
    pub addr: SocketAddr,
    pub position: Vec3,
    pub rotation: Vec3,
    pub speed: f32,
    pub input: InputState,
    /// Server receipt time of the last state write, in ms. This timestamp is
    /// authoritative: later receipts win regardless of client clocks.
    pub last_update: u64,
    pub latency: u64,
    pub score: u32,
    pub rating: i32,
    pub room: Option<u32>,
    pub last_seen: Instant,
}

impl Player {
    fn new(id: u32, username: String, addr: SocketAddr, rating: i32) -> Self {
        Self {
            id,
            username,
            addr,
            position: Vec3::new(0.0, 1.0, 0.0),
            rotation: Vec3::default(),
            speed: 0.0,
            input: InputState::default(),
            last_update: 0,
            latency: 0,
            score: 0,
            rating,
            room: None,
            last_seen: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            id: self.id,
            position: self.position,
            rotation: self.rotation,
            speed: self.speed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    AlreadyRegistered,
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::AlreadyRegistered => write!(f, "connection already registered"),
        }
    }
}

impl std::error::Error for RegisterError {}

/// Leaderboard row for the HTTP read surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub username: String,
    pub score: u32,
    pub rating: i32,
}

/// All registered players, indexed by id with an address side-index for
/// packet routing.
pub struct SessionRegistry {
    players: HashMap<u32, Player>,
    by_addr: HashMap<SocketAddr, u32>,
    next_player_id: u32,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            players: HashMap::new(),
            by_addr: HashMap::new(),
            next_player_id: 1,
        }
    }

    /// Creates a new player for this connection. Re-registering an address
    /// that already has a player is rejected, never merged.
    pub fn register(
        &mut self,
        addr: SocketAddr,
        username: String,
        rating: i32,
    ) -> Result<u32, RegisterError> {
        if self.by_addr.contains_key(&addr) {
            return Err(RegisterError::AlreadyRegistered);
        }

        let player_id = self.next_player_id;
        self.next_player_id += 1;

        info!("Player {} ({}) registered from {}", player_id, username, addr);
        self.players
            .insert(player_id, Player::new(player_id, username, addr, rating));
        self.by_addr.insert(addr, player_id);

        Ok(player_id)
    }

    /// Re-binds a fresh connection to an existing player after a reconnect.
    /// Returns the player's current room so the caller can confirm it.
    pub fn restore(&mut self, addr: SocketAddr, player_id: u32) -> Option<Option<u32>> {
        let player = self.players.get_mut(&player_id)?;
        let old_addr = player.addr;
        player.addr = addr;
        player.last_seen = Instant::now();
        self.by_addr.remove(&old_addr);
        self.by_addr.insert(addr, player_id);
        info!("Player {} session restored on {}", player_id, addr);
        Some(self.players[&player_id].room)
    }

    /// Removes the player for this connection, returning it so the caller
    /// can notify its room.
    pub fn unregister(&mut self, addr: SocketAddr) -> Option<Player> {
        let player_id = self.by_addr.remove(&addr)?;
        let player = self.players.remove(&player_id)?;
        info!("Player {} ({}) unregistered", player.id, player.username);
        Some(player)
    }

    /// Removes a player by id (timeout path, where the address may be stale).
    pub fn unregister_by_id(&mut self, player_id: u32) -> Option<Player> {
        let player = self.players.remove(&player_id)?;
        self.by_addr.remove(&player.addr);
        info!("Player {} ({}) timed out", player.id, player.username);
        Some(player)
    }

    pub fn player_id_at(&self, addr: SocketAddr) -> Option<u32> {
        self.by_addr.get(&addr).copied()
    }

    pub fn player(&self, player_id: u32) -> Option<&Player> {
        self.players.get(&player_id)
    }

    pub fn addr_of(&self, player_id: u32) -> Option<SocketAddr> {
        self.players.get(&player_id).map(|p| p.addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    /// Clamps and stores the latest input. Unknown connections are a stale
    /// packet, silently ignored.
    pub fn apply_input(&mut self, addr: SocketAddr, raw: InputState, now_ms: u64) {
        let Some(player_id) = self.by_addr.get(&addr) else {
            debug!("Input from unknown connection {}", addr);
            return;
        };
        if let Some(player) = self.players.get_mut(player_id) {
            player.input = raw.clamped();
            player.last_update = now_ms;
            player.last_seen = Instant::now();
        }
    }

    /// Applies a self-reported kinematic update, last-write-wins by receipt
    /// order. Returns the player id and room for the out-of-band relay.
    pub fn apply_position(
        &mut self,
        addr: SocketAddr,
        position: Vec3,
        rotation: Vec3,
        speed: f32,
        latency: u64,
        now_ms: u64,
    ) -> Option<(u32, Option<u32>)> {
        let player_id = *self.by_addr.get(&addr)?;
        let player = self.players.get_mut(&player_id)?;
        player.position = position;
        player.rotation = rotation;
        player.speed = speed;
        player.latency = latency;
        player.last_update = now_ms;
        player.last_seen = Instant::now();
        Some((player_id, player.room))
    }

    pub fn find_room_of(&self, addr: SocketAddr) -> Option<u32> {
        let player_id = self.by_addr.get(&addr)?;
        self.players.get(player_id)?.room
    }

    pub fn set_room(&mut self, player_id: u32, room: Option<u32>) {
        if let Some(player) = self.players.get_mut(&player_id) {
            player.room = room;
        }
    }

    pub fn set_rating(&mut self, player_id: u32, rating: i32) {
        if let Some(player) = self.players.get_mut(&player_id) {
            player.rating = rating;
        }
    }

    pub fn add_score(&mut self, player_id: u32, points: u32) {
        if let Some(player) = self.players.get_mut(&player_id) {
            player.score += points;
        }
    }

    /// Places the player on a starting-grid slot: two columns, rows six
    /// meters apart, facing down the track.
    pub fn place_at_grid_slot(&mut self, player_id: u32, slot: usize) {
        if let Some(player) = self.players.get_mut(&player_id) {
            let col = (slot % 2) as f32;
            let row = (slot / 2) as f32;
            player.position = Vec3::new(col * 4.0 - 2.0, 1.0, -row * 6.0);
            player.rotation = Vec3::default();
            player.speed = 0.0;
        }
    }

    pub fn touch(&mut self, addr: SocketAddr) {
        if let Some(player_id) = self.by_addr.get(&addr) {
            if let Some(player) = self.players.get_mut(player_id) {
                player.last_seen = Instant::now();
            }
        }
    }

    /// Removes players silent for longer than `timeout`, returning them for
    /// room cleanup.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<Player> {
        let timed_out: Vec<u32> = self
            .players
            .values()
            .filter(|p| p.last_seen.elapsed() > timeout)
            .map(|p| p.id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|id| self.unregister_by_id(id))
            .collect()
    }

    /// Top-N players by score descending, for the HTTP leaderboard.
    pub fn leaderboard(&self, top_n: usize) -> Vec<LeaderboardEntry> {
        let mut players: Vec<&Player> = self.players.values().collect();
        players.sort_by(|a, b| b.score.cmp(&a.score));
        players
            .into_iter()
            .take(top_n)
            .enumerate()
            .map(|(i, p)| LeaderboardEntry {
                rank: i + 1,
                username: p.username.clone(),
                score: p.score,
                rating: p.rating,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
