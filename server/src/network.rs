//! Server network layer handling UDP communications and game loop coordination
//!
//! One main loop task owns every registry (sessions, rooms, queues,
//! profiles), so room mutations, tick snapshots and matchmaking passes are
//! serialized by construction. A receiver task feeds decoded packets in, a
//! sender task drains outbound fan-out; both are connected by unbounded
//! channels and sends are fire-and-forget so a slow client never stalls a
//! tick.

use crate::http::{ApiSnapshot, ApiState, PlayerStats};
use crate::matchmaking::{MatchmakingPool, MatchmakingRequest, DEFAULT_MAX_WAIT_MS};
use crate::profile::ProfileStore;
use crate::rating;
use crate::room::RoomManager;
use crate::session::SessionRegistry;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use shared::{GameMode, InputState, Packet, PlayerInfo, RaceResult, RACE_DURATION_SECS};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
const LEADERBOARD_SIZE: usize = 100;

/// Current wall-clock time in ms since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis()
        .min(u64::MAX as u128) as u64
}

/// Messages sent from network tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    #[allow(dead_code)]
    Shutdown,
}

/// Messages sent from the main loop to the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    Send {
        packet: Packet,
        addr: SocketAddr,
    },
    SendMany {
        packet: Packet,
        addrs: Vec<SocketAddr>,
    },
}

/// Main server coordinating networking, matchmaking and room simulation
pub struct Server {
    socket: Arc<UdpSocket>,
    sessions: SessionRegistry,
    rooms: RoomManager,
    pool: MatchmakingPool,
    profiles: ProfileStore,
    tick_duration: Duration,
    room_capacity: usize,
    api_state: ApiState,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
    out_rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl Server {
    pub async fn new(
        addr: &str,
        tick_duration: Duration,
        room_capacity: usize,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            sessions: SessionRegistry::new(),
            rooms: RoomManager::new(),
            pool: MatchmakingPool::new(room_capacity),
            profiles: ProfileStore::new(),
            tick_duration,
            room_capacity,
            api_state: Arc::new(RwLock::new(ApiSnapshot::default())),
            server_tx,
            server_rx,
            out_tx,
            out_rx,
        })
    }

    /// Shared read-model consumed by the HTTP surface.
    pub fn api_state(&self) -> ApiState {
        Arc::clone(&self.api_state)
    }

    /// Spawns the task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns the task that drains the outgoing packet queue. A failed send
    /// to one destination never aborts delivery to the rest.
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut out_rx = std::mem::replace(&mut self.out_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match message {
                    OutboundMessage::Send { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    OutboundMessage::SendMany { packet, addrs } => {
                        for addr in addrs {
                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to {}: {}", addr, e);
                            }
                        }
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.out_tx.send(OutboundMessage::Send { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Resolves room fan-out through the explicit member-id mapping and
    /// queues one datagram per member, optionally excluding the origin.
    fn send_to_room(&self, room_id: u32, packet: Packet, exclude: Option<u32>) {
        let Some(room) = self.rooms.get(room_id) else {
            debug!("Broadcast target room {} is gone", room_id);
            return;
        };

        let addrs: Vec<SocketAddr> = room
            .members()
            .iter()
            .filter(|&&id| Some(id) != exclude)
            .filter_map(|&id| self.sessions.addr_of(id))
            .collect();

        if addrs.is_empty() {
            return;
        }
        if let Err(e) = self.out_tx.send(OutboundMessage::SendMany { packet, addrs }) {
            error!("Failed to queue broadcast: {}", e);
        }
    }

    /// Processes one inbound packet. Unknown senders and stale targets are
    /// expected absences, handled as silent no-ops.
    fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Register { username } => match self.sessions.register(
                addr,
                username,
                shared::BASE_RATING,
            ) {
                Ok(player_id) => {
                    self.send(Packet::RegisterSuccess { player_id }, addr);
                }
                Err(e) => {
                    warn!("Registration from {} rejected: {}", addr, e);
                    self.send(
                        Packet::Rejected {
                            reason: e.to_string(),
                        },
                        addr,
                    );
                }
            },

            Packet::RestoreSession { player_id } => {
                match self.sessions.restore(addr, player_id) {
                    Some(room_id) => {
                        self.send(Packet::SessionRestored { player_id, room_id }, addr);
                    }
                    None => {
                        self.send(
                            Packet::Rejected {
                                reason: "unknown session".to_string(),
                            },
                            addr,
                        );
                    }
                }
            }

            Packet::JoinMatchmaking { mode } => {
                let Some(player_id) = self.sessions.player_id_at(addr) else {
                    return;
                };
                if self.sessions.find_room_of(addr).is_some() {
                    self.send(
                        Packet::Rejected {
                            reason: "already in a room".to_string(),
                        },
                        addr,
                    );
                    return;
                }

                let request = MatchmakingRequest {
                    player_id,
                    skill_rating: self.profiles.rating_of(player_id),
                    mode,
                    enqueued_at: now_ms(),
                };
                // A repeated join is a pure no-op: the stored request keeps
                // its original wait timer and queue slot.
                if self.pool.enqueue(request.clone()) {
                    self.try_form_room(&request);
                }

                if let Some(queue_position) = self.pool.queue_position(player_id, mode) {
                    self.send(
                        Packet::MatchmakingStatus {
                            queue_position,
                            queue_size: self.pool.len(mode),
                        },
                        addr,
                    );
                }
            }

            Packet::LeaveMatchmaking { mode } => {
                if let Some(player_id) = self.sessions.player_id_at(addr) {
                    self.pool.dequeue(player_id, mode);
                    self.send(Packet::LeftMatchmaking, addr);
                }
            }

            Packet::PlayerInput {
                forward,
                turn,
                brake,
            } => {
                self.sessions.apply_input(
                    addr,
                    InputState {
                        forward,
                        turn,
                        brake,
                    },
                    now_ms(),
                );
            }

            Packet::PositionUpdate {
                position,
                rotation,
                speed,
                latency,
            } => {
                let receipt = now_ms();
                if let Some((player_id, Some(room_id))) = self
                    .sessions
                    .apply_position(addr, position, rotation, speed, latency, receipt)
                {
                    // Low-latency relay between ticks; the periodic tick
                    // broadcast restores consistency on top of this.
                    self.send_to_room(
                        room_id,
                        Packet::PlayerStateUpdate {
                            player_id,
                            position,
                            rotation,
                            speed,
                            timestamp: receipt,
                        },
                        Some(player_id),
                    );
                }
            }

            Packet::ChatMessage { room, message } => {
                let Some(player_id) = self.sessions.player_id_at(addr) else {
                    return;
                };
                let Some(player) = self.sessions.player(player_id) else {
                    return;
                };
                if !self.rooms.get(room).map_or(false, |r| r.contains(player_id)) {
                    return;
                }
                self.send_to_room(
                    room,
                    Packet::ChatRelayed {
                        player_id,
                        username: player.username.clone(),
                        message,
                        timestamp: now_ms(),
                    },
                    None,
                );
            }

            Packet::StartRace { room } => {
                let Some(player_id) = self.sessions.player_id_at(addr) else {
                    return;
                };
                if !self.rooms.get(room).map_or(false, |r| r.contains(player_id)) {
                    return;
                }
                match self.rooms.get_mut(room).map(|r| r.start()) {
                    Some(Ok(())) => {
                        self.send_to_room(
                            room,
                            Packet::RaceStarted {
                                timestamp: now_ms(),
                                duration_secs: RACE_DURATION_SECS,
                            },
                            None,
                        );
                    }
                    Some(Err(e)) => {
                        self.send(
                            Packet::Rejected {
                                reason: e.to_string(),
                            },
                            addr,
                        );
                    }
                    None => {}
                }
            }

            Packet::FinishRace { room, results } => {
                let Some(player_id) = self.sessions.player_id_at(addr) else {
                    return;
                };
                if !self.rooms.get(room).map_or(false, |r| r.contains(player_id)) {
                    return;
                }
                if let Err(e) = self.finish_race(room, results) {
                    self.send(
                        Packet::Rejected {
                            reason: e.to_string(),
                        },
                        addr,
                    );
                }
            }

            Packet::Ping => {
                self.sessions.touch(addr);
                self.send(Packet::Pong { timestamp: now_ms() }, addr);
            }

            Packet::Disconnect => {
                self.handle_departure(addr);
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    /// Removes the session and, if the player was in a room, removes it from
    /// the room and notifies the remaining members. A disconnect never rolls
    /// back the race for the rest.
    fn handle_departure(&mut self, addr: SocketAddr) {
        let Some(player) = self.sessions.unregister(addr) else {
            return;
        };

        self.pool.dequeue(player.id, GameMode::Ranked);
        self.pool.dequeue(player.id, GameMode::Casual);

        if let Some(room_id) = player.room {
            if let Some(remaining) = self.rooms.remove_member(room_id, player.id) {
                if !remaining.is_empty() {
                    self.send_to_room(
                        room_id,
                        Packet::PlayerDisconnected {
                            player_id: player.id,
                            username: player.username.clone(),
                        },
                        None,
                    );
                }
            }
        }
    }

    /// Attempts to fill a room around `request`; on success creates the room
    /// and notifies every paired player.
    fn try_form_room(&mut self, request: &MatchmakingRequest) {
        let Some(player_ids) = self.pool.try_pair(request, now_ms(), DEFAULT_MAX_WAIT_MS) else {
            return;
        };

        // A paired player leaves every queue, not just the matched mode, so
        // the other mode can never place them in a second room.
        for &player_id in &player_ids {
            self.pool.dequeue(player_id, GameMode::Ranked);
            self.pool.dequeue(player_id, GameMode::Casual);
        }

        let room_id = self.rooms.create(&player_ids, self.room_capacity, now_ms());

        // Random starting grid, so queue order gives no positional edge.
        let mut grid = player_ids.clone();
        grid.shuffle(&mut rand::thread_rng());
        for (slot, &player_id) in grid.iter().enumerate() {
            self.sessions.place_at_grid_slot(player_id, slot);
        }

        let roster: Vec<PlayerInfo> = player_ids
            .iter()
            .filter_map(|&id| self.sessions.player(id))
            .map(|p| PlayerInfo {
                id: p.id,
                username: p.username.clone(),
            })
            .collect();

        for &player_id in &player_ids {
            self.sessions.set_room(player_id, Some(room_id));
            if let Some(addr) = self.sessions.addr_of(player_id) {
                self.send(
                    Packet::MatchFound {
                        room_id,
                        players: roster.clone(),
                    },
                    addr,
                );
            }
        }
    }

    /// Periodic pairing pass: one attempt per mode, retried on the sweep
    /// timer. "No match yet" just leaves the queue for the next pass.
    fn matchmaking_sweep(&mut self) {
        for mode in [GameMode::Ranked, GameMode::Casual] {
            if let Some(request) = self.pool.head(mode) {
                self.try_form_room(&request);
            }
        }
    }

    /// Finishes a race: one rating update per member from pre-race ratings,
    /// applied to the profile store before the results broadcast, so the
    /// next matchmaking read already sees the new skill. Results are
    /// client-supplied and rejected wholesale when inconsistent; afterwards
    /// every member's room assignment is cleared so they can queue again.
    fn finish_race(
        &mut self,
        room_id: u32,
        results: Vec<RaceResult>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let room = self.rooms.get(room_id).ok_or("room not found")?;

        let field_size = results.len() as u32;
        let mut seen = std::collections::HashSet::new();
        for result in &results {
            if result.position == 0 || result.position > field_size {
                return Err(format!(
                    "finish position {} out of range for a field of {}",
                    result.position, field_size
                )
                .into());
            }
            if !seen.insert(result.player_id) {
                return Err(format!("duplicate result for player {}", result.player_id).into());
            }
            if !room.contains(result.player_id) {
                return Err(format!("player {} is not in this room", result.player_id).into());
            }
        }

        let room = self.rooms.get_mut(room_id).ok_or("room not found")?;
        room.finish()?;

        let finish_time = now_ms();
        let total_players = results.len() as u32;
        let pre_race: Vec<(u32, i32)> = results
            .iter()
            .map(|r| (r.player_id, self.profiles.rating_of(r.player_id)))
            .collect();

        for result in &results {
            let player_rating = self.profiles.rating_of(result.player_id);
            let opponents: Vec<i32> = pre_race
                .iter()
                .filter(|(id, _)| *id != result.player_id)
                .map(|(_, rating)| *rating)
                .collect();

            let update = rating::update(
                player_rating,
                &opponents,
                result.position,
                total_players,
            );
            self.profiles
                .apply(result.player_id, room_id, result.position, update, finish_time);
            self.sessions.set_rating(result.player_id, update.new_rating);
            self.sessions.add_score(result.player_id, result.points);
        }

        self.send_to_room(
            room_id,
            Packet::RaceFinished {
                results,
                timestamp: finish_time,
            },
            None,
        );

        // Drain the room: members are free for matchmaking again and the
        // emptied room is garbage-collected.
        let members = self
            .rooms
            .get(room_id)
            .map(|r| r.members().to_vec())
            .unwrap_or_default();
        for player_id in members {
            self.sessions.set_room(player_id, None);
            self.rooms.remove_member(room_id, player_id);
        }

        Ok(())
    }

    /// Broadcasts the authoritative snapshot of every racing room. Snapshots
    /// are taken and queued atomically with respect to membership changes
    /// because the main loop owns both.
    fn broadcast_ticks(&mut self) {
        let timestamp = now_ms();
        for room_id in self.rooms.racing_room_ids() {
            let Some(room) = self.rooms.get(room_id) else {
                continue;
            };
            let players: Vec<shared::PlayerSnapshot> = room
                .members()
                .iter()
                .filter_map(|&id| self.sessions.player(id))
                .map(|p| p.snapshot())
                .collect();

            self.send_to_room(
                room_id,
                Packet::GameStateUpdate { timestamp, players },
                None,
            );
        }
    }

    /// Drops silent clients and treats them exactly like a disconnect.
    fn timeout_sweep(&mut self) {
        for player in self.sessions.check_timeouts(CLIENT_TIMEOUT) {
            self.pool.dequeue(player.id, GameMode::Ranked);
            self.pool.dequeue(player.id, GameMode::Casual);
            if let Some(room_id) = player.room {
                if let Some(remaining) = self.rooms.remove_member(room_id, player.id) {
                    if !remaining.is_empty() {
                        self.send_to_room(
                            room_id,
                            Packet::PlayerDisconnected {
                                player_id: player.id,
                                username: player.username.clone(),
                            },
                            None,
                        );
                    }
                }
            }
        }
    }

    /// Publishes the read-model consumed by the HTTP surface.
    async fn refresh_api_state(&self) {
        let mut stats = std::collections::HashMap::new();
        for player in self.sessions.iter() {
            let record = self.profiles.record(player.id);
            stats.insert(
                player.id,
                PlayerStats {
                    id: player.id,
                    username: player.username.clone(),
                    score: player.score,
                    rating: player.rating,
                    tier: rating::tier_of(player.rating).name.to_string(),
                    latency: player.latency,
                    matches: record.map_or(0, |r| r.matches),
                    wins: record.map_or(0, |r| r.wins),
                    losses: record.map_or(0, |r| r.losses),
                },
            );
        }

        let snapshot = ApiSnapshot {
            players: self.sessions.len(),
            rooms: self.rooms.len(),
            queued: self.pool.len(GameMode::Ranked) + self.pool.len(GameMode::Casual),
            timestamp: now_ms(),
            leaderboard: self.sessions.leaderboard(LEADERBOARD_SIZE),
            player_stats: stats,
        };

        *self.api_state.write().await = snapshot;
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();

        let mut tick_interval = interval(self.tick_duration);
        let mut sweep_interval = interval(Duration::from_secs(1));
        let mut tick_count: u64 = 0;

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    self.broadcast_ticks();
                    tick_count += 1;

                    if tick_count % 300 == 0 {
                        debug!(
                            "Tick {}: {} players, {} rooms, {} queued",
                            tick_count,
                            self.sessions.len(),
                            self.rooms.len(),
                            self.pool.len(GameMode::Ranked) + self.pool.len(GameMode::Casual),
                        );
                    }
                },

                _ = sweep_interval.tick() => {
                    self.matchmaking_sweep();
                    self.timeout_sweep();
                    self.refresh_api_state().await;
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Vec3;

    async fn server() -> Server {
        Server::new("127.0.0.1:0", Duration::from_millis(16), 4)
            .await
            .unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    /// Drains queued outbound traffic into (packet, destination) pairs.
    fn drain(server: &mut Server) -> Vec<(Packet, SocketAddr)> {
        let mut sent = Vec::new();
        while let Ok(message) = server.out_rx.try_recv() {
            match message {
                OutboundMessage::Send { packet, addr } => sent.push((packet, addr)),
                OutboundMessage::SendMany { packet, addrs } => {
                    for addr in addrs {
                        sent.push((packet.clone(), addr));
                    }
                }
            }
        }
        sent
    }

    fn register(server: &mut Server, port: u16, name: &str) -> u32 {
        server.handle_packet(
            Packet::Register {
                username: name.to_string(),
            },
            addr(port),
        );
        match drain(server).as_slice() {
            [(Packet::RegisterSuccess { player_id }, _)] => *player_id,
            other => panic!("unexpected registration reply: {:?}", other),
        }
    }

    fn form_room(server: &mut Server) -> (u32, Vec<u32>) {
        let players: Vec<u32> = (0..4)
            .map(|i| register(server, 5000 + i, &format!("racer{}", i)))
            .collect();
        for i in 0..4u16 {
            server.handle_packet(
                Packet::JoinMatchmaking {
                    mode: GameMode::Casual,
                },
                addr(5000 + i),
            );
        }
        let room_id = drain(server)
            .iter()
            .find_map(|(p, _)| match p {
                Packet::MatchFound { room_id, .. } => Some(*room_id),
                _ => None,
            })
            .expect("no room formed");
        (room_id, players)
    }

    #[tokio::test]
    async fn test_duplicate_register_rejected() {
        let mut server = server().await;
        register(&mut server, 4000, "alice");

        server.handle_packet(
            Packet::Register {
                username: "alice2".to_string(),
            },
            addr(4000),
        );
        let sent = drain(&mut server);
        assert!(matches!(sent.as_slice(), [(Packet::Rejected { .. }, _)]));
        assert_eq!(server.sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_ping_pong_refreshes_liveness() {
        let mut server = server().await;
        register(&mut server, 4000, "alice");

        server.handle_packet(Packet::Ping, addr(4000));
        let sent = drain(&mut server);
        assert!(matches!(sent.as_slice(), [(Packet::Pong { .. }, a)] if *a == addr(4000)));
    }

    #[tokio::test]
    async fn test_matchmaking_forms_room_of_four() {
        let mut server = server().await;
        let players: Vec<u32> = (0..4)
            .map(|i| register(&mut server, 5000 + i, &format!("racer{}", i)))
            .collect();

        for i in 0..4u16 {
            server.handle_packet(
                Packet::JoinMatchmaking {
                    mode: GameMode::Casual,
                },
                addr(5000 + i),
            );
        }

        assert_eq!(server.rooms.len(), 1);
        let sent = drain(&mut server);
        let found = sent
            .iter()
            .filter(|(p, _)| matches!(p, Packet::MatchFound { .. }))
            .count();
        assert_eq!(found, 4);

        for &id in &players {
            assert!(server.sessions.player(id).unwrap().room.is_some());
        }
        assert!(server.pool.is_empty(GameMode::Casual));
    }

    #[tokio::test]
    async fn test_join_matchmaking_reports_queue_status() {
        let mut server = server().await;
        register(&mut server, 4000, "alice");

        server.handle_packet(
            Packet::JoinMatchmaking {
                mode: GameMode::Ranked,
            },
            addr(4000),
        );
        let sent = drain(&mut server);
        assert!(matches!(
            sent.as_slice(),
            [(
                Packet::MatchmakingStatus {
                    queue_position: 0,
                    queue_size: 1,
                },
                _
            )]
        ));
    }

    #[tokio::test]
    async fn test_repeat_join_keeps_original_queue_slot() {
        let mut server = server().await;
        register(&mut server, 4000, "alice");

        server.handle_packet(
            Packet::JoinMatchmaking {
                mode: GameMode::Ranked,
            },
            addr(4000),
        );
        drain(&mut server);
        let first = server.pool.head(GameMode::Ranked).unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        server.handle_packet(
            Packet::JoinMatchmaking {
                mode: GameMode::Ranked,
            },
            addr(4000),
        );

        // The second join must not restart the wait timer or grow the queue.
        let kept = server.pool.head(GameMode::Ranked).unwrap();
        assert_eq!(kept.enqueued_at, first.enqueued_at);
        assert_eq!(server.pool.len(GameMode::Ranked), 1);
    }

    #[tokio::test]
    async fn test_match_clears_player_from_both_queues() {
        let mut server = server().await;
        let players: Vec<u32> = (0..4)
            .map(|i| register(&mut server, 5000 + i, &format!("racer{}", i)))
            .collect();

        // First racer waits in ranked with nobody to pair against, then the
        // whole group joins casual and fills a room.
        server.handle_packet(
            Packet::JoinMatchmaking {
                mode: GameMode::Ranked,
            },
            addr(5000),
        );
        for i in 0..4u16 {
            server.handle_packet(
                Packet::JoinMatchmaking {
                    mode: GameMode::Casual,
                },
                addr(5000 + i),
            );
        }

        assert_eq!(server.rooms.len(), 1);
        // The ranked entry is gone too, so a later ranked pairing can never
        // pull a player who is already racing into a second room.
        for &id in &players {
            assert!(!server.pool.contains(id, GameMode::Ranked));
            assert!(!server.pool.contains(id, GameMode::Casual));
        }
    }

    #[tokio::test]
    async fn test_leave_matchmaking() {
        let mut server = server().await;
        let id = register(&mut server, 4000, "alice");

        server.handle_packet(
            Packet::JoinMatchmaking {
                mode: GameMode::Ranked,
            },
            addr(4000),
        );
        server.handle_packet(
            Packet::LeaveMatchmaking {
                mode: GameMode::Ranked,
            },
            addr(4000),
        );

        assert!(!server.pool.contains(id, GameMode::Ranked));
        let sent = drain(&mut server);
        assert!(sent
            .iter()
            .any(|(p, _)| matches!(p, Packet::LeftMatchmaking)));
    }

    #[tokio::test]
    async fn test_race_start_and_position_relay() {
        let mut server = server().await;
        let (room_id, players) = form_room(&mut server);

        server.handle_packet(Packet::StartRace { room: room_id }, addr(5000));
        let sent = drain(&mut server);
        assert_eq!(
            sent.iter()
                .filter(|(p, _)| matches!(p, Packet::RaceStarted { .. }))
                .count(),
            4
        );

        server.handle_packet(
            Packet::PositionUpdate {
                position: Vec3::new(10.0, 1.0, 5.0),
                rotation: Vec3::default(),
                speed: 30.0,
                latency: 40,
            },
            addr(5000),
        );

        // Relayed to the three other members only.
        let sent = drain(&mut server);
        let relays: Vec<&SocketAddr> = sent
            .iter()
            .filter(|(p, _)| matches!(p, Packet::PlayerStateUpdate { .. }))
            .map(|(_, a)| a)
            .collect();
        assert_eq!(relays.len(), 3);
        assert!(!relays.contains(&&addr(5000)));

        let mover = server.sessions.player(players[0]).unwrap();
        assert_eq!(mover.position.x, 10.0);
        assert_eq!(mover.latency, 40);
    }

    #[tokio::test]
    async fn test_finish_race_applies_ratings_before_broadcast() {
        let mut server = server().await;
        let (room_id, players) = form_room(&mut server);
        server.handle_packet(Packet::StartRace { room: room_id }, addr(5000));
        drain(&mut server);

        let results: Vec<RaceResult> = players
            .iter()
            .enumerate()
            .map(|(i, &id)| RaceResult {
                player_id: id,
                position: i as u32 + 1,
                points: (4 - i as u32) * 10,
            })
            .collect();
        server.handle_packet(
            Packet::FinishRace {
                room: room_id,
                results,
            },
            addr(5000),
        );

        // Equal-field winner gains, last place loses, and the durable record
        // agrees with the session copy.
        let winner = server.profiles.record(players[0]).unwrap();
        assert_eq!(winner.rating, 1216);
        assert_eq!(winner.wins, 1);
        assert_eq!(server.sessions.player(players[0]).unwrap().rating, 1216);
        assert_eq!(server.sessions.player(players[0]).unwrap().score, 40);

        let last = server.profiles.record(players[3]).unwrap();
        assert!(last.rating < 1200);
        assert_eq!(last.losses, 1);

        let sent = drain(&mut server);
        assert_eq!(
            sent.iter()
                .filter(|(p, _)| matches!(p, Packet::RaceFinished { .. }))
                .count(),
            4
        );

        // The room drains after the results broadcast: members are free
        // again and the emptied room is gone.
        assert!(server.rooms.get(room_id).is_none());
        for &id in &players {
            assert!(server.sessions.player(id).unwrap().room.is_none());
        }
    }

    #[tokio::test]
    async fn test_players_can_requeue_after_finish() {
        let mut server = server().await;
        let (room_id, players) = form_room(&mut server);
        server.handle_packet(Packet::StartRace { room: room_id }, addr(5000));
        drain(&mut server);

        let results = players
            .iter()
            .enumerate()
            .map(|(i, &id)| RaceResult {
                player_id: id,
                position: i as u32 + 1,
                points: 10,
            })
            .collect();
        server.handle_packet(
            Packet::FinishRace {
                room: room_id,
                results,
            },
            addr(5000),
        );
        drain(&mut server);

        server.handle_packet(
            Packet::JoinMatchmaking {
                mode: GameMode::Casual,
            },
            addr(5000),
        );
        let sent = drain(&mut server);
        assert!(matches!(
            sent.as_slice(),
            [(Packet::MatchmakingStatus { .. }, _)]
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_result_rejected() {
        let mut server = server().await;
        let (room_id, players) = form_room(&mut server);
        server.handle_packet(Packet::StartRace { room: room_id }, addr(5000));
        drain(&mut server);

        // Position 5 in a field of 4 must be rejected wholesale, leaving
        // the race running and the profiles untouched.
        server.handle_packet(
            Packet::FinishRace {
                room: room_id,
                results: players
                    .iter()
                    .enumerate()
                    .map(|(i, &id)| RaceResult {
                        player_id: id,
                        position: i as u32 + 2,
                        points: 10,
                    })
                    .collect(),
            },
            addr(5000),
        );

        let sent = drain(&mut server);
        assert!(sent.iter().any(|(p, _)| matches!(p, Packet::Rejected { .. })));
        assert!(server.rooms.get(room_id).unwrap().is_racing());
        assert!(server.profiles.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_result_entry_rejected() {
        let mut server = server().await;
        let (room_id, players) = form_room(&mut server);
        server.handle_packet(Packet::StartRace { room: room_id }, addr(5000));
        drain(&mut server);

        server.handle_packet(
            Packet::FinishRace {
                room: room_id,
                results: vec![
                    RaceResult {
                        player_id: players[0],
                        position: 1,
                        points: 40,
                    },
                    RaceResult {
                        player_id: players[0],
                        position: 2,
                        points: 30,
                    },
                ],
            },
            addr(5000),
        );

        let sent = drain(&mut server);
        assert!(sent.iter().any(|(p, _)| matches!(p, Packet::Rejected { .. })));
        assert!(server.rooms.get(room_id).unwrap().is_racing());
    }

    #[tokio::test]
    async fn test_finish_without_start_rejected() {
        let mut server = server().await;
        let (room_id, players) = form_room(&mut server);

        server.handle_packet(
            Packet::FinishRace {
                room: room_id,
                results: vec![RaceResult {
                    player_id: players[0],
                    position: 1,
                    points: 40,
                }],
            },
            addr(5000),
        );

        let sent = drain(&mut server);
        assert!(sent.iter().any(|(p, _)| matches!(p, Packet::Rejected { .. })));
        assert!(server.profiles.record(players[0]).is_none());
    }

    #[tokio::test]
    async fn test_disconnect_notifies_room() {
        let mut server = server().await;
        let (room_id, players) = form_room(&mut server);
        server.handle_packet(Packet::StartRace { room: room_id }, addr(5000));
        drain(&mut server);

        server.handle_packet(Packet::Disconnect, addr(5001));

        assert!(server.sessions.player(players[1]).is_none());
        assert!(!server.rooms.get(room_id).unwrap().contains(players[1]));

        let sent = drain(&mut server);
        let notices = sent
            .iter()
            .filter(|(p, _)| matches!(p, Packet::PlayerDisconnected { .. }))
            .count();
        assert_eq!(notices, 3);
    }

    #[tokio::test]
    async fn test_session_restore_rejoins_room() {
        let mut server = server().await;
        let (room_id, players) = form_room(&mut server);

        server.handle_packet(
            Packet::RestoreSession {
                player_id: players[0],
            },
            addr(6000),
        );

        let sent = drain(&mut server);
        assert!(matches!(
            sent.as_slice(),
            [(
                Packet::SessionRestored {
                    player_id,
                    room_id: Some(restored),
                },
                a
            )] if *player_id == players[0] && *restored == room_id && *a == addr(6000)
        ));
        assert_eq!(server.sessions.addr_of(players[0]), Some(addr(6000)));
    }

    #[tokio::test]
    async fn test_restore_unknown_session_rejected() {
        let mut server = server().await;
        server.handle_packet(Packet::RestoreSession { player_id: 99 }, addr(6000));

        let sent = drain(&mut server);
        assert!(matches!(sent.as_slice(), [(Packet::Rejected { .. }, _)]));
    }

    #[tokio::test]
    async fn test_chat_relayed_to_whole_room() {
        let mut server = server().await;
        let (room_id, _) = form_room(&mut server);

        server.handle_packet(
            Packet::ChatMessage {
                room: room_id,
                message: "gl hf".to_string(),
            },
            addr(5002),
        );

        let sent = drain(&mut server);
        let relayed: Vec<_> = sent
            .iter()
            .filter(|(p, _)| matches!(p, Packet::ChatRelayed { .. }))
            .collect();
        assert_eq!(relayed.len(), 4);
    }

    #[tokio::test]
    async fn test_join_matchmaking_while_in_room_rejected() {
        let mut server = server().await;
        form_room(&mut server);

        server.handle_packet(
            Packet::JoinMatchmaking {
                mode: GameMode::Casual,
            },
            addr(5000),
        );
        let sent = drain(&mut server);
        assert!(matches!(sent.as_slice(), [(Packet::Rejected { .. }, _)]));
    }

    #[tokio::test]
    async fn test_api_snapshot_reflects_state() {
        let mut server = server().await;
        let id = register(&mut server, 4000, "alice");
        server.sessions.add_score(id, 25);

        server.refresh_api_state().await;
        let snapshot = server.api_state.read().await;
        assert_eq!(snapshot.players, 1);
        assert_eq!(snapshot.leaderboard[0].username, "alice");
        assert_eq!(snapshot.player_stats[&id].score, 25);
        assert_eq!(snapshot.player_stats[&id].tier, "Silver Drift");
    }
}
