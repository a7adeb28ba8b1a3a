//! Client-side connection handling and packet processing
//!
//! Headless driver for a racing session: registers, queues for a match and
//! keeps remote racer state flowing into the lag compensator. A rendering
//! layer reads interpolated state through `remote_state`; everything here
//! stays playable over a lossy connection via the reconnect controller.

use crate::lag::{LagCompensator, StateSample};
use crate::reconnect::{ConnectionState, ReconnectController};
use bincode::{deserialize, serialize};
use log::{error, info, warn};
use shared::{GameMode, InputState, Packet, Vec3};
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep};

/// Silence longer than this is treated as a dropped connection.
const SERVER_SILENCE_TIMEOUT: Duration = Duration::from_secs(5);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    username: String,
    mode: GameMode,

    player_id: Option<u32>,
    room: Option<u32>,
    queued: bool,
    compensator: LagCompensator,
    reconnect: ReconnectController,

    ping_ms: u64,
    last_server_packet: Instant,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        username: &str,
        mode: GameMode,
        max_reconnect_attempts: u32,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(Client {
            socket,
            server_addr,
            username: username.to_string(),
            mode,
            player_id: None,
            room: None,
            queued: false,
            compensator: LagCompensator::new(),
            reconnect: ReconnectController::new(max_reconnect_attempts),
            ping_ms: 0,
            last_server_packet: Instant::now(),
        })
    }

    pub fn player_id(&self) -> Option<u32> {
        self.player_id
    }

    pub fn room(&self) -> Option<u32> {
        self.room
    }

    pub fn ping_ms(&self) -> u64 {
        self.ping_ms
    }

    /// Interpolated state of a remote racer for the current wall clock.
    pub fn remote_state(&self, entity: u32) -> Option<StateSample> {
        self.compensator.interpolate(entity, now_ms())
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    async fn register(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Registering as {}...", self.username);
        self.send_packet(&Packet::Register {
            username: self.username.clone(),
        })
        .await
    }

    pub async fn send_input(&self, input: InputState) -> Result<(), Box<dyn std::error::Error>> {
        if self.player_id.is_none() {
            return Ok(());
        }
        self.send_packet(&Packet::PlayerInput {
            forward: input.forward,
            turn: input.turn,
            brake: input.brake,
        })
        .await
    }

    pub async fn send_position(
        &self,
        position: Vec3,
        rotation: Vec3,
        speed: f32,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if self.room.is_none() {
            return Ok(());
        }
        self.send_packet(&Packet::PositionUpdate {
            position,
            rotation,
            speed,
            latency: self.ping_ms,
        })
        .await
    }

    fn record_sample(&mut self, entity: u32, position: Vec3, rotation: Vec3, speed: f32, timestamp: u64) {
        if Some(entity) == self.player_id {
            return;
        }
        self.compensator.record(
            entity,
            StateSample {
                position,
                rotation,
                speed,
                timestamp,
            },
        );
    }

    fn handle_packet(&mut self, packet: Packet) {
        self.last_server_packet = Instant::now();

        match packet {
            Packet::RegisterSuccess { player_id } => {
                info!("Registered! Player ID: {}", player_id);
                self.player_id = Some(player_id);
                self.reconnect.mark_connected(player_id);
            }

            Packet::SessionRestored { player_id, room_id } => {
                info!("Session restored as player {} (room {:?})", player_id, room_id);
                self.player_id = Some(player_id);
                self.room = room_id;
                self.reconnect.mark_connected(player_id);
            }

            Packet::Rejected { reason } => {
                warn!("Server rejected request: {}", reason);
            }

            Packet::MatchmakingStatus {
                queue_position,
                queue_size,
            } => {
                info!("In queue: position {} of {}", queue_position + 1, queue_size);
            }

            Packet::LeftMatchmaking => {
                info!("Left the matchmaking queue");
                self.queued = false;
            }

            Packet::MatchFound { room_id, players } => {
                let roster: Vec<&str> = players.iter().map(|p| p.username.as_str()).collect();
                info!("Match found! Room {} with {:?}", room_id, roster);
                self.room = Some(room_id);
                self.queued = false;
            }

            Packet::RaceStarted {
                timestamp,
                duration_secs,
            } => {
                info!("Race started at {} ({}s)", timestamp, duration_secs);
            }

            Packet::GameStateUpdate { timestamp, players } => {
                for snapshot in players {
                    self.record_sample(
                        snapshot.id,
                        snapshot.position,
                        snapshot.rotation,
                        snapshot.speed,
                        timestamp,
                    );
                }
            }

            Packet::PlayerStateUpdate {
                player_id,
                position,
                rotation,
                speed,
                timestamp,
            } => {
                self.record_sample(player_id, position, rotation, speed, timestamp);
            }

            Packet::RaceFinished { results, .. } => {
                for result in &results {
                    info!(
                        "Player {} finished #{} (+{} pts)",
                        result.player_id, result.position, result.points
                    );
                }
                self.room = None;
            }

            Packet::PlayerDisconnected {
                player_id,
                username,
            } => {
                info!("{} (player {}) left the race", username, player_id);
                self.compensator.remove(player_id);
            }

            Packet::ChatRelayed {
                username, message, ..
            } => {
                info!("[chat] {}: {}", username, message);
            }

            Packet::Pong { timestamp } => {
                self.ping_ms = now_ms().saturating_sub(timestamp);
            }

            _ => {
                warn!("Unexpected packet type from server");
            }
        }
    }

    /// One step of the retry cycle: wait out the backoff, then ask for a
    /// session restore (or a fresh registration if none was ever granted).
    async fn attempt_reconnect(&mut self) -> Result<bool, Box<dyn std::error::Error>> {
        let Some(delay) = self.reconnect.connection_lost() else {
            return Ok(false);
        };
        sleep(delay).await;

        match self.reconnect.saved_player_id() {
            Some(player_id) => {
                self.send_packet(&Packet::RestoreSession { player_id }).await?;
            }
            None => self.register().await?,
        }
        self.last_server_packet = Instant::now();
        Ok(true)
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.register().await?;

        let mut ping_interval = interval(Duration::from_secs(2));
        let mut cleanup_interval = interval(Duration::from_secs(1));
        let mut buffer = [0u8; 2048];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => {
                            if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                                self.handle_packet(packet);
                            }
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = ping_interval.tick() => {
                    if self.player_id.is_some() {
                        self.send_packet(&Packet::Ping).await?;

                        if !self.queued && self.room.is_none() {
                            info!("Joining {:?} matchmaking", self.mode);
                            self.send_packet(&Packet::JoinMatchmaking { mode: self.mode }).await?;
                            self.queued = true;
                        }
                    }
                },

                _ = cleanup_interval.tick() => {
                    self.compensator.clear_stale(now_ms());

                    let silent = self.last_server_packet.elapsed() > SERVER_SILENCE_TIMEOUT;
                    if silent && self.reconnect.state() != ConnectionState::Failed {
                        if !self.attempt_reconnect().await? {
                            error!("Could not re-establish connection, giving up");
                            return Err("connection lost".into());
                        }
                    }
                },
            }
        }
    }
}
