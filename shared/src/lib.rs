use serde::{Deserialize, Serialize};

pub const TICK_RATE: u32 = 60;
pub const ROOM_CAPACITY: usize = 4;
pub const BASE_RATING: i32 = 1200;
pub const RACE_DURATION_SECS: u64 = 300;
pub const INTERPOLATION_DELAY_MS: u64 = 100;
pub const STATE_HISTORY_CAPACITY: usize = 120;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn lerp(self, other: Vec3, alpha: f32) -> Vec3 {
        Vec3 {
            x: self.x + (other.x - self.x) * alpha,
            y: self.y + (other.y - self.y) * alpha,
            z: self.z + (other.z - self.z) * alpha,
        }
    }

    pub fn sub(self, other: Vec3) -> Vec3 {
        Vec3 {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
        }
    }

    pub fn scale(self, factor: f32) -> Vec3 {
        Vec3 {
            x: self.x * factor,
            y: self.y * factor,
            z: self.z * factor,
        }
    }

    pub fn add(self, other: Vec3) -> Vec3 {
        Vec3 {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
        }
    }

    pub fn distance(self, other: Vec3) -> f32 {
        let d = self.sub(other);
        (d.x * d.x + d.y * d.y + d.z * d.z).sqrt()
    }
}

/// Controller state sent with `Packet::PlayerInput`. The server clamps every
/// component on receipt, so a stored `InputState` is always within range:
/// forward/turn in [-1, 1], brake in [0, 1].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct InputState {
    pub forward: f32,
    pub turn: f32,
    pub brake: f32,
}

impl InputState {
    pub fn clamped(self) -> Self {
        Self {
            forward: self.forward.clamp(-1.0, 1.0),
            turn: self.turn.clamp(-1.0, 1.0),
            brake: self.brake.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameMode {
    Ranked,
    Casual,
}

/// One member's kinematic state as captured at tick time.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerSnapshot {
    pub id: u32,
    pub position: Vec3,
    pub rotation: Vec3,
    pub speed: f32,
}

/// Lightweight identity pair sent in `MatchFound`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerInfo {
    pub id: u32,
    pub username: String,
}

/// Per-player outcome submitted with `FinishRace` and echoed in `RaceFinished`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RaceResult {
    pub player_id: u32,
    pub position: u32,
    pub points: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    // Client -> server
    Register {
        username: String,
    },
    RestoreSession {
        player_id: u32,
    },
    JoinMatchmaking {
        mode: GameMode,
    },
    LeaveMatchmaking {
        mode: GameMode,
    },
    PlayerInput {
        forward: f32,
        turn: f32,
        brake: f32,
    },
    PositionUpdate {
        position: Vec3,
        rotation: Vec3,
        speed: f32,
        latency: u64,
    },
    ChatMessage {
        room: u32,
        message: String,
    },
    StartRace {
        room: u32,
    },
    FinishRace {
        room: u32,
        results: Vec<RaceResult>,
    },
    Ping,
    Disconnect,

    // Server -> client
    RegisterSuccess {
        player_id: u32,
    },
    SessionRestored {
        player_id: u32,
        room_id: Option<u32>,
    },
    Rejected {
        reason: String,
    },
    MatchmakingStatus {
        queue_position: usize,
        queue_size: usize,
    },
    LeftMatchmaking,
    MatchFound {
        room_id: u32,
        players: Vec<PlayerInfo>,
    },
    RaceStarted {
        timestamp: u64,
        duration_secs: u64,
    },
    PlayerStateUpdate {
        player_id: u32,
        position: Vec3,
        rotation: Vec3,
        speed: f32,
        timestamp: u64,
    },
    GameStateUpdate {
        timestamp: u64,
        players: Vec<PlayerSnapshot>,
    },
    RaceFinished {
        results: Vec<RaceResult>,
        timestamp: u64,
    },
    PlayerDisconnected {
        player_id: u32,
        username: String,
    },
    ChatRelayed {
        player_id: u32,
        username: String,
        message: String,
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_input_clamping() {
        let raw = InputState {
            forward: 3.5,
            turn: -2.0,
            brake: -0.5,
        };
        let clamped = raw.clamped();

        assert_eq!(clamped.forward, 1.0);
        assert_eq!(clamped.turn, -1.0);
        assert_eq!(clamped.brake, 0.0);
    }

    #[test]
    fn test_input_clamping_idempotent() {
        let raw = InputState {
            forward: -7.0,
            turn: 0.3,
            brake: 1.8,
        };
        let once = raw.clamped();
        let twice = once.clamped();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_input_in_range_unchanged() {
        let input = InputState {
            forward: 0.5,
            turn: -0.25,
            brake: 1.0,
        };
        assert_eq!(input, input.clamped());
    }

    #[test]
    fn test_vec3_lerp_endpoints() {
        let a = Vec3::new(0.0, 1.0, 2.0);
        let b = Vec3::new(10.0, 11.0, 12.0);

        assert_eq!(a.lerp(b, 0.0), a);
        assert_eq!(a.lerp(b, 1.0), b);
    }

    #[test]
    fn test_vec3_lerp_midpoint() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(4.0, -4.0, 8.0);
        let mid = a.lerp(b, 0.5);

        assert_approx_eq!(mid.x, 2.0);
        assert_approx_eq!(mid.y, -2.0);
        assert_approx_eq!(mid.z, 4.0);
    }

    #[test]
    fn test_vec3_distance() {
        let a = Vec3::new(1.0, 2.0, 2.0);
        let b = Vec3::new(1.0, 0.0, 0.0);
        assert_approx_eq!(a.distance(b), (8.0f32).sqrt());
    }

    #[test]
    fn test_packet_serialization_register() {
        let packet = Packet::Register {
            username: "turbo".to_string(),
        };
        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Register { username } => assert_eq!(username, "turbo"),
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_position_update() {
        let packet = Packet::PositionUpdate {
            position: Vec3::new(12.0, 1.0, -4.5),
            rotation: Vec3::new(0.0, 1.57, 0.0),
            speed: 42.5,
            latency: 38,
        };
        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::PositionUpdate {
                position,
                rotation,
                speed,
                latency,
            } => {
                assert_eq!(position, Vec3::new(12.0, 1.0, -4.5));
                assert_eq!(rotation, Vec3::new(0.0, 1.57, 0.0));
                assert_eq!(speed, 42.5);
                assert_eq!(latency, 38);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_game_state() {
        let players = vec![
            PlayerSnapshot {
                id: 1,
                position: Vec3::new(0.0, 1.0, 0.0),
                rotation: Vec3::default(),
                speed: 0.0,
            },
            PlayerSnapshot {
                id: 2,
                position: Vec3::new(5.0, 1.0, 3.0),
                rotation: Vec3::default(),
                speed: 18.0,
            },
        ];

        let packet = Packet::GameStateUpdate {
            timestamp: 123456789,
            players,
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::GameStateUpdate { timestamp, players } => {
                assert_eq!(timestamp, 123456789);
                assert_eq!(players.len(), 2);
                assert_eq!(players[0].id, 1);
                assert_eq!(players[1].id, 2);
                assert_eq!(players[1].speed, 18.0);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_race_result_roundtrip() {
        let packet = Packet::RaceFinished {
            results: vec![
                RaceResult {
                    player_id: 3,
                    position: 1,
                    points: 100,
                },
                RaceResult {
                    player_id: 7,
                    position: 2,
                    points: 60,
                },
            ],
            timestamp: 42,
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::RaceFinished { results, timestamp } => {
                assert_eq!(timestamp, 42);
                assert_eq!(results[0].position, 1);
                assert_eq!(results[1].player_id, 7);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }
}
