//! Reconnection supervision with exponential backoff
//!
//! The controller tracks where the client is in the connect/lose/retry
//! cycle and remembers the last granted player id, so a successful retry
//! can ask the server for a session restore instead of a fresh identity.

use log::{info, warn};
use std::time::Duration;

pub const MAX_ATTEMPTS: u32 = 5;
pub const BASE_BACKOFF_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

pub struct ReconnectController {
    state: ConnectionState,
    max_attempts: u32,
    base_backoff: Duration,
    saved_player_id: Option<u32>,
}

impl ReconnectController {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            max_attempts,
            base_backoff: Duration::from_millis(BASE_BACKOFF_MS),
            saved_player_id: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The identity to restore with, once a retry gets through.
    pub fn saved_player_id(&self) -> Option<u32> {
        self.saved_player_id
    }

    /// Records a live session. Resets the retry counter: a connection that
    /// came back is healthy again, however many attempts it took.
    pub fn mark_connected(&mut self, player_id: u32) {
        self.state = ConnectionState::Connected;
        self.saved_player_id = Some(player_id);
    }

    /// Advances the retry cycle after a lost connection or a failed attempt.
    ///
    /// Returns how long to wait before the next attempt, doubling each time
    /// (`base * 2^(attempt-1)`), or `None` once the attempt budget is spent
    /// and the controller parks in `Failed`.
    pub fn connection_lost(&mut self) -> Option<Duration> {
        let attempt = match self.state {
            ConnectionState::Reconnecting { attempt } => attempt + 1,
            ConnectionState::Failed => return None,
            _ => 1,
        };

        if attempt > self.max_attempts {
            warn!("Giving up after {} reconnect attempts", self.max_attempts);
            self.state = ConnectionState::Failed;
            return None;
        }

        self.state = ConnectionState::Reconnecting { attempt };
        let delay = self.base_backoff * 2u32.pow(attempt - 1);
        info!(
            "Connection lost, retry {}/{} in {:?}",
            attempt, self.max_attempts, delay
        );
        Some(delay)
    }

    /// Drops the saved identity, for a deliberate disconnect.
    pub fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.saved_player_id = None;
    }
}
