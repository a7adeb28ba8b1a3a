//! Matchmaking queues and the widening-radius pairing algorithm
//!
//! Two independent queues (ranked, casual) share one mechanism and differ
//! only in which one a request lands in. Pairing is non-blocking: a failed
//! attempt re-inserts the requester and is retried by the server's sweep
//! timer. "No match yet" is an expected condition, never an error.

use crate::rating;
use log::{debug, info};
use shared::GameMode;

/// Maximum skill-rating difference tolerated while a candidate is "fresh".
pub const SEARCH_RADIUS: i32 = 200;
/// After a candidate has waited half of this, the radius doubles.
pub const DEFAULT_MAX_WAIT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq)]
pub struct MatchmakingRequest {
    pub player_id: u32,
    pub skill_rating: i32,
    pub mode: GameMode,
    pub enqueued_at: u64,
}

/// Waiting requests for both game modes. Owns nothing but lightweight
/// requests referencing player ids.
pub struct MatchmakingPool {
    ranked: Vec<MatchmakingRequest>,
    casual: Vec<MatchmakingRequest>,
    room_size: usize,
}

impl MatchmakingPool {
    pub fn new(room_size: usize) -> Self {
        Self {
            ranked: Vec::new(),
            casual: Vec::new(),
            room_size,
        }
    }

    fn queue(&self, mode: GameMode) -> &Vec<MatchmakingRequest> {
        match mode {
            GameMode::Ranked => &self.ranked,
            GameMode::Casual => &self.casual,
        }
    }

    fn queue_mut(&mut self, mode: GameMode) -> &mut Vec<MatchmakingRequest> {
        match mode {
            GameMode::Ranked => &mut self.ranked,
            GameMode::Casual => &mut self.casual,
        }
    }

    /// Appends the request unless the player is already queued in that mode.
    /// A duplicate enqueue is a no-op, not an error; returns whether the
    /// request was actually added.
    pub fn enqueue(&mut self, request: MatchmakingRequest) -> bool {
        let queue = self.queue_mut(request.mode);
        if queue.iter().any(|r| r.player_id == request.player_id) {
            return false;
        }
        debug!(
            "Player {} queued ({:?}, rating {})",
            request.player_id, request.mode, request.skill_rating
        );
        queue.push(request);
        true
    }

    /// Removes the player's request; no-op if absent.
    pub fn dequeue(&mut self, player_id: u32, mode: GameMode) -> bool {
        let queue = self.queue_mut(mode);
        let before = queue.len();
        queue.retain(|r| r.player_id != player_id);
        queue.len() != before
    }

    pub fn contains(&self, player_id: u32, mode: GameMode) -> bool {
        self.queue(mode).iter().any(|r| r.player_id == player_id)
    }

    /// Zero-based position in the queue, for `matchmaking_status`.
    pub fn queue_position(&self, player_id: u32, mode: GameMode) -> Option<usize> {
        self.queue(mode).iter().position(|r| r.player_id == player_id)
    }

    pub fn len(&self, mode: GameMode) -> usize {
        self.queue(mode).len()
    }

    pub fn is_empty(&self, mode: GameMode) -> bool {
        self.queue(mode).is_empty()
    }

    /// Head-of-queue request for the server's periodic pairing sweep.
    pub fn head(&self, mode: GameMode) -> Option<MatchmakingRequest> {
        self.queue(mode).first().cloned()
    }

    /// Attempts to fill a room around `request`.
    ///
    /// The requester is removed up front. Remaining entries are eligible when
    /// their rating distance fits a radius that widens with their own wait:
    /// `SEARCH_RADIUS` for the first half of `max_wait_ms`, double afterward.
    /// The closest `room_size - 1` by absolute rating difference win, ties
    /// going to whoever queued earliest. On a short field the requester is
    /// re-inserted and `None` is returned.
    pub fn try_pair(
        &mut self,
        request: &MatchmakingRequest,
        now_ms: u64,
        max_wait_ms: u64,
    ) -> Option<Vec<u32>> {
        let needed = self.room_size.saturating_sub(1);
        let queue = self.queue_mut(request.mode);
        queue.retain(|r| r.player_id != request.player_id);

        let mut candidates: Vec<MatchmakingRequest> = queue
            .iter()
            .filter(|candidate| {
                let skill_diff = (candidate.skill_rating - request.skill_rating).abs();
                let waited = now_ms.saturating_sub(candidate.enqueued_at);
                let radius = if waited < max_wait_ms / 2 {
                    SEARCH_RADIUS
                } else {
                    SEARCH_RADIUS * 2
                };
                skill_diff < radius
            })
            .cloned()
            .collect();

        if candidates.len() < needed {
            self.queue_mut(request.mode).push(request.clone());
            return None;
        }

        candidates.sort_by_key(|c| {
            (
                (c.skill_rating - request.skill_rating).abs(),
                c.enqueued_at,
            )
        });
        candidates.truncate(needed);

        let queue = self.queue_mut(request.mode);
        for chosen in &candidates {
            queue.retain(|r| r.player_id != chosen.player_id);
        }

        let mut players = vec![request.player_id];
        players.extend(candidates.iter().map(|c| c.player_id));
        info!(
            "Paired {:?} room: {:?} (requester rating {})",
            request.mode, players, request.skill_rating
        );
        Some(players)
    }

    /// Display label for a rating, reusing the rating engine's tier bands.
    pub fn skill_bracket(rating: i32) -> &'static str {
        rating::tier_of(rating).name
    }
}
