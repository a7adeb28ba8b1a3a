//! Long-lived rating records, one per player
//!
//! In-memory repository satisfying the persistence contract: a race's rating
//! output is applied here before the matchmaking pool can read the player's
//! skill again. The wire/storage format is private to this module.

use crate::rating::{self, RatingUpdate};
use log::debug;
use serde::Serialize;
use shared::BASE_RATING;
use std::collections::HashMap;

const MATCH_HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct MatchEntry {
    pub room_id: u32,
    pub position: u32,
    pub rating_change: i32,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RatingRecord {
    pub rating: i32,
    pub tier: &'static str,
    pub rating_history: Vec<i32>,
    pub matches: u32,
    pub wins: u32,
    pub losses: u32,
    pub match_history: Vec<MatchEntry>,
}

impl RatingRecord {
    fn new() -> Self {
        Self {
            rating: BASE_RATING,
            tier: rating::tier_of(BASE_RATING).name,
            rating_history: vec![BASE_RATING],
            matches: 0,
            wins: 0,
            losses: 0,
            match_history: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct ProfileStore {
    records: HashMap<u32, RatingRecord>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    pub fn record(&self, player_id: u32) -> Option<&RatingRecord> {
        self.records.get(&player_id)
    }

    /// Current skill rating, defaulting to the base for unseen players.
    /// This is what the matchmaking pool reads.
    pub fn rating_of(&self, player_id: u32) -> i32 {
        self.records
            .get(&player_id)
            .map(|r| r.rating)
            .unwrap_or(BASE_RATING)
    }

    /// Applies one race outcome. Creates the record on first contact.
    pub fn apply(
        &mut self,
        player_id: u32,
        room_id: u32,
        position: u32,
        update: RatingUpdate,
        timestamp: u64,
    ) {
        let record = self.records.entry(player_id).or_insert_with(RatingRecord::new);

        record.rating = update.new_rating;
        record.tier = rating::tier_of(update.new_rating).name;
        record.rating_history.push(update.new_rating);
        record.matches += 1;
        if position == 1 {
            record.wins += 1;
        } else {
            record.losses += 1;
        }

        record.match_history.push(MatchEntry {
            room_id,
            position,
            rating_change: update.delta,
            timestamp,
        });
        if record.match_history.len() > MATCH_HISTORY_CAPACITY {
            record.match_history.remove(0);
        }

        debug!(
            "Player {} rating {} ({:+}), tier {}",
            player_id, record.rating, update.delta, record.tier
        );
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
