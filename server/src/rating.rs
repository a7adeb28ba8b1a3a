//! Skill rating math for post-race updates
//!
//! Pure functions only: callers (the room finish path) are responsible for
//! persisting results through the profile store. The update follows the
//! logistic ELO formula against the mean opponent rating, with a linear
//! actual score over finishing positions and a K-factor scaled by the
//! spread of the opposing field.

use shared::BASE_RATING;

pub const K_FACTOR: f64 = 32.0;

/// Outcome of a single rating update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatingUpdate {
    pub new_rating: i32,
    pub delta: i32,
    pub expected_score: f64,
}

/// A named, contiguous band of ratings. The last tier is unbounded above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier {
    pub id: u8,
    pub name: &'static str,
    pub min: i32,
    pub max: i32,
}

const TOP_TIER_SPAN: i32 = 400;

pub const TIERS: [Tier; 5] = [
    Tier {
        id: 1,
        name: "Bronze Circuit",
        min: 0,
        max: 1200,
    },
    Tier {
        id: 2,
        name: "Silver Drift",
        min: 1200,
        max: 1400,
    },
    Tier {
        id: 3,
        name: "Gold Apex",
        min: 1400,
        max: 1600,
    },
    Tier {
        id: 4,
        name: "Plasma Elite",
        min: 1600,
        max: 1800,
    },
    Tier {
        id: 5,
        name: "Quantum Legend",
        min: 1800,
        max: i32::MAX,
    },
];

/// Computes the updated rating for one finisher.
///
/// `finish_position` is 1-based; `total_players` counts the whole field
/// including the player. A solo race (n = 1) is a degenerate no-op match
/// with an actual score of 1.0.
pub fn update(
    player_rating: i32,
    opponent_ratings: &[i32],
    finish_position: u32,
    total_players: u32,
) -> RatingUpdate {
    let avg_opponent = if opponent_ratings.is_empty() {
        BASE_RATING as f64
    } else {
        opponent_ratings.iter().map(|&r| r as f64).sum::<f64>() / opponent_ratings.len() as f64
    };

    let expected_score = expected(player_rating, avg_opponent);
    let actual_score = actual(finish_position, total_players);

    // Facing a mixed-skill field raises the stakes: scale K by opponent
    // rating spread, capped at 1.5x.
    let variance = opponent_ratings
        .iter()
        .map(|&r| (r as f64 - avg_opponent).powi(2))
        .sum::<f64>()
        / opponent_ratings.len().max(1) as f64;
    let variance_bonus = (variance.sqrt() / 200.0).min(0.5);

    let k = K_FACTOR * (1.0 + variance_bonus);
    let delta = (k * (actual_score - expected_score)).round() as i32;

    RatingUpdate {
        new_rating: (player_rating + delta).max(0),
        delta,
        expected_score,
    }
}

fn expected(player_rating: i32, avg_opponent: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((avg_opponent - player_rating as f64) / 400.0))
}

/// Linear score over positions: first place 1.0, last place 0.0. Positions
/// beyond the field clamp to last place.
fn actual(finish_position: u32, total_players: u32) -> f64 {
    if total_players <= 1 {
        return 1.0;
    }
    let position = finish_position.clamp(1, total_players);
    (total_players - position) as f64 / (total_players - 1) as f64
}

/// Returns the first tier whose band contains `rating`. Negative ratings
/// cannot occur (updates floor at zero) but map to the bottom tier anyway.
pub fn tier_of(rating: i32) -> Tier {
    TIERS
        .iter()
        .copied()
        .find(|t| rating >= t.min && rating < t.max)
        .unwrap_or(TIERS[0])
}

/// Fraction of the current tier already covered, in [0, 1]. The unbounded
/// top tier is treated as a 400-point span for display purposes.
pub fn tier_progress(rating: i32) -> f64 {
    let tier = tier_of(rating);
    let max = if tier.max == i32::MAX {
        tier.min + TOP_TIER_SPAN
    } else {
        tier.max
    };
    (((rating - tier.min) as f64) / ((max - tier.min) as f64)).clamp(0.0, 1.0)
}

pub fn points_until_next_tier(rating: i32) -> i32 {
    let tier = tier_of(rating);
    let max = if tier.max == i32::MAX {
        tier.min + TOP_TIER_SPAN
    } else {
        tier.max
    };
    (max - rating).max(0)
}

pub fn win_rate(wins: u32, total_matches: u32) -> f64 {
    if total_matches == 0 {
        0.0
    } else {
        wins as f64 / total_matches as f64 * 100.0
    }
}
