//! Lag compensation for remote racers
//!
//! Remote state arrives as timestamped samples at network cadence; rendering
//! wants a value for an arbitrary point in time. The compensator keeps a
//! bounded history per entity and answers queries slightly in the past
//! (`INTERPOLATION_DELAY_MS`), so it can interpolate between two real
//! samples instead of guessing ahead.

use log::debug;
use shared::{Vec3, INTERPOLATION_DELAY_MS, STATE_HISTORY_CAPACITY};
use std::collections::{HashMap, VecDeque};

/// History entries older than this are considered dead traffic.
pub const STALE_AFTER_MS: u64 = 3_000;

/// One remote state sample, stamped with the server's send time.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSample {
    pub position: Vec3,
    pub rotation: Vec3,
    pub speed: f32,
    pub timestamp: u64,
}

/// Per-entity ring of recent samples, newest last.
pub struct LagCompensator {
    histories: HashMap<u32, VecDeque<StateSample>>,
    interpolation_delay_ms: u64,
}

impl Default for LagCompensator {
    fn default() -> Self {
        Self::new()
    }
}

impl LagCompensator {
    pub fn new() -> Self {
        Self {
            histories: HashMap::new(),
            interpolation_delay_ms: INTERPOLATION_DELAY_MS,
        }
    }

    /// Stores a sample. Samples are kept in timestamp order: anything not
    /// newer than the latest stored sample is a late duplicate and dropped.
    pub fn record(&mut self, entity: u32, sample: StateSample) {
        let history = self.histories.entry(entity).or_default();

        if let Some(last) = history.back() {
            if sample.timestamp <= last.timestamp {
                debug!(
                    "Dropping out-of-order sample for entity {} ({} <= {})",
                    entity, sample.timestamp, last.timestamp
                );
                return;
            }
        }

        history.push_back(sample);
        while history.len() > STATE_HISTORY_CAPACITY {
            history.pop_front();
        }
    }

    /// State for `entity` at `now_ms` minus the interpolation delay.
    ///
    /// With the render time between two samples the result is a linear blend
    /// of the pair; an exact timestamp hit returns that sample. A render
    /// time past the newest sample falls back to the newest rather than
    /// guessing. Fewer than two samples is not enough to interpolate.
    pub fn interpolate(&self, entity: u32, now_ms: u64) -> Option<StateSample> {
        let history = self.histories.get(&entity)?;
        if history.len() < 2 {
            return None;
        }

        let render_time = now_ms.saturating_sub(self.interpolation_delay_ms);

        let newest = history.back()?;
        if render_time >= newest.timestamp {
            return Some(newest.clone());
        }

        for pair in history.iter().zip(history.iter().skip(1)) {
            let (before, after) = pair;
            if before.timestamp <= render_time && render_time <= after.timestamp {
                let span = (after.timestamp - before.timestamp) as f32;
                let t = (render_time - before.timestamp) as f32 / span;
                return Some(StateSample {
                    position: before.position.lerp(after.position, t),
                    rotation: before.rotation.lerp(after.rotation, t),
                    speed: before.speed + (after.speed - before.speed) * t,
                    timestamp: render_time,
                });
            }
        }

        // No bracket means the render target predates the whole history;
        // the latest known state is still the best answer.
        Some(newest.clone())
    }

    /// Projects the entity `horizon_ms` past its newest sample using the
    /// velocity implied by the last two samples. Needs two samples.
    pub fn extrapolate(&self, entity: u32, horizon_ms: u64) -> Option<StateSample> {
        let history = self.histories.get(&entity)?;
        let len = history.len();
        if len < 2 {
            return None;
        }

        let prev = &history[len - 2];
        let last = &history[len - 1];
        let dt = (last.timestamp - prev.timestamp) as f32;
        if dt <= 0.0 {
            return Some(last.clone());
        }

        let scale = horizon_ms as f32 / dt;
        let velocity = last.position.sub(prev.position);
        Some(StateSample {
            position: last.position.add(velocity.scale(scale)),
            rotation: last.rotation,
            speed: last.speed,
            timestamp: last.timestamp + horizon_ms,
        })
    }

    /// Drops every entity whose newest sample is older than `STALE_AFTER_MS`.
    pub fn clear_stale(&mut self, now_ms: u64) {
        self.histories.retain(|entity, history| {
            let fresh = history
                .back()
                .map(|s| now_ms.saturating_sub(s.timestamp) <= STALE_AFTER_MS)
                .unwrap_or(false);
            if !fresh {
                debug!("Clearing stale history for entity {}", entity);
            }
            fresh
        });
    }

    pub fn remove(&mut self, entity: u32) {
        self.histories.remove(&entity);
    }

    pub fn sample_count(&self, entity: u32) -> usize {
        self.histories.get(&entity).map_or(0, |h| h.len())
    }

    pub fn tracked_entities(&self) -> usize {
        self.histories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn sample(x: f32, timestamp: u64) -> StateSample {
        StateSample {
            position: Vec3::new(x, 0.0, 0.0),
            rotation: Vec3::default(),
            speed: x,
            timestamp,
        }
    }

    #[test]
    fn test_interpolates_midway_between_samples() {
        let mut comp = LagCompensator::new();
        comp.record(1, sample(0.0, 1000));
        comp.record(1, sample(10.0, 1100));

        // Render time 1050 after the 100ms delay.
        let state = comp.interpolate(1, 1150).unwrap();
        assert_approx_eq!(state.position.x, 5.0);
        assert_approx_eq!(state.speed, 5.0);
    }

    #[test]
    fn test_exact_timestamp_returns_sample() {
        let mut comp = LagCompensator::new();
        comp.record(1, sample(0.0, 1000));
        comp.record(1, sample(10.0, 1100));

        let state = comp.interpolate(1, 1100).unwrap();
        assert_approx_eq!(state.position.x, 0.0);
    }

    #[test]
    fn test_single_sample_is_not_enough() {
        let mut comp = LagCompensator::new();
        comp.record(1, sample(0.0, 1000));
        assert!(comp.interpolate(1, 1150).is_none());
        assert!(comp.extrapolate(1, 50).is_none());
    }

    #[test]
    fn test_render_time_past_newest_falls_back() {
        let mut comp = LagCompensator::new();
        comp.record(1, sample(0.0, 1000));
        comp.record(1, sample(10.0, 1100));

        let state = comp.interpolate(1, 5000).unwrap();
        assert_approx_eq!(state.position.x, 10.0);
    }

    #[test]
    fn test_render_time_before_history_uses_latest() {
        let mut comp = LagCompensator::new();
        comp.record(1, sample(0.0, 1000));
        comp.record(1, sample(10.0, 1100));

        // Render target 950 predates the oldest sample; fall back to the
        // most recent known state, never a rewind.
        let state = comp.interpolate(1, 1050).unwrap();
        assert_approx_eq!(state.position.x, 10.0);
    }

    #[test]
    fn test_out_of_order_sample_dropped() {
        let mut comp = LagCompensator::new();
        comp.record(1, sample(0.0, 1000));
        comp.record(1, sample(10.0, 1100));
        comp.record(1, sample(99.0, 1050));

        assert_eq!(comp.sample_count(1), 2);
        let state = comp.interpolate(1, 1200).unwrap();
        assert_approx_eq!(state.position.x, 10.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut comp = LagCompensator::new();
        for i in 0..(STATE_HISTORY_CAPACITY as u64 + 40) {
            comp.record(1, sample(i as f32, 1000 + i * 16));
        }

        assert_eq!(comp.sample_count(1), STATE_HISTORY_CAPACITY);
        // Oldest samples evicted first; interpolation still works at the
        // fresh end of the window.
        let newest_ts = 1000 + (STATE_HISTORY_CAPACITY as u64 + 39) * 16;
        assert!(comp.interpolate(1, newest_ts).is_some());
    }

    #[test]
    fn test_extrapolation_continues_velocity() {
        let mut comp = LagCompensator::new();
        comp.record(1, sample(0.0, 1000));
        comp.record(1, sample(10.0, 1100));

        // 10 units per 100ms, projected 50ms further.
        let state = comp.extrapolate(1, 50).unwrap();
        assert_approx_eq!(state.position.x, 15.0);
        assert_eq!(state.timestamp, 1150);
    }

    #[test]
    fn test_clear_stale_drops_quiet_entities() {
        let mut comp = LagCompensator::new();
        comp.record(1, sample(0.0, 1000));
        comp.record(2, sample(0.0, 4500));

        comp.clear_stale(5000);
        assert_eq!(comp.sample_count(1), 0);
        assert_eq!(comp.sample_count(2), 1);
        assert_eq!(comp.tracked_entities(), 1);
    }

    #[test]
    fn test_entities_tracked_independently() {
        let mut comp = LagCompensator::new();
        comp.record(1, sample(0.0, 1000));
        comp.record(1, sample(10.0, 1100));
        comp.record(2, sample(100.0, 1000));
        comp.record(2, sample(80.0, 1100));

        let a = comp.interpolate(1, 1150).unwrap();
        let b = comp.interpolate(2, 1150).unwrap();
        assert_approx_eq!(a.position.x, 5.0);
        assert_approx_eq!(b.position.x, 90.0);
    }
}
