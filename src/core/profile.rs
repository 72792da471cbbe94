//! Collision profiles and the geometric conflict-detection contract.
//!
//! The schedule service never reasons about geometry itself: it hands two
//! profile/trajectory pairs to a [`ConflictEvaluator`] and trusts the verdict.
//! [`CircleSweep`] is the stock evaluator used by the conflict detector.

use serde::{Deserialize, Serialize};
use time::Duration;

use super::route::Trajectory;

/// The space a participant occupies while moving, reduced to a swept circle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollisionProfile {
    pub footprint_radius: f64,
}

impl CollisionProfile {
    pub fn with_radius(footprint_radius: f64) -> Self {
        Self { footprint_radius }
    }
}

impl Default for CollisionProfile {
    fn default() -> Self {
        Self {
            footprint_radius: 0.5,
        }
    }
}

/// Decides whether two timed trajectories physically collide.
pub trait ConflictEvaluator: Send + Sync {
    fn between(
        &self,
        profile_a: &CollisionProfile,
        trajectory_a: &Trajectory,
        profile_b: &CollisionProfile,
        trajectory_b: &Trajectory,
    ) -> bool;
}

/// Sampled proximity check: walk the shared time window at a fixed period and
/// flag a conflict when the interpolated footprints overlap.
#[derive(Clone, Copy, Debug)]
pub struct CircleSweep {
    pub sample_period: Duration,
}

impl Default for CircleSweep {
    fn default() -> Self {
        Self {
            sample_period: Duration::milliseconds(250),
        }
    }
}

impl ConflictEvaluator for CircleSweep {
    fn between(
        &self,
        profile_a: &CollisionProfile,
        trajectory_a: &Trajectory,
        profile_b: &CollisionProfile,
        trajectory_b: &Trajectory,
    ) -> bool {
        let start = trajectory_a.start_time().max(trajectory_b.start_time());
        let end = trajectory_a.finish_time().min(trajectory_b.finish_time());
        if end < start {
            return false;
        }

        let threshold = profile_a.footprint_radius + profile_b.footprint_radius;
        let threshold_sq = threshold * threshold;

        let mut t = start;
        loop {
            if let (Some(a), Some(b)) = (trajectory_a.position_at(t), trajectory_b.position_at(t)) {
                let dx = a[0] - b[0];
                let dy = a[1] - b[1];
                if dx * dx + dy * dy <= threshold_sq {
                    return true;
                }
            }
            if t >= end {
                return false;
            }
            t = (t + self.sample_period).min(end);
        }
    }
}
