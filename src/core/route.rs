//! Routes and timed trajectories.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// Wall-clock instant used throughout the schedule.
pub type Time = OffsetDateTime;

/// Identifies one route within a participant's itinerary. Assigned by the
/// participant and never reused within its lifetime.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RouteId(u64);

impl RouteId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    #[serde(with = "time::serde::rfc3339")]
    pub time: Time,
    pub position: [f64; 2],
}

impl Waypoint {
    pub fn new(time: Time, x: f64, y: f64) -> Self {
        Self {
            time,
            position: [x, y],
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvalidRoute {
    #[error("route map name must not be empty")]
    EmptyMapName,
    #[error("trajectory needs at least two waypoints, got {got}")]
    TooFewWaypoints { got: usize },
    #[error("trajectory times must strictly increase (waypoint {index})")]
    NonMonotonicTime { index: usize },
    #[error("waypoint {index} has a non-finite position")]
    NonFinitePosition { index: usize },
}

/// A timed geometric curve. Always holds at least two waypoints with
/// strictly increasing times.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Waypoint>", into = "Vec<Waypoint>")]
pub struct Trajectory {
    waypoints: Vec<Waypoint>,
}

impl Trajectory {
    pub fn new(waypoints: Vec<Waypoint>) -> Result<Self, InvalidRoute> {
        if waypoints.len() < 2 {
            return Err(InvalidRoute::TooFewWaypoints {
                got: waypoints.len(),
            });
        }
        for (index, pair) in waypoints.windows(2).enumerate() {
            if pair[1].time <= pair[0].time {
                return Err(InvalidRoute::NonMonotonicTime { index: index + 1 });
            }
        }
        for (index, wp) in waypoints.iter().enumerate() {
            if !wp.position.iter().all(|c| c.is_finite()) {
                return Err(InvalidRoute::NonFinitePosition { index });
            }
        }
        Ok(Self { waypoints })
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn start_time(&self) -> Time {
        self.waypoints.first().expect("trajectory is never empty").time
    }

    pub fn finish_time(&self) -> Time {
        self.waypoints.last().expect("trajectory is never empty").time
    }

    /// Shift every waypoint by `delay`. Ordering is unaffected.
    pub fn shift(&mut self, delay: Duration) {
        for wp in &mut self.waypoints {
            wp.time += delay;
        }
    }

    /// Linearly interpolated position at `t`, or None outside the time span.
    pub fn position_at(&self, t: Time) -> Option<[f64; 2]> {
        if t < self.start_time() || t > self.finish_time() {
            return None;
        }
        let after = self.waypoints.iter().position(|wp| wp.time >= t)?;
        if self.waypoints[after].time == t || after == 0 {
            return Some(self.waypoints[after].position);
        }
        let a = &self.waypoints[after - 1];
        let b = &self.waypoints[after];
        let span = (b.time - a.time).as_seconds_f64();
        let s = (t - a.time).as_seconds_f64() / span;
        Some([
            a.position[0] + s * (b.position[0] - a.position[0]),
            a.position[1] + s * (b.position[1] - a.position[1]),
        ])
    }
}

impl TryFrom<Vec<Waypoint>> for Trajectory {
    type Error = InvalidRoute;

    fn try_from(waypoints: Vec<Waypoint>) -> Result<Self, InvalidRoute> {
        Trajectory::new(waypoints)
    }
}

impl From<Trajectory> for Vec<Waypoint> {
    fn from(trajectory: Trajectory) -> Vec<Waypoint> {
        trajectory.waypoints
    }
}

/// One timed trajectory on a named map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    pub map: String,
    pub trajectory: Trajectory,
}

impl Route {
    pub fn new(id: RouteId, map: impl Into<String>, trajectory: Trajectory) -> Self {
        Self {
            id,
            map: map.into(),
            trajectory,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidRoute> {
        if self.map.is_empty() {
            return Err(InvalidRoute::EmptyMapName);
        }
        Ok(())
    }

    pub fn finish_time(&self) -> Time {
        self.trajectory.finish_time()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn t(seconds: i64) -> Time {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(seconds)
    }

    /// Straight-line route from `(x0, y0)` to `(x1, y1)` over `[start, end]`.
    pub fn line_route(
        id: u64,
        map: &str,
        start: i64,
        end: i64,
        from: (f64, f64),
        to: (f64, f64),
    ) -> Route {
        let trajectory = Trajectory::new(vec![
            Waypoint::new(t(start), from.0, from.1),
            Waypoint::new(t(end), to.0, to.1),
        ])
        .expect("valid line trajectory");
        Route::new(RouteId::new(id), map, trajectory)
    }
}
