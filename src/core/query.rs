//! Saved query predicates over the schedule.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::participant::ParticipantId;
use super::route::{Route, Time};

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct QueryId(u64);

impl QueryId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open interest window over route times. `None` bounds are unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSpan {
    #[serde(with = "time::serde::rfc3339::option")]
    pub lower: Option<Time>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub upper: Option<Time>,
}

impl TimeSpan {
    pub fn all() -> Self {
        Self::default()
    }

    /// True when the route's time span overlaps the window.
    pub fn overlaps(&self, route: &Route) -> bool {
        if let Some(lower) = self.lower
            && route.trajectory.finish_time() < lower
        {
            return false;
        }
        if let Some(upper) = self.upper
            && route.trajectory.start_time() > upper
        {
            return false;
        }
        true
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantFilter {
    #[default]
    All,
    Include(Vec<ParticipantId>),
    Exclude(Vec<ParticipantId>),
}

impl ParticipantFilter {
    pub fn matches(&self, id: ParticipantId) -> bool {
        match self {
            ParticipantFilter::All => true,
            ParticipantFilter::Include(ids) => ids.contains(&id),
            ParticipantFilter::Exclude(ids) => !ids.contains(&id),
        }
    }
}

/// Predicate on (maps, time window, participants). Two queries with equal
/// predicates share a registration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// `None` matches every map.
    pub maps: Option<Vec<String>>,
    pub span: TimeSpan,
    pub participants: ParticipantFilter,
}

impl Query {
    /// Matches everything; the conflict detector mirrors through this.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_maps(maps: Vec<String>) -> Self {
        Self {
            maps: Some(maps),
            ..Self::default()
        }
    }

    pub fn matches_participant(&self, id: ParticipantId) -> bool {
        self.participants.matches(id)
    }

    pub fn matches_route(&self, route: &Route) -> bool {
        if let Some(maps) = &self.maps
            && !maps.iter().any(|m| *m == route.map)
        {
            return false;
        }
        self.span.overlaps(route)
    }
}
