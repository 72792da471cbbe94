//! Incremental patches between two database versions.

use serde::{Deserialize, Serialize};
use time::Duration;

use super::participant::ParticipantId;
use super::route::{Route, RouteId, Time};
use super::version::{DatabaseVersion, ItineraryVersion};

/// One itinerary mutation. `Replace` carries the full route set and
/// supersedes everything before it; the others are relative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItineraryChange {
    Replace { routes: Vec<Route> },
    Extend { routes: Vec<Route> },
    Delay { delay: Duration },
    Erase { routes: Vec<RouteId> },
    Clear,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedChange {
    pub version: ItineraryVersion,
    pub change: ItineraryChange,
}

/// What happened to one participant inside a patch window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantEffect {
    /// Ordered changes to apply on top of the mirror's state.
    Updates(Vec<VersionedChange>),
    /// The participant unregistered; drop it from the mirror.
    Retired,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipantPatch {
    pub participant: ParticipantId,
    pub effect: ParticipantEffect,
}

/// Marker telling mirrors to drop routes that finished before `before`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cull {
    #[serde(with = "time::serde::rfc3339")]
    pub before: Time,
}

/// Ordered per-participant deltas covering `(base, latest]`. `base == None`
/// means a full snapshot that resets the receiving mirror.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub base: Option<DatabaseVersion>,
    pub latest: DatabaseVersion,
    pub participants: Vec<ParticipantPatch>,
    pub cull: Option<Cull>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty() && self.cull.is_none()
    }
}
