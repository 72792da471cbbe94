//! Core schedule data model: versions, participants, routes, queries,
//! patches, and inconsistency reports.

pub mod inconsistency;
pub mod participant;
pub mod patch;
pub mod profile;
pub mod query;
pub mod route;
pub mod version;

pub use inconsistency::{InconsistencyRanges, VersionRange, missing_ranges};
pub use participant::{ParticipantDescription, ParticipantId, Responsiveness};
pub use patch::{
    Cull, ItineraryChange, ParticipantEffect, ParticipantPatch, Patch, VersionedChange,
};
pub use profile::{CircleSweep, CollisionProfile, ConflictEvaluator};
pub use query::{ParticipantFilter, Query, QueryId, TimeSpan};
pub use route::{InvalidRoute, Route, RouteId, Time, Trajectory, Waypoint};
pub use version::{DatabaseVersion, ItineraryVersion, NodeVersion, modular_le, modular_lt};
