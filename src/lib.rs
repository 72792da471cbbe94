#![forbid(unsafe_code)]

//! Wayline: a traffic schedule coordination service for fleets of mobile
//! robots. Participants publish versioned itineraries into a central
//! database; mirrors follow it through incremental patches; detected
//! conflicts open negotiations that always end in a definite conclusion.

pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod negotiation;
pub mod participant;
pub mod queries;
pub mod registry;
pub mod service;
pub mod telemetry;
pub mod transport;
pub mod writer;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most integrations touch.
pub use crate::core::{
    CircleSweep, CollisionProfile, ConflictEvaluator, DatabaseVersion, InconsistencyRanges,
    ItineraryVersion, NodeVersion, ParticipantDescription, ParticipantId, Patch, Query, QueryId,
    Responsiveness, Route, RouteId, Time, Trajectory, VersionRange, Waypoint,
};
pub use crate::negotiation::{ConflictSet, NegotiationVersion};
pub use crate::participant::Participant;
pub use crate::registry::Registration;
pub use crate::service::ScheduleService;
pub use crate::transport::Bus;
pub use crate::writer::Writer;
