//! Participant identity and self-description.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::profile::CollisionProfile;

/// Stable identifier for one mobile agent. Assigned at registration and
/// retired when the participant unregisters.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ParticipantId(u64);

impl ParticipantId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether the participant can react to conflicts. Two mutually
/// unresponsive participants never trigger a negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Responsiveness {
    Responsive,
    Unresponsive,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipantDescription {
    pub owner: String,
    pub name: String,
    pub responsiveness: Responsiveness,
    pub profile: CollisionProfile,
}

impl ParticipantDescription {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        responsiveness: Responsiveness,
        profile: CollisionProfile,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            responsiveness,
            profile,
        }
    }

    /// The durable identity key. Re-registering the same key yields the same
    /// participant id with an updated description.
    pub fn key(&self) -> (String, String) {
        (self.owner.clone(), self.name.clone())
    }

    pub fn is_unresponsive(&self) -> bool {
        self.responsiveness == Responsiveness::Unresponsive
    }
}
