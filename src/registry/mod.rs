//! Durable participant identity: (owner, name) to id, with the high-water
//! marks a restarted participant needs to resume its versioned edit stream.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::core::{ItineraryVersion, ParticipantDescription, ParticipantId, RouteId};

pub mod log;

use log::{LogRecord, RegistryLog};

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The log failed to decode beyond a clean truncated tail. Fatal at
    /// startup; operators must repair or discard the file.
    #[error("participant registry log {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    /// The log could not be read or extended. Fatal for the request that
    /// needed the append, not for the service.
    #[error("participant registry log unavailable: {0}")]
    Unavailable(#[source] std::io::Error),
}

/// What a writer gets back from registration: its id and where its version
/// counters left off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registration {
    pub id: ParticipantId,
    pub last_itinerary_version: ItineraryVersion,
    pub last_route_id: RouteId,
}

#[derive(Clone, Debug)]
struct StoredParticipant {
    description: ParticipantDescription,
    last_itinerary_version: ItineraryVersion,
    last_route_id: RouteId,
}

pub struct ParticipantRegistry {
    log: RegistryLog,
    by_key: BTreeMap<(String, String), ParticipantId>,
    stored: BTreeMap<ParticipantId, StoredParticipant>,
    next_id: u64,
}

impl ParticipantRegistry {
    /// Load the registry from `path`, replaying the identity log.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let (log, records) = RegistryLog::open(path)?;

        let mut registry = Self {
            log,
            by_key: BTreeMap::new(),
            stored: BTreeMap::new(),
            next_id: 0,
        };
        let replayed = records.len();
        for record in records {
            registry.restore(record, path)?;
        }
        info!(
            path = %path.display(),
            participants = registry.stored.len(),
            records = replayed,
            "loaded participant registry"
        );
        Ok(registry)
    }

    /// Idempotent on (owner, name): an existing identity keeps its id and
    /// high-water marks while the stored description is overwritten.
    pub fn add_or_retrieve(
        &mut self,
        description: ParticipantDescription,
    ) -> Result<Registration, RegistryError> {
        if let Some(&id) = self.by_key.get(&description.key()) {
            self.log.append(&LogRecord::Update {
                id,
                description: description.clone(),
            })?;
            let stored = self
                .stored
                .get_mut(&id)
                .expect("keyed participant has a stored record");
            stored.description = description;
            return Ok(Registration {
                id,
                last_itinerary_version: stored.last_itinerary_version,
                last_route_id: stored.last_route_id,
            });
        }

        let id = ParticipantId::new(self.next_id);
        self.log.append(&LogRecord::Add {
            id,
            description: description.clone(),
        })?;
        self.next_id += 1;
        self.by_key.insert(description.key(), id);
        self.stored.insert(
            id,
            StoredParticipant {
                description,
                last_itinerary_version: ItineraryVersion::INITIAL,
                last_route_id: RouteId::default(),
            },
        );
        Ok(Registration {
            id,
            last_itinerary_version: ItineraryVersion::INITIAL,
            last_route_id: RouteId::default(),
        })
    }

    /// Record the marks reached by an accepted edit.
    pub fn advance(
        &mut self,
        id: ParticipantId,
        itinerary_version: ItineraryVersion,
        last_route_id: RouteId,
    ) -> Result<(), RegistryError> {
        let Some(stored) = self.stored.get_mut(&id) else {
            return Ok(());
        };
        if stored.last_itinerary_version == itinerary_version
            && stored.last_route_id == last_route_id
        {
            return Ok(());
        }
        self.log.append(&LogRecord::Advance {
            id,
            itinerary_version,
            last_route_id,
        })?;
        stored.last_itinerary_version = itinerary_version;
        stored.last_route_id = last_route_id;
        Ok(())
    }

    pub fn description(&self, id: ParticipantId) -> Option<&ParticipantDescription> {
        self.stored.get(&id).map(|s| &s.description)
    }

    /// Every known identity with its high-water marks, for restoring the
    /// database at startup.
    pub fn entries(&self) -> impl Iterator<Item = (ParticipantId, &ParticipantDescription, ItineraryVersion)> {
        self.stored
            .iter()
            .map(|(id, s)| (*id, &s.description, s.last_itinerary_version))
    }

    fn restore(&mut self, record: LogRecord, path: &Path) -> Result<(), RegistryError> {
        match record {
            LogRecord::Add { id, description } => {
                self.by_key.insert(description.key(), id);
                self.stored.insert(
                    id,
                    StoredParticipant {
                        description,
                        last_itinerary_version: ItineraryVersion::INITIAL,
                        last_route_id: RouteId::default(),
                    },
                );
                if self.next_id <= id.get() {
                    self.next_id = id.get() + 1;
                }
                Ok(())
            }
            LogRecord::Update { id, description } => {
                let stored = self.stored.get_mut(&id).ok_or_else(|| {
                    RegistryError::Corrupt {
                        path: path.to_path_buf(),
                        reason: format!("update for unknown participant [{id}]"),
                    }
                })?;
                self.by_key.insert(description.key(), id);
                stored.description = description;
                Ok(())
            }
            LogRecord::Advance {
                id,
                itinerary_version,
                last_route_id,
            } => {
                let stored = self.stored.get_mut(&id).ok_or_else(|| {
                    RegistryError::Corrupt {
                        path: path.to_path_buf(),
                        reason: format!("marks for unknown participant [{id}]"),
                    }
                })?;
                stored.last_itinerary_version = itinerary_version;
                stored.last_route_id = last_route_id;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CollisionProfile, Responsiveness};

    fn desc(name: &str, radius: f64) -> ParticipantDescription {
        ParticipantDescription::new(
            "fleet_a",
            name,
            Responsiveness::Responsive,
            CollisionProfile::with_radius(radius),
        )
    }

    #[test]
    fn same_identity_returns_same_id_and_updates_description() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.log");
        let mut registry = ParticipantRegistry::open(&path).unwrap();

        let first = registry.add_or_retrieve(desc("r1", 0.5)).unwrap();
        let second = registry.add_or_retrieve(desc("r1", 0.9)).unwrap();
        assert_eq!(first.id, second.id);
        let stored = registry.description(first.id).unwrap();
        assert_eq!(stored.profile.footprint_radius, 0.9);
    }

    #[test]
    fn distinct_identities_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.log");
        let mut registry = ParticipantRegistry::open(&path).unwrap();

        let a = registry.add_or_retrieve(desc("r1", 0.5)).unwrap();
        let b = registry.add_or_retrieve(desc("r2", 0.5)).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn marks_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.log");

        let id = {
            let mut registry = ParticipantRegistry::open(&path).unwrap();
            let reg = registry.add_or_retrieve(desc("r1", 0.5)).unwrap();
            registry
                .advance(reg.id, ItineraryVersion::new(17), RouteId::new(3))
                .unwrap();
            reg.id
        };

        let mut registry = ParticipantRegistry::open(&path).unwrap();
        let resumed = registry.add_or_retrieve(desc("r1", 0.5)).unwrap();
        assert_eq!(resumed.id, id);
        assert_eq!(resumed.last_itinerary_version, ItineraryVersion::new(17));
        assert_eq!(resumed.last_route_id, RouteId::new(3));
    }

    #[test]
    fn unchanged_marks_do_not_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.log");
        let mut registry = ParticipantRegistry::open(&path).unwrap();
        let reg = registry.add_or_retrieve(desc("r1", 0.5)).unwrap();

        registry
            .advance(reg.id, ItineraryVersion::new(1), RouteId::new(1))
            .unwrap();
        let len_after_first = std::fs::metadata(&path).unwrap().len();
        registry
            .advance(reg.id, ItineraryVersion::new(1), RouteId::new(1))
            .unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len_after_first);
    }
}
