//! A replica of (a filtered view of) the database, advanced by patches.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::core::{
    DatabaseVersion, ItineraryChange, ItineraryVersion, ParticipantDescription, ParticipantEffect,
    ParticipantId, Patch, Route, RouteId,
};

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("patch base {base:?} does not extend mirror at {have:?}")]
    BaseMismatch {
        base: DatabaseVersion,
        have: Option<DatabaseVersion>,
    },
}

#[derive(Debug, Default)]
struct MirrorEntry {
    routes: BTreeMap<RouteId, Route>,
    version: ItineraryVersion,
}

/// Consistent prefix of the database, maintained only through monotone
/// patches. The conflict detector and remote subscribers each own one.
#[derive(Debug, Default)]
pub struct Mirror {
    entries: BTreeMap<ParticipantId, MirrorEntry>,
    descriptions: BTreeMap<ParticipantId, ParticipantDescription>,
    latest: Option<DatabaseVersion>,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest_version(&self) -> Option<DatabaseVersion> {
        self.latest
    }

    /// Apply one patch. Returns the participants whose entries changed.
    pub fn apply(&mut self, patch: &Patch) -> Result<Vec<ParticipantId>, MirrorError> {
        match patch.base {
            None => self.entries.clear(),
            Some(base) => {
                if self.latest != Some(base) {
                    return Err(MirrorError::BaseMismatch {
                        base,
                        have: self.latest,
                    });
                }
            }
        }

        let mut changed = Vec::new();
        for pp in &patch.participants {
            match &pp.effect {
                ParticipantEffect::Retired => {
                    if self.entries.remove(&pp.participant).is_some() {
                        changed.push(pp.participant);
                    }
                }
                ParticipantEffect::Updates(updates) => {
                    let entry = self.entries.entry(pp.participant).or_default();
                    let mut touched = false;
                    for vc in updates {
                        if !entry.routes.is_empty() || entry.version != ItineraryVersion::INITIAL {
                            if !entry.version.precedes(vc.version) {
                                continue;
                            }
                        }
                        Self::apply_change(entry, &vc.change);
                        entry.version = vc.version;
                        touched = true;
                    }
                    if touched {
                        changed.push(pp.participant);
                    }
                }
            }
        }

        if let Some(cull) = patch.cull {
            for entry in self.entries.values_mut() {
                entry
                    .routes
                    .retain(|_, route| route.finish_time() >= cull.before);
            }
        }

        self.latest = Some(patch.latest);
        Ok(changed)
    }

    /// Replace the known participant descriptions wholesale.
    pub fn update_participants(&mut self, descriptions: BTreeMap<ParticipantId, ParticipantDescription>) {
        self.descriptions = descriptions;
    }

    pub fn description(&self, id: ParticipantId) -> Option<&ParticipantDescription> {
        self.descriptions.get(&id)
    }

    pub fn participants(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.entries.keys().copied()
    }

    pub fn routes(&self, id: ParticipantId) -> Option<Vec<&Route>> {
        self.entries.get(&id).map(|e| e.routes.values().collect())
    }

    pub fn itinerary_version(&self, id: ParticipantId) -> Option<ItineraryVersion> {
        self.entries.get(&id).map(|e| e.version)
    }

    fn apply_change(entry: &mut MirrorEntry, change: &ItineraryChange) {
        match change {
            ItineraryChange::Replace { routes } => {
                entry.routes = routes.iter().cloned().map(|r| (r.id, r)).collect();
            }
            ItineraryChange::Extend { routes } => {
                for route in routes {
                    entry.routes.insert(route.id, route.clone());
                }
            }
            ItineraryChange::Delay { delay } => {
                for route in entry.routes.values_mut() {
                    route.trajectory.shift(*delay);
                }
            }
            ItineraryChange::Erase { routes } => {
                for id in routes {
                    entry.routes.remove(id);
                }
            }
            ItineraryChange::Clear => entry.routes.clear(),
        }
    }
}
