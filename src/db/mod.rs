//! The versioned itinerary database.
//!
//! Accepts per-participant edits gated on a gapless itinerary version
//! sequence, serves incremental patches to queries, and reports the gaps it
//! is still waiting on.

use std::collections::{BTreeMap, VecDeque};

use thiserror::Error;

use crate::core::{
    Cull, DatabaseVersion, InconsistencyRanges, InvalidRoute, ItineraryChange, ItineraryVersion,
    ParticipantDescription, ParticipantEffect, ParticipantId, ParticipantPatch, Patch, Query,
    Route, RouteId, Time, VersionedChange,
};

pub mod hold;
pub mod mirror;

use hold::HoldBuffer;

/// Retained change-log length. Subscribers that fall further behind than
/// this get a full snapshot instead of an incremental patch.
const CHANGE_LOG_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("unknown participant [{0}]")]
    UnknownParticipant(ParticipantId),
    #[error(transparent)]
    InvalidRoute(#[from] InvalidRoute),
    #[error("route id [{route}] appears twice in one edit for participant [{participant}]")]
    RepeatedRouteId {
        participant: ParticipantId,
        route: RouteId,
    },
}

/// What the database did with a submitted edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditOutcome {
    /// Applied, possibly draining held successors up to this version.
    Applied { up_to: ItineraryVersion },
    /// Arrived ahead of a gap; buffered until the gap closes.
    Held,
    /// At or behind the current version, or already buffered. No-op.
    Duplicate,
}

#[derive(Debug)]
struct ParticipantState {
    description: ParticipantDescription,
    routes: BTreeMap<RouteId, Route>,
    version: ItineraryVersion,
    last_route_id: RouteId,
    hold: HoldBuffer,
}

impl ParticipantState {
    fn new(description: ParticipantDescription, resume: ItineraryVersion) -> Self {
        Self {
            description,
            routes: BTreeMap::new(),
            version: resume,
            last_route_id: RouteId::default(),
            hold: HoldBuffer::new(),
        }
    }
}

#[derive(Debug)]
enum LogAction {
    Registered,
    Retired,
    Change(VersionedChange),
}

#[derive(Debug)]
struct LogEntry {
    version: DatabaseVersion,
    participant: ParticipantId,
    action: LogAction,
}

#[derive(Debug, Default)]
pub struct Database {
    states: BTreeMap<ParticipantId, ParticipantState>,
    version: DatabaseVersion,
    log: VecDeque<LogEntry>,
    /// Database version immediately before the oldest retained log entry.
    log_floor: DatabaseVersion,
    last_cull: Option<(DatabaseVersion, Time)>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest_version(&self) -> DatabaseVersion {
        self.version
    }

    /// Bring a registered participant into the live schedule, resuming at the
    /// itinerary version recorded by the registry. Re-attaching an already
    /// present participant refreshes its description.
    pub fn attach(
        &mut self,
        id: ParticipantId,
        description: ParticipantDescription,
        resume: ItineraryVersion,
    ) {
        match self.states.get_mut(&id) {
            Some(state) => state.description = description,
            None => {
                self.states
                    .insert(id, ParticipantState::new(description, resume));
            }
        }
        self.advance(id, LogAction::Registered);
    }

    pub fn unregister(&mut self, id: ParticipantId) -> Result<(), DatabaseError> {
        if self.states.remove(&id).is_none() {
            return Err(DatabaseError::UnknownParticipant(id));
        }
        self.advance(id, LogAction::Retired);
        Ok(())
    }

    pub fn set(
        &mut self,
        participant: ParticipantId,
        itinerary: Vec<Route>,
        version: ItineraryVersion,
    ) -> Result<EditOutcome, DatabaseError> {
        self.validate_routes(participant, &itinerary)?;
        self.submit(participant, version, ItineraryChange::Replace { routes: itinerary })
    }

    pub fn extend(
        &mut self,
        participant: ParticipantId,
        routes: Vec<Route>,
        version: ItineraryVersion,
    ) -> Result<EditOutcome, DatabaseError> {
        self.validate_routes(participant, &routes)?;
        self.submit(participant, version, ItineraryChange::Extend { routes })
    }

    pub fn delay(
        &mut self,
        participant: ParticipantId,
        delay: time::Duration,
        version: ItineraryVersion,
    ) -> Result<EditOutcome, DatabaseError> {
        self.submit(participant, version, ItineraryChange::Delay { delay })
    }

    pub fn erase(
        &mut self,
        participant: ParticipantId,
        routes: Vec<RouteId>,
        version: ItineraryVersion,
    ) -> Result<EditOutcome, DatabaseError> {
        self.submit(participant, version, ItineraryChange::Erase { routes })
    }

    pub fn clear(
        &mut self,
        participant: ParticipantId,
        version: ItineraryVersion,
    ) -> Result<EditOutcome, DatabaseError> {
        self.submit(participant, version, ItineraryChange::Clear)
    }

    /// Drop every route that finishes before `before` and stamp subsequent
    /// patches so mirrors prune the same way.
    pub fn cull(&mut self, before: Time) -> DatabaseVersion {
        for state in self.states.values_mut() {
            state.routes.retain(|_, route| route.finish_time() >= before);
        }
        self.version = self.version.next();
        self.last_cull = Some((self.version, before));
        self.version
    }

    pub fn inconsistencies(&self) -> BTreeMap<ParticipantId, InconsistencyRanges> {
        self.states
            .iter()
            .filter_map(|(id, state)| {
                state.hold.report(state.version.next()).map(|r| (*id, r))
            })
            .collect()
    }

    pub fn inconsistency(&self, id: ParticipantId) -> Option<InconsistencyRanges> {
        let state = self.states.get(&id)?;
        state.hold.report(state.version.next())
    }

    pub fn participant_ids(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.states.keys().copied()
    }

    pub fn description(&self, id: ParticipantId) -> Option<&ParticipantDescription> {
        self.states.get(&id).map(|s| &s.description)
    }

    pub fn descriptions(&self) -> BTreeMap<ParticipantId, ParticipantDescription> {
        self.states
            .iter()
            .map(|(id, state)| (*id, state.description.clone()))
            .collect()
    }

    pub fn itinerary(&self, id: ParticipantId) -> Option<Vec<&Route>> {
        self.states.get(&id).map(|s| s.routes.values().collect())
    }

    pub fn itinerary_version(&self, id: ParticipantId) -> Option<ItineraryVersion> {
        self.states.get(&id).map(|s| s.version)
    }

    pub fn last_route_id(&self, id: ParticipantId) -> Option<RouteId> {
        self.states.get(&id).map(|s| s.last_route_id)
    }

    /// The minimal delta under `query` since `from`; a full snapshot when
    /// `from` is None or points below the retained change log.
    pub fn changes(&self, query: &Query, from: Option<DatabaseVersion>) -> Patch {
        let latest = self.version;
        let cull_since = |v: Option<DatabaseVersion>| {
            self.last_cull.and_then(|(cv, ct)| {
                let visible = match v {
                    None => true,
                    Some(v) => v < cv,
                };
                visible.then_some(Cull { before: ct })
            })
        };

        let Some(from) = from else {
            return Patch {
                base: None,
                latest,
                participants: self.snapshot_participants(query),
                cull: cull_since(None),
            };
        };

        if from == latest {
            return Patch {
                base: Some(from),
                latest,
                participants: Vec::new(),
                cull: None,
            };
        }

        if from < self.log_floor {
            // The window has been trimmed out of the log; reset the mirror.
            return Patch {
                base: None,
                latest,
                participants: self.snapshot_participants(query),
                cull: cull_since(None),
            };
        }

        let mut order: Vec<ParticipantId> = Vec::new();
        let mut grouped: BTreeMap<ParticipantId, Vec<&LogAction>> = BTreeMap::new();
        for entry in self.log.iter().skip_while(|e| e.version <= from) {
            grouped
                .entry(entry.participant)
                .or_insert_with(|| {
                    order.push(entry.participant);
                    Vec::new()
                })
                .push(&entry.action);
        }

        let mut participants = Vec::new();
        for id in order {
            let actions = &grouped[&id];
            let Some(state) = self.states.get(&id) else {
                participants.push(ParticipantPatch {
                    participant: id,
                    effect: ParticipantEffect::Retired,
                });
                continue;
            };
            if !query.matches_participant(id) {
                continue;
            }

            let folds = actions.iter().any(|a| {
                matches!(
                    a,
                    LogAction::Registered
                        | LogAction::Change(VersionedChange {
                            change: ItineraryChange::Replace { .. },
                            ..
                        })
                )
            });
            let effect = if folds {
                ParticipantEffect::Updates(vec![VersionedChange {
                    version: state.version,
                    change: ItineraryChange::Replace {
                        routes: self.filtered_routes(state, query),
                    },
                }])
            } else {
                let changes = actions
                    .iter()
                    .filter_map(|a| match a {
                        LogAction::Change(vc) => Some(self.filter_change(vc, query)),
                        _ => None,
                    })
                    .collect();
                ParticipantEffect::Updates(changes)
            };
            participants.push(ParticipantPatch {
                participant: id,
                effect,
            });
        }

        Patch {
            base: Some(from),
            latest,
            participants,
            cull: cull_since(Some(from)),
        }
    }

    fn snapshot_participants(&self, query: &Query) -> Vec<ParticipantPatch> {
        self.states
            .iter()
            .filter(|(id, _)| query.matches_participant(**id))
            .map(|(id, state)| ParticipantPatch {
                participant: *id,
                effect: ParticipantEffect::Updates(vec![VersionedChange {
                    version: state.version,
                    change: ItineraryChange::Replace {
                        routes: self.filtered_routes(state, query),
                    },
                }]),
            })
            .collect()
    }

    fn filtered_routes(&self, state: &ParticipantState, query: &Query) -> Vec<Route> {
        state
            .routes
            .values()
            .filter(|route| query.matches_route(route))
            .cloned()
            .collect()
    }

    fn filter_change(&self, vc: &VersionedChange, query: &Query) -> VersionedChange {
        let change = match &vc.change {
            ItineraryChange::Extend { routes } => ItineraryChange::Extend {
                routes: routes
                    .iter()
                    .filter(|r| query.matches_route(r))
                    .cloned()
                    .collect(),
            },
            other => other.clone(),
        };
        VersionedChange {
            version: vc.version,
            change,
        }
    }

    fn validate_routes(
        &self,
        participant: ParticipantId,
        routes: &[Route],
    ) -> Result<(), DatabaseError> {
        let mut seen = BTreeMap::new();
        for route in routes {
            route.validate()?;
            if seen.insert(route.id, ()).is_some() {
                return Err(DatabaseError::RepeatedRouteId {
                    participant,
                    route: route.id,
                });
            }
        }
        Ok(())
    }

    fn submit(
        &mut self,
        participant: ParticipantId,
        version: ItineraryVersion,
        change: ItineraryChange,
    ) -> Result<EditOutcome, DatabaseError> {
        let state = self
            .states
            .get_mut(&participant)
            .ok_or(DatabaseError::UnknownParticipant(participant))?;

        let expected = state.version.next();
        if version == expected {
            Self::apply_change(state, &change);
            state.version = version;
            self.advance(
                participant,
                LogAction::Change(VersionedChange { version, change }),
            );

            // Drain any held successors the gap was blocking.
            loop {
                let state = self
                    .states
                    .get_mut(&participant)
                    .expect("participant present while draining");
                let next = state.version.next();
                let Some(held) = state.hold.take(next) else {
                    break;
                };
                Self::apply_change(state, &held);
                state.version = next;
                self.advance(
                    participant,
                    LogAction::Change(VersionedChange {
                        version: next,
                        change: held,
                    }),
                );
            }

            let up_to = self.states[&participant].version;
            return Ok(EditOutcome::Applied { up_to });
        }

        if version.precedes_or_is(state.version) || state.hold.contains(version) {
            return Ok(EditOutcome::Duplicate);
        }

        state.hold.hold(version, change);
        Ok(EditOutcome::Held)
    }

    fn apply_change(state: &mut ParticipantState, change: &ItineraryChange) {
        match change {
            ItineraryChange::Replace { routes } => {
                state.routes = routes.iter().cloned().map(|r| (r.id, r)).collect();
                Self::note_route_ids(state, routes);
            }
            ItineraryChange::Extend { routes } => {
                for route in routes {
                    state.routes.insert(route.id, route.clone());
                }
                Self::note_route_ids(state, routes);
            }
            ItineraryChange::Delay { delay } => {
                for route in state.routes.values_mut() {
                    route.trajectory.shift(*delay);
                }
            }
            ItineraryChange::Erase { routes } => {
                for id in routes {
                    state.routes.remove(id);
                }
            }
            ItineraryChange::Clear => state.routes.clear(),
        }
    }

    fn note_route_ids(state: &mut ParticipantState, routes: &[Route]) {
        for route in routes {
            if state.last_route_id < route.id {
                state.last_route_id = route.id;
            }
        }
    }

    fn advance(&mut self, participant: ParticipantId, action: LogAction) {
        self.version = self.version.next();
        self.log.push_back(LogEntry {
            version: self.version,
            participant,
            action,
        });
        while self.log.len() > CHANGE_LOG_CAPACITY {
            let dropped = self.log.pop_front().expect("log is non-empty");
            self.log_floor = dropped.version;
        }
    }
}
