//! The participant handle: owns the itinerary version counter and route id
//! allocation for one agent, and can replay its own history when the
//! database reports a gap.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use crate::core::{
    InconsistencyRanges, ItineraryChange, ItineraryVersion, ParticipantDescription, ParticipantId,
    Route, RouteId, Trajectory,
};
use crate::registry::Registration;
use crate::writer::{ScheduleLink, WriterError};

struct Core {
    version: ItineraryVersion,
    next_route_id: RouteId,
    current: Vec<Route>,
    /// Every edit this participant ever sent, keyed by raw version, so any
    /// reported gap can be replayed verbatim.
    history: BTreeMap<u64, ItineraryChange>,
}

/// Shared between the [`Participant`] handle and the writer's rectifier
/// stub map (which holds it weakly).
pub struct ParticipantShared {
    id: ParticipantId,
    description: ParticipantDescription,
    link: Arc<dyn ScheduleLink>,
    core: Mutex<Core>,
}

impl ParticipantShared {
    /// Resend the edits named by an inconsistency report. Versions that
    /// predate this incarnation's history are filled with no-op clears so
    /// the gap closes deterministically.
    pub(crate) fn retransmit(&self, report: &InconsistencyRanges) {
        let core = self.core.lock().expect("participant lock");
        for range in &report.ranges {
            let mut version = range.lower;
            loop {
                match core.history.get(&version.get()) {
                    Some(change) => self.send(change.clone(), version),
                    None => {
                        warn!(
                            participant = %self.id,
                            version = %version,
                            "gap names a version outside this participant's history"
                        );
                        self.send(ItineraryChange::Clear, version);
                    }
                }
                if version == range.upper {
                    break;
                }
                version = version.next();
            }
        }
    }

    fn send(&self, change: ItineraryChange, version: ItineraryVersion) {
        match change {
            ItineraryChange::Replace { routes } => self.link.set(self.id, routes, version),
            ItineraryChange::Extend { routes } => self.link.extend(self.id, routes, version),
            ItineraryChange::Delay { delay } => self.link.delay(self.id, delay, version),
            ItineraryChange::Erase { routes } => self.link.erase(self.id, routes, version),
            ItineraryChange::Clear => self.link.clear(self.id, version),
        }
    }
}

/// One mobile agent's handle on the shared schedule.
pub struct Participant {
    shared: Arc<ParticipantShared>,
}

impl Participant {
    pub(crate) fn new(
        registration: Registration,
        description: ParticipantDescription,
        link: Arc<dyn ScheduleLink>,
    ) -> Self {
        Self {
            shared: Arc::new(ParticipantShared {
                id: registration.id,
                description,
                link,
                core: Mutex::new(Core {
                    version: registration.last_itinerary_version,
                    next_route_id: registration.last_route_id.next(),
                    current: Vec::new(),
                    history: BTreeMap::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.shared.id
    }

    pub fn description(&self) -> &ParticipantDescription {
        &self.shared.description
    }

    pub fn current_version(&self) -> ItineraryVersion {
        self.shared.core.lock().expect("participant lock").version
    }

    pub fn current_itinerary(&self) -> Vec<Route> {
        self.shared
            .core
            .lock()
            .expect("participant lock")
            .current
            .clone()
    }

    /// Replace the whole itinerary. Route ids are assigned here and returned
    /// in input order.
    pub fn set_itinerary(&self, routes: Vec<(String, Trajectory)>) -> Vec<RouteId> {
        let mut core = self.shared.core.lock().expect("participant lock");
        let routes = assign_ids(&mut core, routes);
        let ids = routes.iter().map(|r| r.id).collect();

        core.current = routes.clone();
        self.commit(&mut core, ItineraryChange::Replace { routes });
        ids
    }

    /// Append routes to the current itinerary.
    pub fn extend(&self, routes: Vec<(String, Trajectory)>) -> Vec<RouteId> {
        let mut core = self.shared.core.lock().expect("participant lock");
        let routes = assign_ids(&mut core, routes);
        let ids = routes.iter().map(|r| r.id).collect();

        core.current.extend(routes.iter().cloned());
        self.commit(&mut core, ItineraryChange::Extend { routes });
        ids
    }

    /// Push the whole itinerary into the future by `delay`.
    pub fn delay(&self, delay: time::Duration) {
        let mut core = self.shared.core.lock().expect("participant lock");
        for route in &mut core.current {
            route.trajectory.shift(delay);
        }
        self.commit(&mut core, ItineraryChange::Delay { delay });
    }

    /// Remove specific routes.
    pub fn erase(&self, routes: Vec<RouteId>) {
        let mut core = self.shared.core.lock().expect("participant lock");
        core.current.retain(|r| !routes.contains(&r.id));
        self.commit(&mut core, ItineraryChange::Erase { routes });
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut core = self.shared.core.lock().expect("participant lock");
        core.current.clear();
        self.commit(&mut core, ItineraryChange::Clear);
    }

    /// Retire this participant from the schedule.
    pub fn unregister(self) -> Result<(), WriterError> {
        self.shared.link.unregister(self.shared.id)
    }

    pub(crate) fn stub(&self) -> Weak<ParticipantShared> {
        Arc::downgrade(&self.shared)
    }

    /// Advance the version by exactly one, remember the edit, send it.
    fn commit(&self, core: &mut Core, change: ItineraryChange) {
        let version = core.version.next();
        core.version = version;
        core.history.insert(version.get(), change.clone());
        self.shared.send(change, version);
    }
}

fn assign_ids(core: &mut Core, routes: Vec<(String, Trajectory)>) -> Vec<Route> {
    routes
        .into_iter()
        .map(|(map, trajectory)| {
            let id = core.next_route_id;
            core.next_route_id = id.next();
            Route::new(id, map, trajectory)
        })
        .collect()
}
