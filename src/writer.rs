//! Writer-side access to the schedule: the narrow edit capability set, the
//! rectifier that answers inconsistency reports, and participant creation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, bounded};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::{ItineraryVersion, ParticipantDescription, ParticipantId, Route, RouteId};
use crate::participant::{Participant, ParticipantShared};
use crate::registry::Registration;
use crate::transport::messages::{
    FailOverEvent, InconsistencyMsg, ItineraryClear, ItineraryDelay, ItineraryErase,
    ItineraryExtend, ItinerarySet, RegisterParticipantResponse, UnregisterParticipant,
    UnregisterParticipantResponse, services, topics,
};
use crate::transport::{Bus, Publisher, ServiceClient, TransportError};

#[derive(Debug, Error)]
pub enum WriterError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("the schedule service rejected the request: {0}")]
    Rejected(String),
}

/// The capability set a participant needs from the schedule, independent of
/// whether it reaches an in-process database or a remote service.
pub trait ScheduleLink: Send + Sync {
    fn set(&self, participant: ParticipantId, itinerary: Vec<Route>, version: ItineraryVersion);
    fn extend(&self, participant: ParticipantId, routes: Vec<Route>, version: ItineraryVersion);
    fn delay(&self, participant: ParticipantId, delay: time::Duration, version: ItineraryVersion);
    fn erase(&self, participant: ParticipantId, routes: Vec<RouteId>, version: ItineraryVersion);
    fn clear(&self, participant: ParticipantId, version: ItineraryVersion);
    fn register(&self, description: ParticipantDescription) -> Result<Registration, WriterError>;
    fn unregister(&self, participant: ParticipantId) -> Result<(), WriterError>;
    /// Re-resolve service endpoints after a fail-over. Default: nothing.
    fn rebind(&self) {}
}

/// Link over the transport to a (possibly remote) schedule service.
pub struct RemoteLink {
    set_pub: Publisher<ItinerarySet>,
    extend_pub: Publisher<ItineraryExtend>,
    delay_pub: Publisher<ItineraryDelay>,
    erase_pub: Publisher<ItineraryErase>,
    clear_pub: Publisher<ItineraryClear>,
    register_client: ServiceClient<ParticipantDescription, RegisterParticipantResponse>,
    unregister_client: ServiceClient<UnregisterParticipant, UnregisterParticipantResponse>,
}

impl RemoteLink {
    pub fn new(bus: &Bus) -> Self {
        Self {
            set_pub: bus.publisher(topics::ITINERARY_SET),
            extend_pub: bus.publisher(topics::ITINERARY_EXTEND),
            delay_pub: bus.publisher(topics::ITINERARY_DELAY),
            erase_pub: bus.publisher(topics::ITINERARY_ERASE),
            clear_pub: bus.publisher(topics::ITINERARY_CLEAR),
            register_client: bus.client(services::REGISTER_PARTICIPANT),
            unregister_client: bus.client(services::UNREGISTER_PARTICIPANT),
        }
    }
}

impl ScheduleLink for RemoteLink {
    fn set(&self, participant: ParticipantId, itinerary: Vec<Route>, version: ItineraryVersion) {
        self.set_pub.publish(ItinerarySet {
            participant,
            itinerary,
            itinerary_version: version,
        });
    }

    fn extend(&self, participant: ParticipantId, routes: Vec<Route>, version: ItineraryVersion) {
        self.extend_pub.publish(ItineraryExtend {
            participant,
            routes,
            itinerary_version: version,
        });
    }

    fn delay(&self, participant: ParticipantId, delay: time::Duration, version: ItineraryVersion) {
        self.delay_pub.publish(ItineraryDelay {
            participant,
            delay,
            itinerary_version: version,
        });
    }

    fn erase(&self, participant: ParticipantId, routes: Vec<RouteId>, version: ItineraryVersion) {
        self.erase_pub.publish(ItineraryErase {
            participant,
            routes,
            itinerary_version: version,
        });
    }

    fn clear(&self, participant: ParticipantId, version: ItineraryVersion) {
        self.clear_pub.publish(ItineraryClear {
            participant,
            itinerary_version: version,
        });
    }

    fn register(&self, description: ParticipantDescription) -> Result<Registration, WriterError> {
        match self.register_client.call(description)? {
            RegisterParticipantResponse::Ok(registration) => Ok(registration),
            RegisterParticipantResponse::Err(reason) => Err(WriterError::Rejected(reason)),
        }
    }

    fn unregister(&self, participant: ParticipantId) -> Result<(), WriterError> {
        match self.unregister_client.call(UnregisterParticipant { participant })? {
            UnregisterParticipantResponse::Ok => Ok(()),
            UnregisterParticipantResponse::Err(reason) => Err(WriterError::Rejected(reason)),
        }
    }

    fn rebind(&self) {
        info!("reconnecting schedule service endpoints after fail-over");
        self.register_client.rebind();
        self.unregister_client.rebind();
    }
}

type StubMap = Arc<Mutex<HashMap<ParticipantId, Weak<ParticipantShared>>>>;

/// A future-style handle for a participant being created on a background
/// thread.
pub struct PendingParticipant {
    receiver: Receiver<Result<Participant, WriterError>>,
}

impl PendingParticipant {
    /// Block until registration completes or the writer goes away.
    pub fn wait(self) -> Result<Participant, WriterError> {
        self.receiver
            .recv()
            .unwrap_or(Err(WriterError::Transport(TransportError::ShuttingDown)))
    }
}

/// Creates participants and keeps their edit streams rectified.
pub struct Writer {
    link: Arc<dyn ScheduleLink>,
    stubs: StubMap,
    quit: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl Writer {
    /// A writer talking to the schedule service over the bus.
    pub fn remote(bus: &Bus) -> Self {
        Self::with_link(bus, Arc::new(RemoteLink::new(bus)))
    }

    /// A writer over any link; tests and embedded setups pass their own.
    pub fn with_link(bus: &Bus, link: Arc<dyn ScheduleLink>) -> Self {
        let stubs: StubMap = Arc::new(Mutex::new(HashMap::new()));
        let quit = Arc::new(AtomicBool::new(false));

        let pump = std::thread::spawn({
            let inconsistency_sub = bus.subscribe::<InconsistencyMsg>(topics::INCONSISTENCY);
            let failover_sub = bus.subscribe::<FailOverEvent>(topics::FAILOVER);
            let stubs = Arc::clone(&stubs);
            let link = Arc::clone(&link);
            let quit = Arc::clone(&quit);
            move || {
                while !quit.load(Ordering::SeqCst) {
                    while let Ok(msg) = inconsistency_sub.try_recv() {
                        rectify(&stubs, msg);
                    }
                    if failover_sub.try_recv().is_ok() {
                        // Drain the burst; one rebind covers it.
                        while failover_sub.try_recv().is_ok() {}
                        link.rebind();
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        });

        Self {
            link,
            stubs,
            quit,
            pump: Some(pump),
        }
    }

    /// Register a participant on a background thread; the returned handle
    /// resolves when the service answers.
    pub fn make_participant(&self, description: ParticipantDescription) -> PendingParticipant {
        let (tx, rx) = bounded(1);
        let link = Arc::clone(&self.link);
        let stubs = Arc::clone(&self.stubs);
        std::thread::spawn(move || {
            let _ = tx.send(create_participant(link, stubs, description));
        });
        PendingParticipant { receiver: rx }
    }

    /// Callback-style variant; funnels through the same synchronous path.
    pub fn make_participant_with(
        &self,
        description: ParticipantDescription,
        ready: impl FnOnce(Result<Participant, WriterError>) + Send + 'static,
    ) {
        let link = Arc::clone(&self.link);
        let stubs = Arc::clone(&self.stubs);
        std::thread::spawn(move || {
            ready(create_participant(link, stubs, description));
        });
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.quit.store(true, Ordering::SeqCst);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

fn create_participant(
    link: Arc<dyn ScheduleLink>,
    stubs: StubMap,
    description: ParticipantDescription,
) -> Result<Participant, WriterError> {
    let registration = link.register(description.clone())?;
    let participant = Participant::new(registration, description, link);
    stubs
        .lock()
        .expect("stub map lock")
        .insert(participant.id(), participant.stub());
    Ok(participant)
}

/// Route an inconsistency report to the participant it names. Dead stubs are
/// purged lazily when their report arrives.
fn rectify(stubs: &StubMap, msg: InconsistencyMsg) {
    if msg.report.is_empty() {
        // Empty reports are not published in general; tolerate them anyway.
        return;
    }
    let stub = {
        let mut map = stubs.lock().expect("stub map lock");
        match map.get(&msg.participant) {
            Some(weak) => match weak.upgrade() {
                Some(stub) => Some(stub),
                None => {
                    map.remove(&msg.participant);
                    None
                }
            },
            None => None,
        }
    };
    match stub {
        Some(stub) => stub.retransmit(&msg.report),
        None => warn!(
            participant = %msg.participant,
            "inconsistency report for a participant this writer does not manage"
        ),
    }
}
