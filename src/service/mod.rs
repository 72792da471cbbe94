//! The schedule service: component wiring, locks, and thread lifecycles.
//!
//! Lock order when both are needed: database first, then negotiation.
//! Never the reverse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::Select;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::core::{CircleSweep, ConflictEvaluator, DatabaseVersion, NodeVersion, ParticipantId};
use crate::db::{Database, EditOutcome};
use crate::error::Error;
use crate::negotiation::NegotiationController;
use crate::queries::QueryRegistry;
use crate::registry::ParticipantRegistry;
use crate::transport::messages::{
    AckUpdate, ConflictAck, ConflictConclusion, ConflictForfeit, ConflictNotice, ConflictProposal,
    ConflictRefusal, ConflictRejection, InconsistencyMsg, ItineraryClear, ItineraryDelay,
    ItineraryErase, ItineraryExtend, ItinerarySet, ParticipantsInfo, QueriesInfo,
    RegisterParticipantResponse, RegisterQueryRequest, RegisterQueryResponse, RequestChanges,
    RequestChangesResponse, UnregisterParticipant, UnregisterParticipantResponse, services, topics,
};
use crate::transport::{Bus, Publisher, ServiceQueue, Subscription};

pub mod detect;
pub mod heartbeat;
pub mod update;

/// Everything guarded by the database lock: the itinerary database, the
/// query registry whose high-water marks move with it, and the persistent
/// participant registry.
pub(crate) struct DbState {
    pub database: Database,
    pub queries: QueryRegistry,
    pub registry: ParticipantRegistry,
    /// Bumped on every registration change so the conflict detector knows to
    /// refresh its participant snapshot.
    pub participants_version: u64,
}

pub(crate) struct Shared {
    pub db: Mutex<DbState>,
    pub conflict_cv: Condvar,
    pub negotiations: Mutex<NegotiationController>,
    pub quit: AtomicBool,
    pub bus: Bus,
    pub node_version: NodeVersion,
    pub service_id: Uuid,
    pub config: Config,
    pub evaluator: Box<dyn ConflictEvaluator>,
    pub inconsistency_pub: Publisher<InconsistencyMsg>,
    pub participants_info_pub: Publisher<ParticipantsInfo>,
    pub queries_info_pub: Publisher<QueriesInfo>,
    pub conflict_notice_pub: Publisher<ConflictNotice>,
    pub conflict_conclusion_pub: Publisher<ConflictConclusion>,
}

impl Shared {
    pub fn quitting(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    pub fn lock_db(&self) -> MutexGuard<'_, DbState> {
        self.db.lock().expect("database lock")
    }

    pub fn lock_negotiations(&self) -> MutexGuard<'_, NegotiationController> {
        self.negotiations.lock().expect("negotiation lock")
    }

    pub fn broadcast_participants(&self, db: &DbState) {
        let participants = db.database.descriptions().into_iter().collect();
        self.participants_info_pub
            .publish(ParticipantsInfo { participants });
    }

    pub fn broadcast_queries(&self, db: &DbState) {
        let queries = db
            .queries
            .iter()
            .map(|(id, record)| (id, record.query.clone()))
            .collect();
        self.queries_info_pub.publish(QueriesInfo {
            node_version: self.node_version,
            queries,
        });
    }

    /// Registry/inconsistency/negotiation follow-ups after an itinerary edit.
    fn after_edit(&self, db: &mut DbState, participant: ParticipantId, outcome: EditOutcome) {
        if let EditOutcome::Applied { up_to } = outcome {
            let last_route_id = db
                .database
                .last_route_id(participant)
                .unwrap_or_default();
            if let Err(err) = db.registry.advance(participant, up_to, last_route_id) {
                // Fatal for durability of the marks, not for the service.
                warn!(participant = %participant, "failed to persist high-water marks: {err}");
            }

            let mut negotiations = self.lock_negotiations();
            negotiations.observe_itinerary(participant, up_to);
        }

        if let Some(report) = db.database.inconsistency(participant)
            && !report.is_empty()
        {
            self.inconsistency_pub.publish(InconsistencyMsg {
                participant,
                report,
            });
        }
    }

    fn publish_conclusion(&self, conclusion: crate::negotiation::Conclusion) {
        self.conflict_conclusion_pub.publish(ConflictConclusion {
            conflict_version: conclusion.version,
            resolved: conclusion.resolved,
            table: conclusion.table,
        });
    }
}

/// Lifecycle stage of one negotiation as seen from outside.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationStatus {
    Active,
    /// Concluded; acknowledgments outstanding.
    Waiting,
    /// Record fully released (or never known).
    Purged,
}

/// A running schedule service. Threads stop and join on `shutdown` or drop.
pub struct ScheduleService {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ScheduleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleService").finish_non_exhaustive()
    }
}

impl ScheduleService {
    /// Start the service with the stock geometric evaluator.
    pub fn spawn(bus: Bus, config: Config, node_version: NodeVersion) -> Result<Self, Error> {
        Self::spawn_with(bus, config, node_version, Box::new(CircleSweep::default()))
    }

    pub fn spawn_with(
        bus: Bus,
        config: Config,
        node_version: NodeVersion,
        evaluator: Box<dyn ConflictEvaluator>,
    ) -> Result<Self, Error> {
        // Initialization order: database, registry, queries, then threads.
        let mut database = Database::new();
        let registry = ParticipantRegistry::open(&config.log_file_location)?;
        for (id, description, resume) in registry.entries() {
            database.attach(id, description.clone(), resume);
        }
        let queries = QueryRegistry::new();

        let shared = Arc::new(Shared {
            db: Mutex::new(DbState {
                database,
                queries,
                registry,
                participants_version: 1,
            }),
            conflict_cv: Condvar::new(),
            negotiations: Mutex::new(NegotiationController::new()),
            quit: AtomicBool::new(false),
            bus: bus.clone(),
            node_version,
            service_id: Uuid::new_v4(),
            config,
            evaluator,
            inconsistency_pub: bus.publisher(topics::INCONSISTENCY),
            participants_info_pub: bus.latched_publisher(topics::PARTICIPANTS_INFO),
            queries_info_pub: bus.latched_publisher(topics::QUERIES_INFO),
            conflict_notice_pub: bus.publisher(topics::CONFLICT_NOTICE),
            conflict_conclusion_pub: bus.publisher(topics::CONFLICT_CONCLUSION),
        });

        {
            let db = shared.lock_db();
            shared.broadcast_participants(&db);
            shared.broadcast_queries(&db);
        }

        let dispatcher = Dispatcher::bind(Arc::clone(&shared));
        let mut threads = Vec::new();
        threads.push(std::thread::spawn({
            let shared = Arc::clone(&shared);
            move || update::run(shared)
        }));
        threads.push(std::thread::spawn({
            let shared = Arc::clone(&shared);
            move || detect::run(shared)
        }));
        threads.push(std::thread::spawn(move || dispatcher.run()));
        threads.push(std::thread::spawn({
            let shared = Arc::clone(&shared);
            move || heartbeat::run(shared)
        }));

        info!(node_version = %node_version, "schedule service is up");
        Ok(Self { shared, threads })
    }

    pub fn node_version(&self) -> NodeVersion {
        self.shared.node_version
    }

    pub fn latest_version(&self) -> DatabaseVersion {
        self.shared.lock_db().database.latest_version()
    }

    /// Read snapshot of the delta under `query` since `from`.
    pub fn changes(
        &self,
        query: &crate::core::Query,
        from: Option<DatabaseVersion>,
    ) -> crate::core::Patch {
        self.shared.lock_db().database.changes(query, from)
    }

    pub fn participant_itinerary_version(
        &self,
        id: ParticipantId,
    ) -> Option<crate::core::ItineraryVersion> {
        self.shared.lock_db().database.itinerary_version(id)
    }

    pub fn inconsistencies(
        &self,
    ) -> std::collections::BTreeMap<ParticipantId, crate::core::InconsistencyRanges> {
        self.shared.lock_db().database.inconsistencies()
    }

    /// Where a negotiation currently stands, for monitoring and tests.
    pub fn negotiation_status(
        &self,
        version: crate::negotiation::NegotiationVersion,
    ) -> NegotiationStatus {
        let negotiations = self.shared.lock_negotiations();
        if negotiations.is_active(version) {
            NegotiationStatus::Active
        } else if negotiations.is_waiting(version) {
            NegotiationStatus::Waiting
        } else {
            NegotiationStatus::Purged
        }
    }

    /// Stop every thread and join them. Teardown is the reverse of startup:
    /// the quit flag goes up first so each loop observes it within one poll.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        self.shared.bus.shutdown();
        self.shared.conflict_cv.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ScheduleService {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
        }
    }
}

/// Serializes every inbound message and service request onto one thread.
struct Dispatcher {
    shared: Arc<Shared>,
    set_sub: Subscription<ItinerarySet>,
    extend_sub: Subscription<ItineraryExtend>,
    delay_sub: Subscription<ItineraryDelay>,
    erase_sub: Subscription<ItineraryErase>,
    clear_sub: Subscription<ItineraryClear>,
    ack_sub: Subscription<ConflictAck>,
    refusal_sub: Subscription<ConflictRefusal>,
    proposal_sub: Subscription<ConflictProposal>,
    rejection_sub: Subscription<ConflictRejection>,
    forfeit_sub: Subscription<ConflictForfeit>,
    register_participant: ServiceQueue<crate::core::ParticipantDescription, RegisterParticipantResponse>,
    unregister_participant: ServiceQueue<UnregisterParticipant, UnregisterParticipantResponse>,
    register_query: ServiceQueue<RegisterQueryRequest, RegisterQueryResponse>,
    request_changes: ServiceQueue<RequestChanges, RequestChangesResponse>,
}

impl Dispatcher {
    fn bind(shared: Arc<Shared>) -> Self {
        let bus = &shared.bus;
        Self {
            set_sub: bus.subscribe(topics::ITINERARY_SET),
            extend_sub: bus.subscribe(topics::ITINERARY_EXTEND),
            delay_sub: bus.subscribe(topics::ITINERARY_DELAY),
            erase_sub: bus.subscribe(topics::ITINERARY_ERASE),
            clear_sub: bus.subscribe(topics::ITINERARY_CLEAR),
            ack_sub: bus.subscribe(topics::CONFLICT_ACK),
            refusal_sub: bus.subscribe(topics::CONFLICT_REFUSAL),
            proposal_sub: bus.subscribe(topics::CONFLICT_PROPOSAL),
            rejection_sub: bus.subscribe(topics::CONFLICT_REJECTION),
            forfeit_sub: bus.subscribe(topics::CONFLICT_FORFEIT),
            register_participant: bus.serve(services::REGISTER_PARTICIPANT),
            unregister_participant: bus.serve(services::UNREGISTER_PARTICIPANT),
            register_query: bus.serve(services::REGISTER_QUERY),
            request_changes: bus.serve(services::REQUEST_CHANGES),
            shared,
        }
    }

    fn run(self) {
        loop {
            if self.shared.quitting() {
                return;
            }

            let mut select = Select::new();
            let i_set = select.recv(self.set_sub.raw());
            let i_extend = select.recv(self.extend_sub.raw());
            let i_delay = select.recv(self.delay_sub.raw());
            let i_erase = select.recv(self.erase_sub.raw());
            let i_clear = select.recv(self.clear_sub.raw());
            let i_ack = select.recv(self.ack_sub.raw());
            let i_refusal = select.recv(self.refusal_sub.raw());
            let i_proposal = select.recv(self.proposal_sub.raw());
            let i_rejection = select.recv(self.rejection_sub.raw());
            let i_forfeit = select.recv(self.forfeit_sub.raw());
            let i_reg_p = select.recv(self.register_participant.raw());
            let i_unreg_p = select.recv(self.unregister_participant.raw());
            let i_reg_q = select.recv(self.register_query.raw());
            let i_req_c = select.recv(self.request_changes.raw());

            let Ok(ready) = select.ready_timeout(Duration::from_millis(100)) else {
                continue;
            };

            match ready {
                i if i == i_set => {
                    if let Ok(msg) = self.set_sub.try_recv() {
                        self.on_set(msg);
                    }
                }
                i if i == i_extend => {
                    if let Ok(msg) = self.extend_sub.try_recv() {
                        self.on_extend(msg);
                    }
                }
                i if i == i_delay => {
                    if let Ok(msg) = self.delay_sub.try_recv() {
                        self.on_delay(msg);
                    }
                }
                i if i == i_erase => {
                    if let Ok(msg) = self.erase_sub.try_recv() {
                        self.on_erase(msg);
                    }
                }
                i if i == i_clear => {
                    if let Ok(msg) = self.clear_sub.try_recv() {
                        self.on_clear(msg);
                    }
                }
                i if i == i_ack => {
                    if let Ok(msg) = self.ack_sub.try_recv() {
                        self.on_ack(msg);
                    }
                }
                i if i == i_refusal => {
                    if let Ok(msg) = self.refusal_sub.try_recv() {
                        self.on_refusal(msg);
                    }
                }
                i if i == i_proposal => {
                    if let Ok(msg) = self.proposal_sub.try_recv() {
                        self.on_proposal(msg);
                    }
                }
                i if i == i_rejection => {
                    if let Ok(msg) = self.rejection_sub.try_recv() {
                        self.on_rejection(msg);
                    }
                }
                i if i == i_forfeit => {
                    if let Ok(msg) = self.forfeit_sub.try_recv() {
                        self.on_forfeit(msg);
                    }
                }
                i if i == i_reg_p => {
                    if let Ok(request) = self.register_participant.try_recv() {
                        self.on_register_participant(request);
                    }
                }
                i if i == i_unreg_p => {
                    if let Ok(request) = self.unregister_participant.try_recv() {
                        self.on_unregister_participant(request);
                    }
                }
                i if i == i_reg_q => {
                    if let Ok(request) = self.register_query.try_recv() {
                        self.on_register_query(request);
                    }
                }
                i if i == i_req_c => {
                    if let Ok(request) = self.request_changes.try_recv() {
                        self.on_request_changes(request);
                    }
                }
                _ => {}
            }
        }
    }

    fn on_set(&self, msg: ItinerarySet) {
        let mut db = self.shared.lock_db();
        match db
            .database
            .set(msg.participant, msg.itinerary, msg.itinerary_version)
        {
            Ok(outcome) => self.shared.after_edit(&mut db, msg.participant, outcome),
            Err(err) => warn!(participant = %msg.participant, "rejected set: {err}"),
        }
    }

    fn on_extend(&self, msg: ItineraryExtend) {
        let mut db = self.shared.lock_db();
        match db
            .database
            .extend(msg.participant, msg.routes, msg.itinerary_version)
        {
            Ok(outcome) => self.shared.after_edit(&mut db, msg.participant, outcome),
            Err(err) => warn!(participant = %msg.participant, "rejected extend: {err}"),
        }
    }

    fn on_delay(&self, msg: ItineraryDelay) {
        let mut db = self.shared.lock_db();
        match db
            .database
            .delay(msg.participant, msg.delay, msg.itinerary_version)
        {
            Ok(outcome) => self.shared.after_edit(&mut db, msg.participant, outcome),
            Err(err) => warn!(participant = %msg.participant, "rejected delay: {err}"),
        }
    }

    fn on_erase(&self, msg: ItineraryErase) {
        let mut db = self.shared.lock_db();
        match db
            .database
            .erase(msg.participant, msg.routes, msg.itinerary_version)
        {
            Ok(outcome) => self.shared.after_edit(&mut db, msg.participant, outcome),
            Err(err) => warn!(participant = %msg.participant, "rejected erase: {err}"),
        }
    }

    fn on_clear(&self, msg: ItineraryClear) {
        let mut db = self.shared.lock_db();
        match db.database.clear(msg.participant, msg.itinerary_version) {
            Ok(outcome) => self.shared.after_edit(&mut db, msg.participant, outcome),
            Err(err) => warn!(participant = %msg.participant, "rejected clear: {err}"),
        }
    }

    fn on_ack(&self, msg: ConflictAck) {
        // Database first, negotiation second: the current itinerary version
        // releases updating ackers whose edit already landed.
        let db = self.shared.lock_db();
        let mut negotiations = self.shared.lock_negotiations();
        for ack in msg.acknowledgments {
            negotiations.acknowledge(msg.conflict_version, ack.participant, ack.update.clone());
            if let AckUpdate::Updating(_) = ack.update
                && let Some(current) = db.database.itinerary_version(ack.participant)
            {
                negotiations.observe_itinerary(ack.participant, current);
            }
        }
    }

    fn on_refusal(&self, msg: ConflictRefusal) {
        let conclusion = {
            let mut negotiations = self.shared.lock_negotiations();
            negotiations.refuse(msg.conflict_version)
        };
        if let Some(conclusion) = conclusion {
            self.shared.publish_conclusion(conclusion);
        }
    }

    fn on_proposal(&self, msg: ConflictProposal) {
        let conclusion = {
            let mut negotiations = self.shared.lock_negotiations();
            negotiations.receive_proposal(msg)
        };
        if let Some(conclusion) = conclusion {
            self.shared.publish_conclusion(conclusion);
        }
    }

    fn on_rejection(&self, msg: ConflictRejection) {
        let conclusion = {
            let mut negotiations = self.shared.lock_negotiations();
            negotiations.receive_rejection(msg)
        };
        if let Some(conclusion) = conclusion {
            self.shared.publish_conclusion(conclusion);
        }
    }

    fn on_forfeit(&self, msg: ConflictForfeit) {
        let conclusion = {
            let mut negotiations = self.shared.lock_negotiations();
            negotiations.receive_forfeit(msg)
        };
        if let Some(conclusion) = conclusion {
            self.shared.publish_conclusion(conclusion);
        }
    }

    fn on_register_participant(
        &self,
        request: crate::transport::ServiceRequest<
            crate::core::ParticipantDescription,
            RegisterParticipantResponse,
        >,
    ) {
        let description = request.request.clone();
        let mut db = self.shared.lock_db();
        match db.registry.add_or_retrieve(description.clone()) {
            Ok(registration) => {
                db.database.attach(
                    registration.id,
                    description.clone(),
                    registration.last_itinerary_version,
                );
                db.participants_version += 1;
                info!(
                    participant = %registration.id,
                    name = %description.name,
                    owner = %description.owner,
                    "registered participant"
                );
                self.shared.broadcast_participants(&db);
                drop(db);
                self.shared.conflict_cv.notify_all();
                request.respond(RegisterParticipantResponse::Ok(registration));
            }
            Err(err) => {
                error!(
                    name = %description.name,
                    owner = %description.owner,
                    "failed to register participant: {err}"
                );
                request.respond(RegisterParticipantResponse::Err(err.to_string()));
            }
        }
    }

    fn on_unregister_participant(
        &self,
        request: crate::transport::ServiceRequest<UnregisterParticipant, UnregisterParticipantResponse>,
    ) {
        let participant = request.request.participant;
        let mut db = self.shared.lock_db();
        match db.database.unregister(participant) {
            Ok(()) => {
                db.participants_version += 1;
                info!(participant = %participant, "unregistered participant");
                self.shared.broadcast_participants(&db);
                {
                    let mut negotiations = self.shared.lock_negotiations();
                    negotiations.unregistered(participant);
                }
                drop(db);
                self.shared.conflict_cv.notify_all();
                request.respond(UnregisterParticipantResponse::Ok);
            }
            Err(err) => {
                error!(participant = %participant, "failed to unregister: {err}");
                request.respond(UnregisterParticipantResponse::Err(err.to_string()));
            }
        }
    }

    fn on_register_query(
        &self,
        request: crate::transport::ServiceRequest<RegisterQueryRequest, RegisterQueryResponse>,
    ) {
        let query = request.request.query.clone();
        let mut db = self.shared.lock_db();
        match db.queries.register(query, &self.shared.bus) {
            Ok(query_id) => {
                self.shared.broadcast_queries(&db);
                drop(db);
                request.respond(RegisterQueryResponse::Ok {
                    query_id,
                    node_version: self.shared.node_version,
                });
            }
            Err(err) => {
                error!("failed to register query: {err}");
                request.respond(RegisterQueryResponse::Err(err.to_string()));
            }
        }
    }

    fn on_request_changes(
        &self,
        request: crate::transport::ServiceRequest<RequestChanges, RequestChangesResponse>,
    ) {
        let RequestChanges {
            query_id,
            from_version,
            full_update,
        } = request.request.clone();
        let mut db = self.shared.lock_db();
        match db.queries.request_changes(query_id, from_version, full_update) {
            Ok(()) => request.respond(RequestChangesResponse::Accepted),
            Err(err) => {
                error!(query_id = %query_id, "change request failed: {err}");
                request.respond(RequestChangesResponse::UnknownQueryId);
            }
        }
    }
}

pub use heartbeat::{Liveliness, LivelinessMonitor};
