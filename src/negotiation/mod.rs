//! The negotiation controller: opens a bounded protocol for every detected
//! conflict and drives it to exactly one conclusion, then holds the record
//! until every involved participant has acknowledged.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::{ItineraryVersion, ParticipantId};
use crate::transport::messages::{
    AckUpdate, ConflictForfeit, ConflictProposal, ConflictRejection,
};

pub mod evaluate;
pub mod table;

use table::{Search, SequenceKey, TableTree};

/// Identifies one negotiation for its whole lifetime. A reoccurring conflict
/// after conclusion gets a fresh id.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NegotiationVersion(u64);

impl NegotiationVersion {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NegotiationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An unordered pair of participants whose current routes collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConflictSet {
    pub a: ParticipantId,
    pub b: ParticipantId,
}

impl ConflictSet {
    pub fn new(a: ParticipantId, b: ParticipantId) -> Self {
        Self { a, b }
    }

    pub fn normalized(self) -> (ParticipantId, ParticipantId) {
        if self.a <= self.b {
            (self.a, self.b)
        } else {
            (self.b, self.a)
        }
    }
}

/// A conclusion the service must publish and then collect acks for.
#[derive(Clone, Debug, PartialEq)]
pub struct Conclusion {
    pub version: NegotiationVersion,
    pub resolved: bool,
    pub table: Vec<SequenceKey>,
}

struct Room {
    participants: Vec<ParticipantId>,
    tree: TableTree,
    cached_proposals: Vec<ConflictProposal>,
    cached_rejections: Vec<ConflictRejection>,
    cached_forfeits: Vec<ConflictForfeit>,
}

impl Room {
    fn new(participants: Vec<ParticipantId>) -> Self {
        let tree = TableTree::new(participants.clone());
        Self {
            participants: tree.participants().to_vec(),
            tree,
            cached_proposals: Vec::new(),
            cached_rejections: Vec::new(),
            cached_forfeits: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AckState {
    AwaitingAck,
    AwaitingItinerary(ItineraryVersion),
}

#[derive(Default)]
struct WaitingRecord {
    pending: BTreeMap<ParticipantId, AckState>,
}

#[derive(Default)]
pub struct NegotiationController {
    next_version: u64,
    active: BTreeMap<NegotiationVersion, Room>,
    pairs: BTreeMap<(ParticipantId, ParticipantId), NegotiationVersion>,
    waiting: BTreeMap<NegotiationVersion, WaitingRecord>,
}

impl NegotiationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a negotiation for a conflict set, unless the pair is already
    /// under an active one.
    pub fn insert(&mut self, conflict: ConflictSet) -> Option<(NegotiationVersion, Vec<ParticipantId>)> {
        let pair = conflict.normalized();
        if self.pairs.contains_key(&pair) {
            return None;
        }

        let version = NegotiationVersion::new(self.next_version);
        self.next_version += 1;
        let room = Room::new(vec![pair.0, pair.1]);
        let participants = room.participants.clone();
        self.active.insert(version, room);
        self.pairs.insert(pair, version);
        Some((version, participants))
    }

    pub fn is_active(&self, version: NegotiationVersion) -> bool {
        self.active.contains_key(&version)
    }

    pub fn is_waiting(&self, version: NegotiationVersion) -> bool {
        self.waiting.contains_key(&version)
    }

    pub fn receive_proposal(&mut self, msg: ConflictProposal) -> Option<Conclusion> {
        let version = msg.conflict_version;
        let room = self.active.get_mut(&version)?;

        match room.tree.find_for(msg.for_participant, &msg.to_accommodate) {
            Search::Deprecated => return None,
            Search::Absent => {
                warn!(
                    negotiation = %version,
                    participant = %msg.for_participant,
                    "proposal for a table that does not exist yet; caching"
                );
                room.cached_proposals.push(msg);
                return None;
            }
            Search::Found(id) => {
                room.tree.submit(id, msg.itinerary, msg.proposal_version);
            }
        }

        self.replay_cache(version);
        self.evaluate(version)
    }

    pub fn receive_rejection(&mut self, msg: ConflictRejection) -> Option<Conclusion> {
        let version = msg.conflict_version;
        let room = self.active.get_mut(&version)?;
        let Some(last) = msg.table.last().copied() else {
            return None;
        };

        match room.tree.find_table(&msg.table) {
            Search::Deprecated => return None,
            Search::Absent => {
                warn!(
                    negotiation = %version,
                    rejected_by = %msg.rejected_by,
                    "rejection for an unknown table; caching"
                );
                room.cached_rejections.push(msg);
                return None;
            }
            Search::Found(id) => {
                room.tree
                    .reject(id, last.version, msg.rejected_by, msg.alternatives);
            }
        }

        self.replay_cache(version);
        self.evaluate(version)
    }

    pub fn receive_forfeit(&mut self, msg: ConflictForfeit) -> Option<Conclusion> {
        let version = msg.conflict_version;
        let room = self.active.get_mut(&version)?;
        let Some(last) = msg.table.last().copied() else {
            return None;
        };

        match room.tree.find_table(&msg.table) {
            Search::Deprecated => return None,
            Search::Absent => {
                warn!(negotiation = %version, "forfeit for an unknown table; caching");
                room.cached_forfeits.push(msg);
                return None;
            }
            Search::Found(id) => {
                room.tree.forfeit(id, last.version);
            }
        }

        self.replay_cache(version);
        self.evaluate(version)
    }

    /// Abort the whole negotiation; acks are waived.
    pub fn refuse(&mut self, version: NegotiationVersion) -> Option<Conclusion> {
        self.active.remove(&version)?;
        self.pairs.retain(|_, v| *v != version);
        info!(negotiation = %version, "refused negotiation");
        Some(Conclusion {
            version,
            resolved: false,
            table: Vec::new(),
        })
    }

    /// Record one participant's response to a conclusion.
    pub fn acknowledge(
        &mut self,
        version: NegotiationVersion,
        participant: ParticipantId,
        update: AckUpdate,
    ) {
        let Some(record) = self.waiting.get_mut(&version) else {
            return;
        };
        match update {
            AckUpdate::NotUpdating => {
                record.pending.remove(&participant);
            }
            AckUpdate::Updating(itinerary_version) => {
                if record.pending.contains_key(&participant) {
                    record
                        .pending
                        .insert(participant, AckState::AwaitingItinerary(itinerary_version));
                }
            }
        }
        self.purge_settled();
    }

    /// Called whenever the database applies an edit: updating ackers are
    /// released once their promised version is observed.
    pub fn observe_itinerary(&mut self, participant: ParticipantId, version: ItineraryVersion) {
        for record in self.waiting.values_mut() {
            if let Some(&AckState::AwaitingItinerary(awaited)) = record.pending.get(&participant)
                && awaited.precedes_or_is(version)
            {
                record.pending.remove(&participant);
            }
        }
        self.purge_settled();
    }

    /// A departed participant owes nothing; waive its ack requirements.
    pub fn unregistered(&mut self, participant: ParticipantId) {
        for record in self.waiting.values_mut() {
            record.pending.remove(&participant);
        }
        self.purge_settled();
    }

    fn evaluate(&mut self, version: NegotiationVersion) -> Option<Conclusion> {
        let room = self.active.get(&version)?;
        if room.tree.ready() {
            let choice =
                evaluate::quickest_finish(&room.tree).expect("ready negotiation has a candidate");
            let table = room.tree.sequence_keys(choice);
            info!(negotiation = %version, "resolved negotiation");
            return self.conclude(version, true, table);
        }
        if room.tree.complete() {
            info!(negotiation = %version, "negotiation forfeited by all branches");
            return self.conclude(version, false, Vec::new());
        }
        None
    }

    fn conclude(
        &mut self,
        version: NegotiationVersion,
        resolved: bool,
        table: Vec<SequenceKey>,
    ) -> Option<Conclusion> {
        let room = self.active.remove(&version)?;
        self.pairs.retain(|_, v| *v != version);

        let mut record = WaitingRecord::default();
        for p in &room.participants {
            record.pending.insert(*p, AckState::AwaitingAck);
        }
        self.waiting.insert(version, record);

        Some(Conclusion {
            version,
            resolved,
            table,
        })
    }

    /// Replay cached messages until a pass makes no progress. Messages whose
    /// tables deprecated in the meantime are silently dropped.
    fn replay_cache(&mut self, version: NegotiationVersion) {
        loop {
            let Some(room) = self.active.get_mut(&version) else {
                return;
            };
            let mut progressed = false;

            let proposals = std::mem::take(&mut room.cached_proposals);
            for msg in proposals {
                match room.tree.find_for(msg.for_participant, &msg.to_accommodate) {
                    Search::Found(id) => {
                        progressed |= room.tree.submit(id, msg.itinerary, msg.proposal_version);
                    }
                    Search::Absent => room.cached_proposals.push(msg),
                    Search::Deprecated => {}
                }
            }

            let rejections = std::mem::take(&mut room.cached_rejections);
            for msg in rejections {
                let Some(last) = msg.table.last().copied() else {
                    continue;
                };
                match room.tree.find_table(&msg.table) {
                    Search::Found(id) => {
                        progressed |=
                            room.tree
                                .reject(id, last.version, msg.rejected_by, msg.alternatives);
                    }
                    Search::Absent => room.cached_rejections.push(msg),
                    Search::Deprecated => {}
                }
            }

            let forfeits = std::mem::take(&mut room.cached_forfeits);
            for msg in forfeits {
                let Some(last) = msg.table.last().copied() else {
                    continue;
                };
                match room.tree.find_table(&msg.table) {
                    Search::Found(id) => {
                        progressed |= room.tree.forfeit(id, last.version);
                    }
                    Search::Absent => room.cached_forfeits.push(msg),
                    Search::Deprecated => {}
                }
            }

            if !progressed {
                return;
            }
        }
    }

    fn purge_settled(&mut self) {
        self.waiting.retain(|version, record| {
            let settled = record.pending.is_empty();
            if settled {
                info!(negotiation = %version, "all acknowledgments satisfied; purging record");
            }
            !settled
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Route;
    use crate::core::route::test_support::line_route;

    fn p(raw: u64) -> ParticipantId {
        ParticipantId::new(raw)
    }

    fn key(participant: u64, version: u64) -> SequenceKey {
        SequenceKey {
            participant: p(participant),
            version,
        }
    }

    fn routes() -> Vec<Route> {
        vec![line_route(1, "L1", 0, 10, (0.0, 0.0), (1.0, 0.0))]
    }

    fn proposal(
        version: NegotiationVersion,
        for_participant: u64,
        to_accommodate: Vec<SequenceKey>,
        proposal_version: u64,
    ) -> ConflictProposal {
        ConflictProposal {
            conflict_version: version,
            for_participant: p(for_participant),
            to_accommodate,
            itinerary: routes(),
            proposal_version,
        }
    }

    fn open(controller: &mut NegotiationController) -> NegotiationVersion {
        let (version, participants) = controller
            .insert(ConflictSet::new(p(1), p(2)))
            .expect("fresh negotiation");
        assert_eq!(participants, vec![p(1), p(2)]);
        version
    }

    #[test]
    fn duplicate_conflicts_do_not_open_twice() {
        let mut controller = NegotiationController::new();
        let _ = open(&mut controller);
        assert!(controller.insert(ConflictSet::new(p(2), p(1))).is_none());
    }

    #[test]
    fn proposals_drive_the_negotiation_to_resolution() {
        let mut controller = NegotiationController::new();
        let version = open(&mut controller);

        assert!(controller
            .receive_proposal(proposal(version, 1, vec![], 1))
            .is_none());
        let conclusion = controller
            .receive_proposal(proposal(version, 2, vec![key(1, 1)], 1))
            .expect("full-depth submission concludes");

        assert!(conclusion.resolved);
        assert_eq!(conclusion.table, vec![key(1, 1), key(2, 1)]);
        assert!(!controller.is_active(version));
        assert!(controller.is_waiting(version));
    }

    #[test]
    fn conclusion_happens_exactly_once() {
        let mut controller = NegotiationController::new();
        let version = open(&mut controller);
        controller.receive_proposal(proposal(version, 1, vec![], 1));
        let first = controller.receive_proposal(proposal(version, 2, vec![key(1, 1)], 1));
        assert!(first.is_some());

        // Straggler messages for the concluded negotiation are dropped.
        let second = controller.receive_proposal(proposal(version, 2, vec![key(1, 1)], 2));
        assert!(second.is_none());
    }

    #[test]
    fn out_of_order_proposal_is_cached_then_replayed() {
        let mut controller = NegotiationController::new();
        let version = open(&mut controller);

        // p2's accommodation arrives before p1's root proposal.
        assert!(controller
            .receive_proposal(proposal(version, 2, vec![key(1, 1)], 1))
            .is_none());
        assert!(controller.is_active(version));

        // The root proposal lands; the cached message replays and concludes.
        let conclusion = controller
            .receive_proposal(proposal(version, 1, vec![], 1))
            .expect("cache replay completes the table");
        assert!(conclusion.resolved);
    }

    #[test]
    fn all_forfeits_conclude_unresolved() {
        let mut controller = NegotiationController::new();
        let version = open(&mut controller);

        assert!(controller
            .receive_forfeit(ConflictForfeit {
                conflict_version: version,
                table: vec![key(1, 0)],
            })
            .is_none());
        let conclusion = controller
            .receive_forfeit(ConflictForfeit {
                conflict_version: version,
                table: vec![key(2, 0)],
            })
            .expect("all branches forfeited");
        assert!(!conclusion.resolved);
        assert!(controller.is_waiting(version));
    }

    #[test]
    fn refusal_concludes_immediately_and_waives_acks() {
        let mut controller = NegotiationController::new();
        let version = open(&mut controller);

        let conclusion = controller.refuse(version).expect("active negotiation");
        assert!(!conclusion.resolved);
        assert!(!controller.is_active(version));
        assert!(!controller.is_waiting(version));

        // A second refusal finds nothing.
        assert!(controller.refuse(version).is_none());
    }

    #[test]
    fn reoccurring_conflict_after_conclusion_gets_a_new_id() {
        let mut controller = NegotiationController::new();
        let version = open(&mut controller);
        controller.receive_proposal(proposal(version, 1, vec![], 1));
        controller.receive_proposal(proposal(version, 2, vec![key(1, 1)], 1));

        let (fresh, _) = controller
            .insert(ConflictSet::new(p(1), p(2)))
            .expect("pair no longer active");
        assert_ne!(fresh, version);
    }

    #[test]
    fn acks_release_the_record() {
        let mut controller = NegotiationController::new();
        let version = open(&mut controller);
        controller.receive_proposal(proposal(version, 1, vec![], 1));
        controller.receive_proposal(proposal(version, 2, vec![key(1, 1)], 1));

        controller.acknowledge(version, p(1), AckUpdate::NotUpdating);
        assert!(controller.is_waiting(version));

        // p2 promises an update; the record holds until the database sees it.
        controller.acknowledge(version, p(2), AckUpdate::Updating(ItineraryVersion::new(5)));
        assert!(controller.is_waiting(version));
        controller.observe_itinerary(p(2), ItineraryVersion::new(4));
        assert!(controller.is_waiting(version));
        controller.observe_itinerary(p(2), ItineraryVersion::new(5));
        assert!(!controller.is_waiting(version));
    }

    #[test]
    fn departure_waives_outstanding_acks() {
        let mut controller = NegotiationController::new();
        let version = open(&mut controller);
        controller.receive_proposal(proposal(version, 1, vec![], 1));
        controller.receive_proposal(proposal(version, 2, vec![key(1, 1)], 1));

        controller.acknowledge(version, p(1), AckUpdate::NotUpdating);
        controller.unregistered(p(2));
        assert!(!controller.is_waiting(version));
    }

    #[test]
    fn rejection_sends_the_proposal_back() {
        let mut controller = NegotiationController::new();
        let version = open(&mut controller);
        controller.receive_proposal(proposal(version, 1, vec![], 1));

        assert!(controller
            .receive_rejection(ConflictRejection {
                conflict_version: version,
                table: vec![key(1, 1)],
                rejected_by: p(2),
                alternatives: vec![routes()],
            })
            .is_none());
        assert!(controller.is_active(version));

        // p1 resubmits around the alternatives and p2 accepts.
        controller.receive_proposal(proposal(version, 1, vec![], 2));
        let conclusion = controller
            .receive_proposal(proposal(version, 2, vec![key(1, 2)], 1))
            .expect("resubmission resolves");
        assert!(conclusion.resolved);
        assert_eq!(conclusion.table, vec![key(1, 2), key(2, 1)]);
    }
}
