//! The table tree of one negotiation.
//!
//! A table is one participant's seat: the proposal it makes while
//! accommodating the submitted proposals of the participants before it in
//! the sequence. Tables live in an arena owned by the negotiation and are
//! referenced by compact ids; the whole arena drops when the negotiation is
//! purged.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{ParticipantId, Route, Time};

/// One step of an accommodation sequence as it appears on the wire: the
/// participant and the proposal version of its submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceKey {
    pub participant: ParticipantId,
    pub version: u64,
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.participant, self.version)
    }
}

/// Arena index of a table within its negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TableId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableState {
    /// Seat exists; nothing proposed yet.
    Open,
    /// A proposal is on the table.
    Submitted,
    /// The proposal was rejected; the owner must resubmit.
    Rejected,
    /// The owner gave up on this branch.
    Forfeited,
}

/// Outcome of resolving a wire sequence against the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Search {
    Found(TableId),
    /// No such table yet; the message arrived out of causal order.
    Absent,
    /// The referenced submission was superseded; drop the message.
    Deprecated,
}

struct Table {
    for_participant: ParticipantId,
    sequence: Vec<ParticipantId>,
    parent: Option<TableId>,
    children: BTreeMap<ParticipantId, TableId>,
    state: TableState,
    /// Proposal version of the latest submission; 0 before any.
    version: u64,
    proposal: Option<Vec<Route>>,
    alternatives: BTreeMap<ParticipantId, Vec<Vec<Route>>>,
    deprecated: bool,
}

impl Table {
    fn new(for_participant: ParticipantId, sequence: Vec<ParticipantId>, parent: Option<TableId>) -> Self {
        Self {
            for_participant,
            sequence,
            parent,
            children: BTreeMap::new(),
            state: TableState::Open,
            version: 0,
            proposal: None,
            alternatives: BTreeMap::new(),
            deprecated: false,
        }
    }
}

pub struct TableTree {
    participants: Vec<ParticipantId>,
    arena: Vec<Table>,
    roots: BTreeMap<ParticipantId, TableId>,
}

impl TableTree {
    /// Open a tree over the given participants, one root seat each.
    /// Participant order is the stable tie-break order.
    pub fn new(mut participants: Vec<ParticipantId>) -> Self {
        participants.sort_unstable();
        participants.dedup();
        let mut tree = Self {
            participants: participants.clone(),
            arena: Vec::new(),
            roots: BTreeMap::new(),
        };
        for p in participants {
            let id = tree.alloc(Table::new(p, vec![p], None));
            tree.roots.insert(p, id);
        }
        tree
    }

    pub fn participants(&self) -> &[ParticipantId] {
        &self.participants
    }

    /// Resolve the table where `for_participant` proposes while
    /// accommodating the chain `to_accommodate`.
    pub fn find_for(
        &self,
        for_participant: ParticipantId,
        to_accommodate: &[SequenceKey],
    ) -> Search {
        if to_accommodate.is_empty() {
            return match self.roots.get(&for_participant) {
                Some(&id) => Search::Found(id),
                None => Search::Absent,
            };
        }
        match self.walk(to_accommodate) {
            Ok(last) => match self.arena[last.0].children.get(&for_participant) {
                Some(&child) => Search::Found(child),
                None => Search::Absent,
            },
            Err(search) => search,
        }
    }

    /// Resolve a full table sequence as named by a rejection or forfeit. The
    /// last key carries the proposal version being acted on; a table that has
    /// since resubmitted deprecates the message.
    pub fn find_table(&self, sequence: &[SequenceKey]) -> Search {
        let Some((last, ancestors)) = sequence.split_last() else {
            return Search::Absent;
        };

        let table_id = if ancestors.is_empty() {
            match self.roots.get(&last.participant) {
                Some(&id) => id,
                None => return Search::Absent,
            }
        } else {
            match self.walk(ancestors) {
                Ok(parent) => match self.arena[parent.0].children.get(&last.participant) {
                    Some(&id) => id,
                    None => return Search::Absent,
                },
                Err(search) => return search,
            }
        };

        let table = &self.arena[table_id.0];
        if table.version > last.version {
            return Search::Deprecated;
        }
        if table.version < last.version {
            return Search::Absent;
        }
        Search::Found(table_id)
    }

    /// Record a proposal. Stale versions are ignored; a fresh submission
    /// deprecates the subtree built on the previous one and opens seats for
    /// every participant not yet in the sequence.
    pub fn submit(&mut self, id: TableId, itinerary: Vec<Route>, proposal_version: u64) -> bool {
        {
            let table = &mut self.arena[id.0];
            if proposal_version <= table.version {
                return false;
            }
            table.proposal = Some(itinerary);
            table.version = proposal_version;
            table.state = TableState::Submitted;
        }
        self.deprecate_children(id);

        let sequence = self.arena[id.0].sequence.clone();
        if sequence.len() < self.participants.len() {
            let absent: Vec<ParticipantId> = self
                .participants
                .iter()
                .copied()
                .filter(|p| !sequence.contains(p))
                .collect();
            for p in absent {
                let mut child_sequence = sequence.clone();
                child_sequence.push(p);
                let child = self.alloc(Table::new(p, child_sequence, Some(id)));
                self.arena[id.0].children.insert(p, child);
            }
        }
        true
    }

    /// Reject the current submission, recording what the rejecting
    /// participant could have accepted instead.
    pub fn reject(
        &mut self,
        id: TableId,
        version: u64,
        rejected_by: ParticipantId,
        alternatives: Vec<Vec<Route>>,
    ) -> bool {
        {
            let table = &mut self.arena[id.0];
            if version != table.version || table.state != TableState::Submitted {
                return false;
            }
            table.state = TableState::Rejected;
            table.alternatives.insert(rejected_by, alternatives);
        }
        self.deprecate_children(id);
        true
    }

    /// Give up on this branch for good.
    pub fn forfeit(&mut self, id: TableId, version: u64) -> bool {
        {
            let table = &mut self.arena[id.0];
            if version != table.version || table.state == TableState::Forfeited {
                return false;
            }
            table.state = TableState::Forfeited;
        }
        self.deprecate_children(id);
        true
    }

    /// Every participant has a viable compatible proposal: some full-depth
    /// table is submitted.
    pub fn ready(&self) -> bool {
        self.arena.iter().any(|t| {
            !t.deprecated
                && t.state == TableState::Submitted
                && t.sequence.len() == self.participants.len()
        })
    }

    /// No further progress is possible: either ready, or every branch has
    /// been forfeited.
    pub fn complete(&self) -> bool {
        self.ready() || self.roots.values().all(|&root| self.branch_dead(root))
    }

    /// Ids of candidate full-depth submitted tables.
    pub fn finished_tables(&self) -> Vec<TableId> {
        self.arena
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                !t.deprecated
                    && t.state == TableState::Submitted
                    && t.sequence.len() == self.participants.len()
            })
            .map(|(i, _)| TableId(i))
            .collect()
    }

    /// The wire representation of a table: the chain of (participant,
    /// submission version) keys from root to this table.
    pub fn sequence_keys(&self, id: TableId) -> Vec<SequenceKey> {
        let mut keys: Vec<SequenceKey> = self
            .chain(id)
            .into_iter()
            .map(|tid| {
                let t = &self.arena[tid.0];
                SequenceKey {
                    participant: t.for_participant,
                    version: t.version,
                }
            })
            .collect();
        keys.reverse();
        keys
    }

    /// Each participant's proposed itinerary along the chain ending at `id`,
    /// in sequence order. None for seats that never submitted.
    pub fn proposals_along(&self, id: TableId) -> Vec<(ParticipantId, Option<&Vec<Route>>)> {
        let mut chain: Vec<(ParticipantId, Option<&Vec<Route>>)> = self
            .chain(id)
            .into_iter()
            .map(|tid| {
                let t = &self.arena[tid.0];
                (t.for_participant, t.proposal.as_ref())
            })
            .collect();
        chain.reverse();
        chain
    }

    /// Latest finish time across one table's proposed routes.
    pub fn proposal_finish(routes: &[Route]) -> Option<Time> {
        routes.iter().map(Route::finish_time).max()
    }

    pub fn state(&self, id: TableId) -> TableState {
        self.arena[id.0].state
    }

    pub fn alternatives(&self, id: TableId) -> &BTreeMap<ParticipantId, Vec<Vec<Route>>> {
        &self.arena[id.0].alternatives
    }

    fn chain(&self, id: TableId) -> Vec<TableId> {
        let mut chain = vec![id];
        let mut current = id;
        while let Some(parent) = self.arena[current.0].parent {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    fn walk(&self, keys: &[SequenceKey]) -> Result<TableId, Search> {
        let first = keys[0];
        let Some(&root) = self.roots.get(&first.participant) else {
            return Err(Search::Absent);
        };
        let mut current = root;
        for (index, key) in keys.iter().enumerate() {
            if index > 0 {
                match self.arena[current.0].children.get(&key.participant) {
                    Some(&child) => current = child,
                    None => return Err(Search::Absent),
                }
            }
            let table = &self.arena[current.0];
            if table.version > key.version {
                return Err(Search::Deprecated);
            }
            if table.state != TableState::Submitted || table.version < key.version {
                return Err(Search::Absent);
            }
        }
        Ok(current)
    }

    fn branch_dead(&self, id: TableId) -> bool {
        let table = &self.arena[id.0];
        match table.state {
            TableState::Forfeited => true,
            TableState::Submitted => {
                if table.sequence.len() == self.participants.len() {
                    // A live finished table means this branch is not dead.
                    return false;
                }
                !table.children.is_empty()
                    && table.children.values().all(|&c| self.branch_dead(c))
            }
            TableState::Open | TableState::Rejected => false,
        }
    }

    fn deprecate_children(&mut self, id: TableId) {
        let children: Vec<TableId> = self.arena[id.0].children.values().copied().collect();
        self.arena[id.0].children.clear();
        let mut stack = children;
        while let Some(tid) = stack.pop() {
            let table = &mut self.arena[tid.0];
            table.deprecated = true;
            stack.extend(table.children.values().copied());
            table.children.clear();
        }
    }

    fn alloc(&mut self, table: Table) -> TableId {
        let id = TableId(self.arena.len());
        self.arena.push(table);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn two_party() -> TableTree {
        TableTree::new(vec![p(2), p(1)])
    }

    #[test]
    fn roots_exist_for_every_participant() {
        let tree = two_party();
        assert!(matches!(tree.find_for(p(1), &[]), Search::Found(_)));
        assert!(matches!(tree.find_for(p(2), &[]), Search::Found(_)));
        assert!(matches!(tree.find_for(p(3), &[]), Search::Absent));
    }

    #[test]
    fn submitting_a_root_opens_the_accommodating_seat() {
        let mut tree = two_party();
        let Search::Found(root) = tree.find_for(p(1), &[]) else {
            panic!("root for p1");
        };
        assert!(matches!(tree.find_for(p(2), &[key(1, 1)]), Search::Absent));

        assert!(tree.submit(root, routes(), 1));
        let Search::Found(child) = tree.find_for(p(2), &[key(1, 1)]) else {
            panic!("child seat after submit");
        };
        assert_eq!(tree.state(child), TableState::Open);
        assert!(!tree.ready());
    }

    #[test]
    fn full_depth_submission_makes_the_negotiation_ready() {
        let mut tree = two_party();
        let Search::Found(root) = tree.find_for(p(1), &[]) else {
            panic!("root");
        };
        tree.submit(root, routes(), 1);
        let Search::Found(child) = tree.find_for(p(2), &[key(1, 1)]) else {
            panic!("child");
        };
        tree.submit(child, routes(), 1);

        assert!(tree.ready());
        assert!(tree.complete());
        assert_eq!(tree.finished_tables(), vec![child]);
        assert_eq!(tree.sequence_keys(child), vec![key(1, 1), key(2, 1)]);
    }

    #[test]
    fn resubmission_deprecates_the_old_subtree() {
        let mut tree = two_party();
        let Search::Found(root) = tree.find_for(p(1), &[]) else {
            panic!("root");
        };
        tree.submit(root, routes(), 1);
        let Search::Found(child) = tree.find_for(p(2), &[key(1, 1)]) else {
            panic!("child");
        };
        tree.submit(child, routes(), 1);

        // p1 revises its proposal; the old chain is now deprecated.
        tree.submit(root, routes(), 2);
        assert!(matches!(tree.find_for(p(2), &[key(1, 1)]), Search::Deprecated));
        assert!(matches!(tree.find_for(p(2), &[key(1, 2)]), Search::Found(_)));
        assert!(!tree.ready());
        let _ = child;
    }

    #[test]
    fn stale_submissions_are_ignored() {
        let mut tree = two_party();
        let Search::Found(root) = tree.find_for(p(1), &[]) else {
            panic!("root");
        };
        assert!(tree.submit(root, routes(), 2));
        assert!(!tree.submit(root, routes(), 2));
        assert!(!tree.submit(root, routes(), 1));
    }

    #[test]
    fn rejection_requires_the_current_version() {
        let mut tree = two_party();
        let Search::Found(root) = tree.find_for(p(1), &[]) else {
            panic!("root");
        };
        tree.submit(root, routes(), 1);
        assert!(!tree.reject(root, 9, p(2), vec![]));
        assert!(tree.reject(root, 1, p(2), vec![routes()]));
        assert_eq!(tree.state(root), TableState::Rejected);
        assert_eq!(tree.alternatives(root).len(), 1);
    }

    #[test]
    fn rejected_sequences_deprecate_by_version_on_resubmit() {
        let mut tree = two_party();
        let Search::Found(root) = tree.find_for(p(1), &[]) else {
            panic!("root");
        };
        tree.submit(root, routes(), 1);
        tree.reject(root, 1, p(2), vec![]);
        tree.submit(root, routes(), 2);

        // A rejection naming the old submission no longer resolves.
        assert!(matches!(
            tree.find_table(&[key(1, 1)]),
            Search::Deprecated
        ));
        assert!(matches!(tree.find_table(&[key(1, 2)]), Search::Found(_)));
    }

    #[test]
    fn all_branches_forfeited_is_complete_but_not_ready() {
        let mut tree = two_party();
        let Search::Found(r1) = tree.find_for(p(1), &[]) else {
            panic!("r1");
        };
        let Search::Found(r2) = tree.find_for(p(2), &[]) else {
            panic!("r2");
        };
        tree.forfeit(r1, 0);
        assert!(!tree.complete());
        tree.forfeit(r2, 0);
        assert!(tree.complete());
        assert!(!tree.ready());
    }

    #[test]
    fn forfeited_parent_kills_the_branch_below_it() {
        let mut tree = two_party();
        let Search::Found(r1) = tree.find_for(p(1), &[]) else {
            panic!("r1");
        };
        let Search::Found(r2) = tree.find_for(p(2), &[]) else {
            panic!("r2");
        };
        tree.submit(r1, routes(), 1);
        let Search::Found(child) = tree.find_for(p(2), &[key(1, 1)]) else {
            panic!("child");
        };
        tree.forfeit(child, 0);
        tree.forfeit(r2, 0);
        assert!(tree.complete());
        assert!(!tree.ready());
    }

    #[test]
    fn messages_from_the_future_stay_absent() {
        let tree = two_party();
        // p2 accommodates a submission of p1 we have not seen yet.
        assert!(matches!(tree.find_for(p(2), &[key(1, 1)]), Search::Absent));
    }
}
