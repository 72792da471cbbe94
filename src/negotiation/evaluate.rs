//! Choosing among finished tables: the quickest-finish policy.

use crate::core::Time;

use super::table::{TableId, TableTree};

/// Pick the finished table that minimizes the latest finish time across
/// participants, breaking ties by the next later finish and finally by the
/// stable participant ordering of the sequence.
pub fn quickest_finish(tree: &TableTree) -> Option<TableId> {
    tree.finished_tables()
        .into_iter()
        .min_by(|&a, &b| score(tree, a).cmp(&score(tree, b)))
}

/// Finish times sorted latest-first, then the sequence itself for stability.
/// A seat with no routes finishes "never started", which sorts earliest.
fn score(tree: &TableTree, id: TableId) -> (Vec<Option<Time>>, Vec<u64>) {
    let mut finishes: Vec<Option<Time>> = tree
        .proposals_along(id)
        .iter()
        .map(|(_, proposal)| {
            proposal.and_then(|routes| TableTree::proposal_finish(routes))
        })
        .collect();
    finishes.sort_by(|a, b| b.cmp(a));

    let order = tree
        .proposals_along(id)
        .iter()
        .map(|(participant, _)| participant.get())
        .collect();
    (finishes, order)
}
