//! The conflict detection loop.
//!
//! Runs on its own thread against a private mirror. The database lock is
//! held only long enough to take a patch and apply it; the pairwise
//! geometric checks happen outside the lock.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, info};

use crate::core::{ConflictEvaluator, DatabaseVersion, ParticipantId, Query};
use crate::db::mirror::Mirror;
use crate::negotiation::ConflictSet;
use crate::transport::messages::ConflictNotice;

use super::Shared;

pub(crate) fn run(shared: Arc<Shared>) {
    let mut mirror = Mirror::new();
    let query_all = Query::all();
    // None until the first full snapshot lands in the mirror.
    let mut last_checked: Option<DatabaseVersion> = None;
    let mut known_participants_version = 0u64;
    let wait = shared.config.conflict_wait();

    loop {
        let changed;
        {
            let guard = shared.lock_db();
            let (guard, _) = shared
                .conflict_cv
                .wait_timeout(guard, wait)
                .expect("database lock");

            if shared.quitting() {
                return;
            }

            let participants_moved = guard.participants_version != known_participants_version;
            if Some(guard.database.latest_version()) == last_checked && !participants_moved {
                // Casual wakeup; nothing to check yet.
                continue;
            }

            if participants_moved {
                known_participants_version = guard.participants_version;
                mirror.update_participants(guard.database.descriptions());
            }

            let patch = guard.database.changes(&query_all, last_checked);
            match mirror.apply(&patch) {
                Ok(touched) => {
                    last_checked = Some(patch.latest);
                    changed = touched;
                }
                Err(err) => {
                    // Skip the round without advancing; the next patch
                    // covers the same window again.
                    error!("mirror update failed, skipping conflict round: {err}");
                    continue;
                }
            }
        }

        if changed.is_empty() {
            continue;
        }

        let conflicts = find_conflicts(&mirror, &changed, shared.evaluator.as_ref());
        for conflict in conflicts {
            let opened = {
                let mut negotiations = shared.lock_negotiations();
                negotiations.insert(conflict)
            };
            if let Some((version, participants)) = opened {
                info!(
                    negotiation = %version,
                    a = %participants[0],
                    b = %participants[participants.len() - 1],
                    "conflict detected, opening negotiation"
                );
                shared.conflict_notice_pub.publish(ConflictNotice {
                    conflict_version: version,
                    participants,
                });
            }
        }
    }
}

/// Pairwise check of every changed participant's current routes against the
/// rest of the mirror. Pairs where both sides are unresponsive are skipped.
pub(crate) fn find_conflicts(
    mirror: &Mirror,
    changed: &[ParticipantId],
    evaluator: &dyn ConflictEvaluator,
) -> Vec<ConflictSet> {
    let mut pairs: BTreeSet<(ParticipantId, ParticipantId)> = BTreeSet::new();
    let others: Vec<ParticipantId> = mirror.participants().collect();

    for &p in changed {
        let Some(p_desc) = mirror.description(p) else {
            continue;
        };
        let Some(p_routes) = mirror.routes(p) else {
            continue;
        };

        for &q in &others {
            if q == p || pairs.contains(&normalize(p, q)) {
                continue;
            }
            let Some(q_desc) = mirror.description(q) else {
                continue;
            };
            if p_desc.is_unresponsive() && q_desc.is_unresponsive() {
                continue;
            }
            let Some(q_routes) = mirror.routes(q) else {
                continue;
            };

            'route_pairs: for p_route in &p_routes {
                for q_route in &q_routes {
                    if p_route.map != q_route.map {
                        continue;
                    }
                    if evaluator.between(
                        &p_desc.profile,
                        &p_route.trajectory,
                        &q_desc.profile,
                        &q_route.trajectory,
                    ) {
                        pairs.insert(normalize(p, q));
                        break 'route_pairs;
                    }
                }
            }
        }
    }

    pairs
        .into_iter()
        .map(|(a, b)| ConflictSet::new(a, b))
        .collect()
}

fn normalize(a: ParticipantId, b: ParticipantId) -> (ParticipantId, ParticipantId) {
    if a <= b { (a, b) } else { (b, a) }
}
