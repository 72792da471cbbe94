//! The mirror update tick: drain remediation requests, push incremental
//! patches, garbage-collect idle queries, wake the conflict detector.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::transport::messages::MirrorUpdate;

use super::Shared;

pub(crate) fn run(shared: Arc<Shared>) {
    let period = shared.config.update_period();
    let cleanup_period = shared.config.query_cleanup_period();
    let grace = shared.config.query_grace_period();
    let mut last_cleanup = Instant::now();

    loop {
        if shared.quitting() {
            return;
        }
        std::thread::sleep(period);
        if shared.quitting() {
            return;
        }

        tick(&shared);

        if last_cleanup.elapsed() >= cleanup_period {
            last_cleanup = Instant::now();
            let mut db = shared.lock_db();
            if db.queries.cleanup(grace, Instant::now()) {
                shared.broadcast_queries(&db);
            }
        }
    }
}

fn tick(shared: &Shared) {
    {
        let mut db = shared.lock_db();
        let crate::service::DbState {
            database, queries, ..
        } = &mut *db;
        let latest = database.latest_version();

        for (id, record) in queries.iter_mut() {
            // Remediation first: requested resends go out regardless of
            // whether anything new happened.
            let requests = std::mem::take(&mut record.remediation_requests);
            for request in requests {
                let patch = database.changes(&record.query, request);
                record.publisher.publish(MirrorUpdate {
                    node_version: shared.node_version,
                    database_version: latest,
                    patch,
                    is_remedial: true,
                });
            }

            if record.last_sent_version == Some(latest) {
                continue;
            }
            let patch = database.changes(&record.query, record.last_sent_version);
            if !patch.is_empty() {
                record.publisher.publish(MirrorUpdate {
                    node_version: shared.node_version,
                    database_version: latest,
                    patch,
                    is_remedial: false,
                });
                debug!(query_id = %id, "updated query");
            }
            record.last_sent_version = Some(latest);
        }
    }

    shared.conflict_cv.notify_all();
}
