//! Named saved queries, each with an outbound change stream.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use crate::core::{DatabaseVersion, Query, QueryId};
use crate::transport::messages::{MirrorUpdate, topics};
use crate::transport::{Bus, Publisher};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no query registered with id [{0}]")]
    UnknownQueryId(QueryId),
    #[error("no more space for additional queries to be registered")]
    QueryIdExhausted,
}

/// One registered query: predicate, outbound stream, and the bookkeeping the
/// mirror update engine drains every tick.
pub struct QueryRecord {
    pub query: Query,
    pub publisher: Publisher<MirrorUpdate>,
    pub last_sent_version: Option<DatabaseVersion>,
    pub last_registration_time: Instant,
    /// Pending resend requests; `None` means "send a full update".
    pub remediation_requests: BTreeSet<Option<DatabaseVersion>>,
}

#[derive(Default)]
pub struct QueryRegistry {
    records: BTreeMap<QueryId, QueryRecord>,
    /// Monotone allocation hint; the scan may still wrap past it.
    last_query_id: u64,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deduplicating registration: an equal predicate returns the existing id
    /// and refreshes its registration time.
    pub fn register(&mut self, query: Query, bus: &Bus) -> Result<QueryId, QueryError> {
        for (id, record) in &mut self.records {
            if record.query == query {
                debug!(query_id = %id, "a new mirror is tracking an existing query");
                record.last_registration_time = Instant::now();
                return Ok(*id);
            }
        }

        let mut raw = self.last_query_id;
        let mut attempts = 0u64;
        loop {
            raw = raw.wrapping_add(1);
            attempts += 1;
            if attempts == u64::MAX {
                return Err(QueryError::QueryIdExhausted);
            }
            if !self.records.contains_key(&QueryId::new(raw)) {
                break;
            }
        }

        let id = QueryId::new(raw);
        let publisher = bus.publisher::<MirrorUpdate>(&topics::mirror_update(id));
        self.records.insert(
            id,
            QueryRecord {
                query,
                publisher,
                last_sent_version: None,
                last_registration_time: Instant::now(),
                remediation_requests: BTreeSet::new(),
            },
        );
        self.last_query_id = raw;
        info!(query_id = %id, "registered new query");
        Ok(id)
    }

    /// Queue a resend for a subscriber that noticed a gap. Requests at or
    /// ahead of the last sent version are already satisfied and dropped.
    pub fn request_changes(
        &mut self,
        id: QueryId,
        from_version: Option<DatabaseVersion>,
        full_update: bool,
    ) -> Result<(), QueryError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(QueryError::UnknownQueryId(id))?;

        if full_update {
            record.remediation_requests.insert(None);
            return Ok(());
        }
        if let Some(version) = from_version
            && let Some(last_sent) = record.last_sent_version
            && version.precedes(last_sent)
        {
            record.remediation_requests.insert(Some(version));
        }
        Ok(())
    }

    /// Erase queries that have had zero live subscribers for longer than the
    /// grace period. Returns true when anything was erased.
    pub fn cleanup(&mut self, grace: Duration, now: Instant) -> bool {
        let mut erased = Vec::new();
        self.records.retain(|id, record| {
            let keep = record.publisher.subscriber_count() > 0
                || now.duration_since(record.last_registration_time) <= grace;
            if !keep {
                erased.push(*id);
            }
            keep
        });
        for id in &erased {
            info!(query_id = %id, "erased query with no subscribers");
        }
        !erased.is_empty()
    }

    pub fn get(&self, id: QueryId) -> Option<&QueryRecord> {
        self.records.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (QueryId, &QueryRecord)> {
        self.records.iter().map(|(id, record)| (*id, record))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (QueryId, &mut QueryRecord)> {
        self.records.iter_mut().map(|(id, record)| (*id, record))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
