//! Wire payloads carried over the transport, and the topic/service names
//! they travel on.

use serde::{Deserialize, Serialize};
use time::Duration;
use uuid::Uuid;

use crate::core::{
    DatabaseVersion, InconsistencyRanges, ItineraryVersion, NodeVersion, ParticipantDescription,
    ParticipantId, Patch, Query, QueryId, Route, RouteId,
};
use crate::negotiation::table::SequenceKey;
use crate::negotiation::NegotiationVersion;
use crate::registry::Registration;

pub mod topics {
    use crate::core::QueryId;

    pub const ITINERARY_SET: &str = "itinerary/set";
    pub const ITINERARY_EXTEND: &str = "itinerary/extend";
    pub const ITINERARY_DELAY: &str = "itinerary/delay";
    pub const ITINERARY_ERASE: &str = "itinerary/erase";
    pub const ITINERARY_CLEAR: &str = "itinerary/clear";
    pub const INCONSISTENCY: &str = "inconsistency";
    pub const PARTICIPANTS_INFO: &str = "participants_info";
    pub const QUERIES_INFO: &str = "queries_info";
    pub const CONFLICT_NOTICE: &str = "conflict/notice";
    pub const CONFLICT_CONCLUSION: &str = "conflict/conclusion";
    pub const CONFLICT_ACK: &str = "conflict/ack";
    pub const CONFLICT_REFUSAL: &str = "conflict/refusal";
    pub const CONFLICT_PROPOSAL: &str = "conflict/proposal";
    pub const CONFLICT_REJECTION: &str = "conflict/rejection";
    pub const CONFLICT_FORFEIT: &str = "conflict/forfeit";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const FAILOVER: &str = "failover";

    pub fn mirror_update(query: QueryId) -> String {
        format!("mirror_update/{query}")
    }
}

pub mod services {
    pub const REGISTER_PARTICIPANT: &str = "register_participant";
    pub const UNREGISTER_PARTICIPANT: &str = "unregister_participant";
    pub const REGISTER_QUERY: &str = "register_query";
    pub const REQUEST_CHANGES: &str = "request_changes";
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItinerarySet {
    pub participant: ParticipantId,
    pub itinerary: Vec<Route>,
    pub itinerary_version: ItineraryVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItineraryExtend {
    pub participant: ParticipantId,
    pub routes: Vec<Route>,
    pub itinerary_version: ItineraryVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItineraryDelay {
    pub participant: ParticipantId,
    pub delay: Duration,
    pub itinerary_version: ItineraryVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItineraryErase {
    pub participant: ParticipantId,
    pub routes: Vec<RouteId>,
    pub itinerary_version: ItineraryVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItineraryClear {
    pub participant: ParticipantId,
    pub itinerary_version: ItineraryVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InconsistencyMsg {
    pub participant: ParticipantId,
    pub report: InconsistencyRanges,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MirrorUpdate {
    pub node_version: NodeVersion,
    pub database_version: DatabaseVersion,
    pub patch: Patch,
    pub is_remedial: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipantsInfo {
    pub participants: Vec<(ParticipantId, ParticipantDescription)>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueriesInfo {
    pub node_version: NodeVersion,
    pub queries: Vec<(QueryId, Query)>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictNotice {
    pub conflict_version: NegotiationVersion,
    pub participants: Vec<ParticipantId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictConclusion {
    pub conflict_version: NegotiationVersion,
    pub resolved: bool,
    /// The chosen accommodation sequence when resolved.
    pub table: Vec<SequenceKey>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckUpdate {
    /// The participant will push a revised itinerary at this version.
    Updating(ItineraryVersion),
    /// The participant accepts the conclusion without changing anything.
    NotUpdating,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub participant: ParticipantId,
    pub update: AckUpdate,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictAck {
    pub conflict_version: NegotiationVersion,
    pub acknowledgments: Vec<Acknowledgment>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictRefusal {
    pub conflict_version: NegotiationVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictProposal {
    pub conflict_version: NegotiationVersion,
    pub for_participant: ParticipantId,
    /// The chain of already-submitted proposals being accommodated.
    pub to_accommodate: Vec<SequenceKey>,
    pub itinerary: Vec<Route>,
    pub proposal_version: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictRejection {
    pub conflict_version: NegotiationVersion,
    /// Full sequence naming the rejected table; the last key carries the
    /// proposal version being rejected.
    pub table: Vec<SequenceKey>,
    pub rejected_by: ParticipantId,
    /// Itineraries the rejecting participant could actually accept.
    pub alternatives: Vec<Vec<Route>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictForfeit {
    pub conflict_version: NegotiationVersion,
    pub table: Vec<SequenceKey>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_version: NodeVersion,
    pub service_id: Uuid,
}

/// Advisory that a standby has taken over; writers rebind their endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailOverEvent;

/// Response payload for `register_participant`.
#[derive(Clone, Debug, PartialEq)]
pub enum RegisterParticipantResponse {
    Ok(Registration),
    Err(String),
}

/// Response payload for `unregister_participant`.
#[derive(Clone, Debug, PartialEq)]
pub enum UnregisterParticipantResponse {
    Ok,
    Err(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RegisterQueryRequest {
    pub query: Query,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RegisterQueryResponse {
    Ok {
        query_id: QueryId,
        node_version: NodeVersion,
    },
    Err(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RequestChanges {
    pub query_id: QueryId,
    /// Resend from this version; `None` asks for a full update.
    pub from_version: Option<DatabaseVersion>,
    pub full_update: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestChangesResponse {
    Accepted,
    UnknownQueryId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnregisterParticipant {
    pub participant: ParticipantId,
}
