//! End-to-end scenarios over a live service and the in-process bus.

use std::time::{Duration, Instant};

use wayline::config::Config;
use wayline::core::{
    CollisionProfile, DatabaseVersion, ItineraryVersion, NodeVersion, ParticipantDescription,
    Query, Responsiveness, Trajectory, Waypoint,
};
use wayline::db::mirror::Mirror;
use wayline::negotiation::table::SequenceKey;
use wayline::participant::Participant;
use wayline::service::{NegotiationStatus, ScheduleService};
use wayline::transport::messages::{
    Acknowledgment, AckUpdate, ConflictAck, ConflictConclusion, ConflictNotice, ConflictProposal,
    InconsistencyMsg, ItinerarySet, MirrorUpdate, ParticipantsInfo, QueriesInfo,
    RegisterQueryRequest, RegisterQueryResponse, RequestChanges, RequestChangesResponse, services,
    topics,
};
use wayline::transport::Bus;
use wayline::writer::Writer;
use wayline::{Route, RouteId, Time};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        log_file_location: dir.path().join("registry.reglog"),
        update_period_ms: 5,
        query_cleanup_period_ms: 50,
        query_grace_period_ms: 100,
        ..Config::default()
    }
}

fn spawn(dir: &tempfile::TempDir) -> (Bus, ScheduleService) {
    let bus = Bus::new();
    let service = ScheduleService::spawn(bus.clone(), test_config(dir), NodeVersion::new(0))
        .expect("service spawns");
    (bus, service)
}

fn description(name: &str, responsiveness: Responsiveness) -> ParticipantDescription {
    ParticipantDescription::new(
        "fleet_a",
        name,
        responsiveness,
        CollisionProfile::with_radius(0.5),
    )
}

fn t(seconds: i64) -> Time {
    Time::UNIX_EPOCH + time::Duration::seconds(seconds)
}

fn line(map: &str, start: i64, end: i64, from: (f64, f64), to: (f64, f64)) -> (String, Trajectory) {
    let trajectory = Trajectory::new(vec![
        Waypoint::new(t(start), from.0, from.1),
        Waypoint::new(t(end), to.0, to.1),
    ])
    .expect("valid trajectory");
    (map.to_string(), trajectory)
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + RECV_TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

fn make_participant(writer: &Writer, name: &str) -> Participant {
    writer
        .make_participant(description(name, Responsiveness::Responsive))
        .wait()
        .expect("registration succeeds")
}

/// Scenario: colliding itineraries raise a notice; proposals resolve it; the
/// record is purged once both participants ack at their new versions.
#[test]
fn conflict_is_negotiated_to_a_resolved_conclusion() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, service) = spawn(&dir);
    let notices = bus.subscribe::<ConflictNotice>(topics::CONFLICT_NOTICE);
    let conclusions = bus.subscribe::<ConflictConclusion>(topics::CONFLICT_CONCLUSION);
    let proposal_pub = bus.publisher::<ConflictProposal>(topics::CONFLICT_PROPOSAL);
    let ack_pub = bus.publisher::<ConflictAck>(topics::CONFLICT_ACK);
    let writer = Writer::remote(&bus);

    let p1 = make_participant(&writer, "r1");
    let p2 = make_participant(&writer, "r2");

    // Head-on routes on the same map at the same time.
    p1.set_itinerary(vec![line("L1", 0, 10, (0.0, 0.0), (10.0, 0.0))]);
    p2.set_itinerary(vec![line("L1", 0, 10, (10.0, 0.0), (0.0, 0.0))]);

    let notice = notices.recv_timeout(RECV_TIMEOUT).expect("conflict notice");
    let mut named = notice.participants.clone();
    named.sort_unstable();
    assert_eq!(named, vec![p1.id(), p2.id()]);

    // Both sides propose delayed (non-colliding) revisions.
    let first = notice.participants[0];
    let second = *notice.participants.iter().find(|p| **p != first).unwrap();
    let delayed = |offset: i64, reverse: bool| {
        let (from, to) = if reverse {
            ((10.0, 0.0), (0.0, 0.0))
        } else {
            ((0.0, 0.0), (10.0, 0.0))
        };
        let (map, trajectory) = line("L1", offset, offset + 10, from, to);
        vec![Route::new(RouteId::new(1), map, trajectory)]
    };
    proposal_pub.publish(ConflictProposal {
        conflict_version: notice.conflict_version,
        for_participant: first,
        to_accommodate: vec![],
        itinerary: delayed(0, first == p2.id()),
        proposal_version: 1,
    });
    proposal_pub.publish(ConflictProposal {
        conflict_version: notice.conflict_version,
        for_participant: second,
        to_accommodate: vec![SequenceKey {
            participant: first,
            version: 1,
        }],
        itinerary: delayed(30, second == p2.id()),
        proposal_version: 1,
    });

    let conclusion = conclusions.recv_timeout(RECV_TIMEOUT).expect("conclusion");
    assert_eq!(conclusion.conflict_version, notice.conflict_version);
    assert!(conclusion.resolved);
    assert_eq!(conclusion.table.len(), 2);
    assert_eq!(
        service.negotiation_status(notice.conflict_version),
        NegotiationStatus::Waiting
    );

    // Both ack as updating, then actually push the promised revisions.
    ack_pub.publish(ConflictAck {
        conflict_version: notice.conflict_version,
        acknowledgments: vec![
            Acknowledgment {
                participant: p1.id(),
                update: AckUpdate::Updating(ItineraryVersion::new(2)),
            },
            Acknowledgment {
                participant: p2.id(),
                update: AckUpdate::Updating(ItineraryVersion::new(2)),
            },
        ],
    });
    p1.delay(time::Duration::seconds(5));
    p2.delay(time::Duration::seconds(35));

    wait_until("negotiation record purge", || {
        service.negotiation_status(notice.conflict_version) == NegotiationStatus::Purged
    });
}

/// Scenario: a gapped stream surfaces as an inconsistency; resending the
/// missing version closes it and subscribers converge on the full state.
#[test]
fn gaps_surface_as_inconsistencies_and_close_on_resend() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, service) = spawn(&dir);
    let inconsistencies = bus.subscribe::<InconsistencyMsg>(topics::INCONSISTENCY);
    let set_pub = bus.publisher::<ItinerarySet>(topics::ITINERARY_SET);
    let writer = Writer::remote(&bus);
    let p1 = make_participant(&writer, "r1");

    let route_at = |version: u64| {
        let (map, trajectory) = line("L1", 0, 10, (version as f64, 0.0), (version as f64 + 1.0, 0.0));
        vec![Route::new(RouteId::new(version), map, trajectory)]
    };

    set_pub.publish(ItinerarySet {
        participant: p1.id(),
        itinerary: route_at(1),
        itinerary_version: ItineraryVersion::new(1),
    });
    // Version 2 goes missing; version 3 arrives.
    set_pub.publish(ItinerarySet {
        participant: p1.id(),
        itinerary: route_at(3),
        itinerary_version: ItineraryVersion::new(3),
    });

    let report = inconsistencies
        .recv_timeout(RECV_TIMEOUT)
        .expect("inconsistency report");
    assert_eq!(report.participant, p1.id());
    assert_eq!(report.report.ranges.len(), 1);
    assert_eq!(report.report.ranges[0].lower, ItineraryVersion::new(2));
    assert_eq!(report.report.ranges[0].upper, ItineraryVersion::new(2));
    assert_eq!(report.report.last_known, ItineraryVersion::new(3));

    // Resend closes the gap and both held edits apply.
    set_pub.publish(ItinerarySet {
        participant: p1.id(),
        itinerary: route_at(2),
        itinerary_version: ItineraryVersion::new(2),
    });
    wait_until("gap to close", || {
        service.inconsistencies().is_empty()
            && service.participant_itinerary_version(p1.id()) == Some(ItineraryVersion::new(3))
    });

    // A subscriber that followed every patch matches a fresh snapshot.
    let register_query = bus.client::<RegisterQueryRequest, RegisterQueryResponse>(services::REGISTER_QUERY);
    let RegisterQueryResponse::Ok { query_id, .. } = register_query
        .call(RegisterQueryRequest { query: Query::all() })
        .expect("query registration")
    else {
        panic!("query registration rejected");
    };
    let updates = bus.subscribe::<MirrorUpdate>(&topics::mirror_update(query_id));

    let mut mirror = Mirror::new();
    wait_until("mirror to reach the database version", || {
        while let Ok(update) = updates.try_recv() {
            mirror.apply(&update.patch).expect("monotone patch stream");
        }
        mirror.latest_version() == Some(service.latest_version())
    });
    let routes = mirror.routes(p1.id()).expect("participant mirrored");
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].id, RouteId::new(3));
}

/// Scenario: a full-update request is answered by the next tick with a
/// remedial patch equivalent to a fresh snapshot.
#[test]
fn full_update_requests_get_a_remedial_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, service) = spawn(&dir);
    let writer = Writer::remote(&bus);
    let p1 = make_participant(&writer, "r1");
    p1.set_itinerary(vec![line("L1", 0, 10, (0.0, 0.0), (10.0, 0.0))]);

    let register_query = bus.client::<RegisterQueryRequest, RegisterQueryResponse>(services::REGISTER_QUERY);
    let RegisterQueryResponse::Ok { query_id, .. } = register_query
        .call(RegisterQueryRequest { query: Query::all() })
        .expect("query registration")
    else {
        panic!("query registration rejected");
    };
    let updates = bus.subscribe::<MirrorUpdate>(&topics::mirror_update(query_id));

    let request_changes = bus.client::<RequestChanges, RequestChangesResponse>(services::REQUEST_CHANGES);
    let response = request_changes
        .call(RequestChanges {
            query_id,
            from_version: None,
            full_update: true,
        })
        .expect("request accepted");
    assert_eq!(response, RequestChangesResponse::Accepted);

    let deadline = Instant::now() + RECV_TIMEOUT;
    let remedial = loop {
        assert!(Instant::now() < deadline, "no remedial update arrived");
        let update = updates.recv_timeout(RECV_TIMEOUT).expect("mirror update");
        if update.is_remedial {
            break update;
        }
    };
    assert_eq!(remedial.patch.base, None);

    let mut mirror = Mirror::new();
    mirror.apply(&remedial.patch).expect("snapshot applies");
    assert_eq!(mirror.routes(p1.id()).expect("mirrored").len(), 1);

    // Unknown query ids are refused.
    let response = request_changes
        .call(RequestChanges {
            query_id: wayline::QueryId::new(9999),
            from_version: Some(DatabaseVersion::ZERO),
            full_update: false,
        })
        .expect("call completes");
    assert_eq!(response, RequestChangesResponse::UnknownQueryId);
}

/// Scenario: re-registering the same (owner, name) keeps the id, updates the
/// description, and re-broadcasts the participant list.
#[test]
fn reregistration_is_idempotent_and_rebroadcasts() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, _service) = spawn(&dir);
    let register = bus.client::<ParticipantDescription, wayline::transport::messages::RegisterParticipantResponse>(
        services::REGISTER_PARTICIPANT,
    );

    let first = match register
        .call(description("r1", Responsiveness::Responsive))
        .expect("first registration")
    {
        wayline::transport::messages::RegisterParticipantResponse::Ok(reg) => reg,
        wayline::transport::messages::RegisterParticipantResponse::Err(e) => panic!("{e}"),
    };

    let mut updated = description("r1", Responsiveness::Responsive);
    updated.profile = CollisionProfile::with_radius(1.5);
    let second = match register.call(updated).expect("second registration") {
        wayline::transport::messages::RegisterParticipantResponse::Ok(reg) => reg,
        wayline::transport::messages::RegisterParticipantResponse::Err(e) => panic!("{e}"),
    };
    assert_eq!(first.id, second.id);

    // The latched participant list reflects the updated profile.
    let info = bus.subscribe::<ParticipantsInfo>(topics::PARTICIPANTS_INFO);
    wait_until("participants_info to carry the new profile", || {
        let mut latest = None;
        while let Ok(msg) = info.try_recv() {
            latest = Some(msg);
        }
        latest.is_some_and(|msg| {
            msg.participants
                .iter()
                .any(|(id, d)| *id == first.id && d.profile.footprint_radius == 1.5)
        })
    });
}

/// Scenario: two unresponsive participants colliding raise no conflict.
#[test]
fn mutually_unresponsive_participants_raise_no_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, _service) = spawn(&dir);
    let notices = bus.subscribe::<ConflictNotice>(topics::CONFLICT_NOTICE);
    let writer = Writer::remote(&bus);

    let p1 = writer
        .make_participant(description("r1", Responsiveness::Unresponsive))
        .wait()
        .unwrap();
    let p2 = writer
        .make_participant(description("r2", Responsiveness::Unresponsive))
        .wait()
        .unwrap();

    p1.set_itinerary(vec![line("L1", 0, 10, (0.0, 0.0), (10.0, 0.0))]);
    p2.set_itinerary(vec![line("L1", 0, 10, (10.0, 0.0), (0.0, 0.0))]);

    assert!(
        notices.recv_timeout(Duration::from_millis(400)).is_err(),
        "no notice should be raised for a mutually unresponsive pair"
    );
}

/// Scenario: a query with zero subscribers is erased after the grace period
/// and the latched registry broadcast reflects the removal.
#[test]
fn idle_queries_are_garbage_collected() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, _service) = spawn(&dir);

    let register_query = bus.client::<RegisterQueryRequest, RegisterQueryResponse>(services::REGISTER_QUERY);
    let RegisterQueryResponse::Ok { query_id, .. } = register_query
        .call(RegisterQueryRequest { query: Query::all() })
        .expect("query registration")
    else {
        panic!("query registration rejected");
    };

    let info = bus.subscribe::<QueriesInfo>(topics::QUERIES_INFO);
    wait_until("query registry broadcast to list the query", || {
        let mut latest = None;
        while let Ok(msg) = info.try_recv() {
            latest = Some(msg);
        }
        latest.is_some_and(|msg| msg.queries.iter().any(|(id, _)| *id == query_id))
    });

    // Nobody ever subscribes to the update topic; grace (100ms) elapses.
    wait_until("query to be garbage collected", || {
        let mut latest = None;
        while let Ok(msg) = info.try_recv() {
            latest = Some(msg);
        }
        latest.is_some_and(|msg| msg.queries.is_empty())
    });
}

/// Registering twice with the same identity does not advance the itinerary
/// version stream.
#[test]
fn reregistration_does_not_disturb_the_version_stream() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, service) = spawn(&dir);
    let writer = Writer::remote(&bus);

    let p1 = make_participant(&writer, "r1");
    p1.set_itinerary(vec![line("L1", 0, 10, (0.0, 0.0), (10.0, 0.0))]);
    wait_until("edit to land", || {
        service.participant_itinerary_version(p1.id()) == Some(ItineraryVersion::new(1))
    });

    let p1_again = make_participant(&writer, "r1");
    assert_eq!(p1_again.id(), p1.id());
    assert_eq!(
        service.participant_itinerary_version(p1.id()),
        Some(ItineraryVersion::new(1))
    );

    // The resumed handle continues the stream where it left off.
    p1_again.delay(time::Duration::seconds(1));
    wait_until("resumed edit to land", || {
        service.participant_itinerary_version(p1.id()) == Some(ItineraryVersion::new(2))
    });
}
