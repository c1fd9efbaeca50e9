//! Deterministic single-node sequencer tests driven by a manual clock.

mod common;

use std::sync::Arc;

use keel_cluster::bus::{ControlledAction, Image, MediaBus};
use keel_cluster::counters::ToggleState;
use keel_cluster::idle::NoOpIdle;
use keel_cluster::ingress::AdminQueryType;
use keel_cluster::log::LogEntry;
use keel_cluster::sequencer::{
    SequencerAgent, SESSION_LIMIT_MSG, SESSION_REJECTED_MSG, SESSION_TIMEOUT_MSG,
};
use keel_cluster::service::{ClusterAction, ServiceControlPublisher};
use keel_cluster::time::{EpochClock, ManualEpochClock};
use keel_cluster::{
    AllowAllAuthenticator, ChallengeAuthenticator, ClientEvent, ClusterClient, ConsensusState,
    RecordingLog, Role, SessionState,
};

struct SingleNode {
    bus: MediaBus,
    clock: ManualEpochClock,
    agent: SequencerAgent,
    wiring: common::NodeWiring,
    _dir: tempfile::TempDir,
    dir_path: std::path::PathBuf,
}

fn start_single_node(
    configure: impl FnOnce(&mut keel_cluster::sequencer::SequencerContext),
) -> SingleNode {
    let dir = tempfile::tempdir().unwrap();
    let dir_path = dir.path().to_path_buf();
    let bus = MediaBus::new();
    let clock = ManualEpochClock::new(1_000);

    let (mut ctx, wiring) = common::node_context(0, 1, &bus, dir.path(), "1");
    ctx.epoch_clock = Arc::new(clock.clone());
    ctx.idle_strategy = Arc::new(NoOpIdle);
    configure(&mut ctx);

    let mut agent = SequencerAgent::new(ctx, Box::new(AllowAllAuthenticator)).unwrap();
    agent.on_start().unwrap();

    SingleNode {
        bus,
        clock,
        agent,
        wiring,
        _dir: dir,
        dir_path,
    }
}

fn pump(node: &mut SingleNode, ticks: u32) {
    for _ in 0..ticks {
        node.clock.advance(1);
        node.agent.do_work().unwrap();
    }
}

fn connect_client(node: &mut SingleNode, response_channel: &str) -> ClusterClient {
    let mut client = ClusterClient::connect(
        &node.bus,
        &common::ingress_channel("1", 0),
        101,
        response_channel,
        201,
    )
    .unwrap();
    assert!(client.send_connect_request(b""));
    pump(node, 4);
    let events = client.poll();
    assert!(
        matches!(events.first(), Some(ClientEvent::SessionOpened { .. })),
        "expected session open, got {events:?}"
    );
    client
}

fn drain_log(image: &Image) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    image.controlled_poll(
        &mut |_, payload| {
            entries.push(LogEntry::decode(payload).unwrap());
            ControlledAction::Continue
        },
        1_024,
    );
    entries
}

#[test]
fn cold_start_becomes_leader() {
    let node = start_single_node(|_| {});

    assert_eq!(node.agent.role(), Role::Leader);
    assert_eq!(node.agent.consensus_state(), ConsensusState::Active);
    assert_eq!(node.agent.leadership_term_id(), 0);
    assert_eq!(node.agent.base_log_position(), 0);

    let recovery_state = node.wiring.registry.recovery_state().unwrap();
    assert_eq!(recovery_state.term_count, 0);
    assert_eq!(recovery_state.leadership_term_id, -1);
    assert_eq!(recovery_state.log_position, 0);

    let log = RecordingLog::load_or_init(node.dir_path.join("node-0-recording.json")).unwrap();
    assert_eq!(log.entries().len(), 1);
    assert_eq!(log.entries()[0].leadership_term_id, 0);
    assert_eq!(log.entries()[0].log_position, 0);

    // Slow ticks stamp the liveness mark.
    let mut node = node;
    pump(&mut node, 1);
    assert_eq!(
        node.wiring.mark_file.activity_timestamp_ms(),
        node.clock.time_ms()
    );
}

#[test]
fn session_lifecycle_appends_and_commits() {
    let mut node = start_single_node(|_| {});
    let log_spy = node.bus.add_subscription("spy:mem://log", 100).unwrap();

    let mut client = connect_client(&mut node, "mem://egress-lifecycle");
    assert_eq!(client.session_id(), Some(1));
    let states = node.agent.session_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].0, 1);
    assert!(matches!(states[0].1, SessionState::Open { .. }));

    for payload in [b"order:1".as_slice(), b"order:2", b"order:3"] {
        assert!(client.send_message(payload));
    }
    pump(&mut node, 4);

    let image = log_spy.images().pop().unwrap();
    let entries = drain_log(&image);
    let message_count = entries
        .iter()
        .filter(|e| matches!(e, LogEntry::SessionMessage { .. }))
        .count();
    assert_eq!(message_count, 3);
    assert_eq!(node.agent.commit_position_value(), Some(image.position()));

    assert!(client.send_close_request());
    pump(&mut node, 4);
    assert!(node.agent.session_states().is_empty());

    let entries = drain_log(&image);
    assert!(entries.iter().any(|e| matches!(
        e,
        LogEntry::SessionClose {
            close_reason: keel_cluster::CloseReason::UserAction,
            ..
        }
    )));
}

#[test]
fn back_pressure_aborts_and_retries_ingress() {
    let mut node = start_single_node(|ctx| {
        ctx.log_channel = "mem://log?window=300".to_string();
    });
    // A slow consumer that is not drained caps the publisher's window; the
    // appended position is observed through the commit counter instead.
    let log_spy = node.bus.add_subscription("spy:mem://log", 100).unwrap();
    let image = log_spy.images().pop().unwrap();

    let mut client = connect_client(&mut node, "mem://egress-bp");
    let position_after_open = node.agent.commit_position_value().unwrap();

    let payload = [7u8; 64];
    assert!(client.send_message(&payload));
    assert!(client.send_message(&payload));
    assert!(client.send_message(&payload));
    pump(&mut node, 4);

    // Two messages fit the window; the third hit back-pressure and stayed
    // queued on ingress.
    let position_after_second = node.agent.commit_position_value().unwrap();
    assert!(position_after_second > position_after_open);
    let stamp_after_second = node.agent.session_activity_ms(1).unwrap();

    pump(&mut node, 4);
    assert_eq!(
        node.agent.commit_position_value().unwrap(),
        position_after_second
    );
    assert_eq!(node.agent.session_activity_ms(1).unwrap(), stamp_after_second);

    // Draining the slow consumer frees the window; the retried message lands
    // and the activity stamp reflects the successful append time.
    let entries = drain_log(&image);
    assert_eq!(
        entries
            .iter()
            .filter(|e| matches!(e, LogEntry::SessionMessage { .. }))
            .count(),
        2
    );
    pump(&mut node, 2);
    assert!(node.agent.commit_position_value().unwrap() > position_after_second);
    assert!(node.agent.session_activity_ms(1).unwrap() > stamp_after_second);

    let entries = drain_log(&image);
    assert_eq!(entries.len(), 1);
    assert!(matches!(entries[0], LogEntry::SessionMessage { .. }));
}

#[test]
fn session_times_out_strictly_after_the_timeout() {
    let mut node = start_single_node(|ctx| {
        ctx.session_timeout_ms = 500;
    });
    let mut client = connect_client(&mut node, "mem://egress-timeout");

    let last_activity = node.agent.session_activity_ms(1).unwrap();

    // Exactly at the timeout: still alive.
    node.clock.set(last_activity + 500);
    node.agent.do_work().unwrap();
    assert_eq!(node.agent.session_states().len(), 1);

    // One millisecond later: reaped with an egress error.
    node.clock.set(last_activity + 501);
    node.agent.do_work().unwrap();
    assert!(node.agent.session_states().is_empty());

    let events = client.poll();
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::Error { detail } if detail == SESSION_TIMEOUT_MSG)));
}

#[test]
fn keep_alive_extends_an_idle_session() {
    let mut node = start_single_node(|ctx| {
        ctx.session_timeout_ms = 500;
    });
    let mut client = connect_client(&mut node, "mem://egress-keepalive");

    node.clock.advance(400);
    assert!(client.send_keep_alive());
    node.agent.do_work().unwrap();
    let stamped = node.agent.session_activity_ms(1).unwrap();

    // Past the original deadline but within the refreshed one.
    node.clock.set(stamped + 400);
    node.agent.do_work().unwrap();
    assert_eq!(node.agent.session_states().len(), 1);

    node.clock.set(stamped + 501);
    node.agent.do_work().unwrap();
    assert!(node.agent.session_states().is_empty());
}

#[test]
fn session_limit_rejects_the_next_connect() {
    let mut node = start_single_node(|ctx| {
        ctx.max_concurrent_sessions = 1;
    });
    let _client = connect_client(&mut node, "mem://egress-first");

    let mut second = ClusterClient::connect(
        &node.bus,
        &common::ingress_channel("1", 0),
        101,
        "mem://egress-second",
        201,
    )
    .unwrap();
    assert!(second.send_connect_request(b""));
    pump(&mut node, 4);

    let events = second.poll();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ClientEvent::Error { detail } if detail == SESSION_LIMIT_MSG)),
        "expected session limit rejection, got {events:?}"
    );
    assert!(second.session_id().is_none());
}

#[test]
fn challenge_authentication_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MediaBus::new();
    let clock = ManualEpochClock::new(1_000);

    let (mut ctx, wiring) = common::node_context(0, 1, &bus, dir.path(), "1");
    ctx.epoch_clock = Arc::new(clock.clone());
    ctx.idle_strategy = Arc::new(NoOpIdle);
    let mut agent = SequencerAgent::new(
        ctx,
        Box::new(ChallengeAuthenticator::new(b"secret", b"nonce")),
    )
    .unwrap();
    agent.on_start().unwrap();
    let mut node = SingleNode {
        bus,
        clock,
        agent,
        wiring,
        _dir: dir,
        dir_path: std::path::PathBuf::new(),
    };

    let mut client = ClusterClient::connect(
        &node.bus,
        &common::ingress_channel("1", 0),
        101,
        "mem://egress-challenge",
        201,
    )
    .unwrap();
    assert!(client.send_connect_request(b""));
    pump(&mut node, 4);

    let events = client.poll();
    let Some(ClientEvent::Challenged {
        session_id,
        challenge_data,
    }) = events.first()
    else {
        panic!("expected challenge, got {events:?}");
    };
    assert_eq!(challenge_data, b"nonce");

    assert!(client.send_challenge_response(*session_id, b"secret"));
    pump(&mut node, 4);
    let events = client.poll();
    assert!(
        matches!(events.first(), Some(ClientEvent::SessionOpened { .. })),
        "expected session open after challenge, got {events:?}"
    );

    // A second client presenting the wrong secret is rejected.
    let mut wrong = ClusterClient::connect(
        &node.bus,
        &common::ingress_channel("1", 0),
        101,
        "mem://egress-wrong",
        201,
    )
    .unwrap();
    assert!(wrong.send_connect_request(b"not-it"));
    pump(&mut node, 4);
    let events = wrong.poll();
    assert!(
        events.iter().any(|e| matches!(
            e,
            ClientEvent::AuthenticationRejected { detail } if detail == SESSION_REJECTED_MSG
        )),
        "expected authentication rejection, got {events:?}"
    );
}

#[test]
fn snapshot_toggle_round_trips_to_active() {
    let mut node = start_single_node(|_| {});
    let log_spy = node.bus.add_subscription("spy:mem://log", 100).unwrap();
    let image = log_spy.images().pop().unwrap();

    let _client = connect_client(&mut node, "mem://egress-snap");
    drain_log(&image);

    assert!(ToggleState::Snapshot.activate(&node.wiring.counters.control_toggle));
    pump(&mut node, 2);
    let completion_time = node.clock.time_ms();

    assert_eq!(node.agent.consensus_state(), ConsensusState::Active);
    assert_eq!(node.wiring.counters.snapshot_count.get(), 1);
    assert_eq!(
        ToggleState::get(&node.wiring.counters.control_toggle),
        ToggleState::Neutral
    );

    let entries = drain_log(&image);
    assert!(entries.iter().any(|e| matches!(
        e,
        LogEntry::ClusterAction {
            action: ClusterAction::Snapshot,
            ..
        }
    )));

    // Open sessions had their activity stamped at completion.
    assert!(node.agent.session_activity_ms(1).unwrap() >= completion_time - 2);

    let log = RecordingLog::load_or_init(node.dir_path.join("node-0-recording.json")).unwrap();
    assert!(log
        .entries()
        .iter()
        .any(|e| e.entry_type == keel_cluster::recording_log::EntryType::Snapshot));
}

#[test]
fn snapshot_toggle_stays_pending_while_suspended() {
    let mut node = start_single_node(|_| {});
    let log_spy = node.bus.add_subscription("spy:mem://log", 100).unwrap();
    let image = log_spy.images().pop().unwrap();

    assert!(ToggleState::Suspend.activate(&node.wiring.counters.control_toggle));
    pump(&mut node, 2);
    assert_eq!(node.agent.consensus_state(), ConsensusState::Suspended);
    drain_log(&image);

    assert!(ToggleState::Snapshot.activate(&node.wiring.counters.control_toggle));
    pump(&mut node, 4);

    // Not active: no action appended, toggle stays pending.
    assert_eq!(node.agent.consensus_state(), ConsensusState::Suspended);
    assert!(drain_log(&image).is_empty());
    assert_eq!(
        ToggleState::get(&node.wiring.counters.control_toggle),
        ToggleState::Snapshot
    );
    assert_eq!(node.wiring.counters.snapshot_count.get(), 0);
}

#[test]
fn timers_fire_through_the_log() {
    let mut node = start_single_node(|_| {});
    let log_spy = node.bus.add_subscription("spy:mem://log", 100).unwrap();
    let image = log_spy.images().pop().unwrap();

    let control = ServiceControlPublisher::new(
        node.bus
            .add_publication("mem://service-control?endpoint=member-0-1", 104)
            .unwrap(),
    );

    let deadline = node.clock.time_ms() + 50;
    assert!(control.schedule_timer(7, deadline));
    pump(&mut node, 2);
    assert_eq!(node.agent.timer_entries(), vec![(7, deadline)]);
    assert!(drain_log(&image)
        .iter()
        .all(|e| !matches!(e, LogEntry::TimerEvent { .. })));

    node.clock.set(deadline + 1);
    node.agent.do_work().unwrap();
    assert!(node.agent.timer_entries().is_empty());
    assert!(drain_log(&image)
        .iter()
        .any(|e| matches!(e, LogEntry::TimerEvent { correlation_id: 7, .. })));

    // Cancelled timers never fire.
    assert!(control.schedule_timer(8, node.clock.time_ms() + 10));
    pump(&mut node, 2);
    assert!(control.cancel_timer(8));
    pump(&mut node, 2);
    node.clock.advance(50);
    pump(&mut node, 2);
    assert!(node.agent.timer_entries().is_empty());
    assert!(drain_log(&image)
        .iter()
        .all(|e| !matches!(e, LogEntry::TimerEvent { correlation_id: 8, .. })));
}

#[test]
fn admin_queries_answer_endpoints_and_reject_recording_log() {
    let mut node = start_single_node(|_| {});
    let mut client = connect_client(&mut node, "mem://egress-admin");

    assert!(client.send_admin_query(AdminQueryType::Endpoints));
    pump(&mut node, 2);
    let events = client.poll();
    assert!(
        events.iter().any(|e| matches!(
            e,
            ClientEvent::Ok { detail }
                if detail == "id=0,memberStatus=member-0,log=log-0,archive=in-process"
        )),
        "expected endpoints detail, got {events:?}"
    );

    assert!(client.send_admin_query(AdminQueryType::RecordingLog));
    pump(&mut node, 2);
    let events = client.poll();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ClientEvent::Error { .. })),
        "expected error for recording log query, got {events:?}"
    );
}
