//! Startup and cluster-action acknowledgement through a service replica.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_cluster::counters::ToggleState;
use keel_cluster::idle::SleepingIdle;
use keel_cluster::sequencer::SequencerAgent;
use keel_cluster::time::ManualEpochClock;
use keel_cluster::{
    AllowAllAuthenticator, ClientEvent, ClusterClient, ConsensusState, MediaBus, Role, ServiceHost,
};

#[test]
fn single_node_with_a_service_acks_startup_and_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MediaBus::new();
    let clock = ManualEpochClock::new(1_000);

    let (mut ctx, wiring) = common::node_context(0, 1, &bus, dir.path(), "1");
    ctx.service_count = 1;
    ctx.epoch_clock = Arc::new(clock.clone());
    ctx.idle_strategy = Arc::new(SleepingIdle::default());
    let service_control_channel = ctx.service_control_channel.clone();

    let host = ServiceHost::new(0, &bus, &ctx.registry, &service_control_channel, 104).unwrap();
    let _service = common::ServiceRunner::spawn(host);

    let mut agent = SequencerAgent::new(ctx, Box::new(AllowAllAuthenticator)).unwrap();
    // Blocks on the service acking recovery and the log join.
    agent.on_start().unwrap();

    assert_eq!(agent.role(), Role::Leader);
    assert_eq!(agent.consensus_state(), ConsensusState::Active);
    assert_eq!(agent.leadership_term_id(), 0);

    let recovery_state = wiring.registry.recovery_state().unwrap();
    assert_eq!(recovery_state.term_count, 0);

    let mut client = ClusterClient::connect(
        &bus,
        &common::ingress_channel("1", 0),
        101,
        "mem://egress-svc",
        201,
    )
    .unwrap();
    assert!(client.send_connect_request(b""));
    let deadline = Instant::now() + common::WAIT_TIMEOUT;
    loop {
        clock.advance(1);
        agent.do_work().unwrap();
        if client
            .poll()
            .iter()
            .any(|e| matches!(e, ClientEvent::SessionOpened { .. }))
        {
            break;
        }
        assert!(Instant::now() < deadline, "session never opened");
        std::thread::sleep(Duration::from_micros(200));
    }

    // The snapshot completes only once the service acks the cluster action.
    assert!(ToggleState::Snapshot.activate(&wiring.counters.control_toggle));
    let deadline = Instant::now() + common::WAIT_TIMEOUT;
    loop {
        clock.advance(1);
        agent.do_work().unwrap();
        if wiring.counters.snapshot_count.get() == 1
            && agent.consensus_state() == ConsensusState::Active
        {
            break;
        }
        assert!(Instant::now() < deadline, "snapshot never completed");
        std::thread::sleep(Duration::from_micros(200));
    }

    assert_eq!(
        ToggleState::get(&wiring.counters.control_toggle),
        ToggleState::Neutral
    );
}
