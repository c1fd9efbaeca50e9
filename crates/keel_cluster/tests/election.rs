//! Multi-node election, replication, and heartbeat-failure tests.

mod common;

use std::time::Duration;

use keel_cluster::sequencer::{SequencerAgent, SequencerContext};
use keel_cluster::{AgentRunner, AllowAllAuthenticator, ClientEvent, ClusterClient, MediaBus, Role};

const LEADER_ID: u32 = 1;

fn cluster_contexts(
    bus: &MediaBus,
    data_dir: &std::path::Path,
    heartbeat_timeout_ms: u64,
) -> (Vec<SequencerContext>, Vec<common::NodeWiring>) {
    let mut contexts = Vec::new();
    let mut wirings = Vec::new();
    for member_id in 0..3 {
        let (mut ctx, wiring) = common::node_context(member_id, 3, bus, data_dir, "1");
        ctx.appointed_leader_id = LEADER_ID;
        ctx.heartbeat_interval_ms = 50;
        ctx.heartbeat_timeout_ms = heartbeat_timeout_ms;
        contexts.push(ctx);
        wirings.push(wiring);
    }
    (contexts, wirings)
}

fn spawn_cluster(contexts: Vec<SequencerContext>) -> Vec<AgentRunner> {
    // Construct every agent before any thread starts so member-status
    // subscriptions exist when the candidate requests votes.
    let agents: Vec<SequencerAgent> = contexts
        .into_iter()
        .map(|ctx| SequencerAgent::new(ctx, Box::new(AllowAllAuthenticator)).unwrap())
        .collect();
    agents
        .into_iter()
        .enumerate()
        .map(|(i, agent)| AgentRunner::spawn(&format!("sequencer-{i}"), agent).unwrap())
        .collect()
}

fn await_cluster_ready(wirings: &[common::NodeWiring]) {
    // Mark files are stamped only by steady-state ticks, so every member is
    // past its startup spin-awaits once all three are non-zero.
    common::wait_until("appointed leader election", common::WAIT_TIMEOUT, || {
        wirings[LEADER_ID as usize].counters.cluster_role.get() == Role::Leader.code()
            && wirings.iter().all(|w| {
                w.registry.commit_pos(0).is_some() && w.mark_file.activity_timestamp_ms() > 0
            })
    });
}

fn commit_values(wirings: &[common::NodeWiring]) -> Vec<u64> {
    wirings
        .iter()
        .map(|w| w.registry.commit_pos(0).expect("commit pos").get())
        .collect()
}

#[test]
fn three_node_election_replicates_a_session() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MediaBus::new();
    let (contexts, wirings) = cluster_contexts(&bus, dir.path(), 10_000);
    let mut runners = spawn_cluster(contexts);

    await_cluster_ready(&wirings);
    assert_eq!(
        wirings[0].counters.cluster_role.get(),
        Role::Follower.code()
    );
    assert_eq!(
        wirings[2].counters.cluster_role.get(),
        Role::Follower.code()
    );

    let quiet_commit = commit_values(&wirings)[LEADER_ID as usize];

    let mut client = ClusterClient::connect(
        &bus,
        &common::ingress_channel("1", LEADER_ID),
        101,
        "mem://egress-election",
        201,
    )
    .unwrap();
    common::wait_until("connect request accepted", common::WAIT_TIMEOUT, || {
        client.send_connect_request(b"")
    });
    common::wait_until("session opened", common::WAIT_TIMEOUT, || {
        client
            .poll()
            .iter()
            .any(|e| matches!(e, ClientEvent::SessionOpened { .. }))
    });

    for payload in [b"order:1".as_slice(), b"order:2", b"order:3"] {
        common::wait_until("message offered", common::WAIT_TIMEOUT, || {
            client.send_message(payload)
        });
    }

    // Commit advances past the appended messages and every node converges.
    common::wait_until("commit convergence", common::WAIT_TIMEOUT, || {
        let values = commit_values(&wirings);
        values[0] > quiet_commit && values.iter().all(|v| *v == values[0])
    });

    let before_close = commit_values(&wirings)[LEADER_ID as usize];
    common::wait_until("close offered", common::WAIT_TIMEOUT, || {
        client.send_close_request()
    });
    common::wait_until("close replicated", common::WAIT_TIMEOUT, || {
        let values = commit_values(&wirings);
        values[0] > before_close && values.iter().all(|v| *v == values[0])
    });

    let follower_2 = runners.pop().unwrap();
    let leader = runners.pop().unwrap();
    let follower_0 = runners.pop().unwrap();

    let follower_agent = follower_0.join_agent().unwrap();
    assert_eq!(follower_agent.role(), Role::Follower);
    assert_eq!(follower_agent.leader_member_id(), LEADER_ID);
    assert_eq!(follower_agent.leadership_term_id(), 0);
    assert_eq!(follower_agent.base_log_position(), 0);
    assert!(follower_agent.session_states().is_empty());
    assert_eq!(follower_agent.next_session_id(), 2);

    drop(follower_2);

    let leader_agent = leader.join_agent().unwrap();
    assert_eq!(leader_agent.role(), Role::Leader);
    assert_eq!(leader_agent.leadership_term_id(), 0);
    assert!(leader_agent.session_states().is_empty());
    assert_eq!(leader_agent.next_session_id(), 2);
}

#[test]
fn followers_fail_fatally_without_leader_heartbeats() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MediaBus::new();
    let (contexts, wirings) = cluster_contexts(&bus, dir.path(), 400);
    let mut runners = spawn_cluster(contexts);

    await_cluster_ready(&wirings);

    let follower_2 = runners.pop().unwrap();
    let leader = runners.pop().unwrap();
    let follower_0 = runners.pop().unwrap();

    // Silence the leader; followers must terminate within the timeout.
    leader.join().unwrap();

    common::wait_until(
        "followers to terminate",
        Duration::from_secs(5),
        || follower_0.is_finished() && follower_2.is_finished(),
    );

    for follower in [follower_0, follower_2] {
        let err = follower.join().expect_err("follower should fail");
        assert!(
            err.to_string().contains("no heartbeat"),
            "unexpected error: {err:?}"
        );
    }
}
