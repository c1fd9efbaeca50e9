// Keel node binary entry point.
//
// Runs an in-process cluster: one sequencer agent and its service replicas
// per member over a shared media bus, then drives a demo client session
// through connect, sequencing, snapshot, and shutdown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use keel_cluster::counters::{ClusterCounters, CounterRegistry, MarkFile};
use keel_cluster::idle::SleepingIdle;
use keel_cluster::sequencer::{SequencerAgent, SequencerContext};
use keel_cluster::{
    AgentRunner, AllowAllAuthenticator, Archive, ClientEvent, ClusterClient, MediaBus,
    RecordingLog, Role, ServiceHost, ToggleState,
};

#[derive(Parser, Debug)]
#[command(
    name = "keel-node",
    about = "Run an in-process keel cluster and drive a demo session"
)]
struct NodeArgs {
    /// Number of cluster members to run in this process.
    #[arg(long, default_value_t = 3)]
    member_count: usize,

    /// Member appointed to lead the first term.
    #[arg(long, default_value_t = 0)]
    appointed_leader_id: u32,

    /// Service replicas hosted with each member.
    #[arg(long, default_value_t = 1)]
    service_count: usize,

    /// Demo messages to sequence through the client session.
    #[arg(long, default_value_t = 10)]
    messages: usize,

    /// Skip the snapshot before shutdown.
    #[arg(long)]
    no_snapshot: bool,

    /// Directory for recording logs; a temporary directory when omitted.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

struct NodeHandles {
    member_id: u32,
    registry: CounterRegistry,
    counters: ClusterCounters,
    mark_file: MarkFile,
    runner: AgentRunner,
    services: Vec<ServiceRunner>,
}

/// Drives one service host on its own thread until stopped.
struct ServiceRunner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ServiceRunner {
    fn spawn(member_id: u32, mut host: ServiceHost) -> anyhow::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("service-{member_id}-{}", host.service_id()))
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    match host.do_work() {
                        Ok(0) => std::thread::sleep(Duration::from_micros(200)),
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!(error = ?err, "service host failed");
                            break;
                        }
                    }
                }
            })
            .context("spawn service host thread")?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for ServiceRunner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    run(NodeArgs::parse())
}

fn members_string(member_count: usize) -> String {
    (0..member_count)
        .map(|i| format!("{i}@client-{i}@member-{i}@log-{i}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn wait_for(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return Ok(());
        }
        ensure!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn run(args: NodeArgs) -> anyhow::Result<()> {
    ensure!(args.member_count >= 1, "member count must be at least 1");
    ensure!(
        (args.appointed_leader_id as usize) < args.member_count,
        "appointed leader outside the cluster"
    );

    let _temp_dir;
    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => {
            let dir = tempfile::tempdir().context("create temp data dir")?;
            let path = dir.path().to_path_buf();
            _temp_dir = dir;
            path
        }
    };

    let bus = MediaBus::new();
    let members = members_string(args.member_count);
    tracing::info!(members = %members, "starting in-process cluster");

    let mut contexts = Vec::new();
    for member_id in 0..args.member_count as u32 {
        let archive = Archive::connect(&bus);
        let recording_log = RecordingLog::load_or_init(
            data_dir.join(format!("node-{member_id}-recording.json")),
        )?;
        let mut ctx =
            SequencerContext::new(member_id, &members, bus.clone(), archive, recording_log);
        ctx.appointed_leader_id = args.appointed_leader_id;
        ctx.service_count = args.service_count;
        ctx.heartbeat_interval_ms = 100;
        ctx.service_control_channel =
            format!("mem://service-control?endpoint=member-{member_id}");
        ctx.replay_channel = format!("mem://replay?endpoint=member-{member_id}");
        ctx.snapshot_channel = format!("mem://snapshot?endpoint=member-{member_id}");
        ctx.idle_strategy = Arc::new(SleepingIdle::default());
        contexts.push(ctx);
    }

    // Construct every agent before any runner starts so member-status
    // subscriptions exist when the appointed leader requests votes.
    let mut nodes = Vec::new();
    let mut agents = Vec::new();
    for ctx in contexts {
        let member_id = ctx.member_id;
        let registry = ctx.registry.clone();
        let counters = ctx.counters.clone();
        let mark_file = ctx.mark_file.clone();
        let service_control_channel = ctx.service_control_channel.clone();
        let service_control_stream_id = ctx.service_control_stream_id;

        let mut services = Vec::new();
        for service_id in 0..args.service_count as u32 {
            let host = ServiceHost::new(
                service_id,
                &bus,
                &registry,
                &service_control_channel,
                service_control_stream_id,
            )?;
            services.push(ServiceRunner::spawn(member_id, host)?);
        }

        agents.push(SequencerAgent::new(ctx, Box::new(AllowAllAuthenticator))?);
        nodes.push((member_id, registry, counters, mark_file, services));
    }

    let mut handles = Vec::new();
    for ((member_id, registry, counters, mark_file, services), agent) in
        nodes.into_iter().zip(agents)
    {
        let runner = AgentRunner::spawn(&format!("sequencer-{member_id}"), agent)?;
        handles.push(NodeHandles {
            member_id,
            registry,
            counters,
            mark_file,
            runner,
            services,
        });
    }

    let leader = args.appointed_leader_id as usize;
    wait_for("leader election", Duration::from_secs(20), || {
        handles[leader].counters.cluster_role.get() == Role::Leader.code()
            && handles.iter().all(|n| {
                n.registry.commit_pos(0).is_some() && n.mark_file.activity_timestamp_ms() > 0
            })
    })?;
    tracing::info!(leader = handles[leader].member_id, "cluster is up");

    let mut client = ClusterClient::connect(
        &bus,
        &format!("mem://ingress?endpoint=client-{leader}"),
        101,
        "mem://demo-egress",
        201,
    )?;
    wait_for("connect request", Duration::from_secs(5), || {
        client.send_connect_request(b"")
    })?;
    wait_for("session open", Duration::from_secs(10), || {
        client.poll().iter().any(|event| match event {
            ClientEvent::SessionOpened { session_id, detail } => {
                tracing::info!(session_id = *session_id, detail = %detail, "session opened");
                true
            }
            other => {
                tracing::info!(event = ?other, "egress");
                false
            }
        })
    })?;

    for sequence in 0..args.messages {
        let payload = format!("order:{sequence}");
        wait_for("message accepted", Duration::from_secs(5), || {
            client.send_message(payload.as_bytes())
        })?;
    }
    let commit_floor = handles[leader]
        .registry
        .commit_pos(0)
        .context("leader commit position")?;
    wait_for("replication of demo messages", Duration::from_secs(10), || {
        let target = commit_floor.get();
        handles
            .iter()
            .all(|n| n.registry.commit_pos(0).is_some_and(|c| c.get() >= target))
    })?;
    tracing::info!(messages = args.messages, "demo messages replicated");

    if !args.no_snapshot {
        ensure!(
            ToggleState::Snapshot.activate(&handles[leader].counters.control_toggle),
            "snapshot toggle not accepted"
        );
        wait_for("snapshot completion", Duration::from_secs(10), || {
            handles[leader].counters.snapshot_count.get() >= 1
        })?;
        tracing::info!("snapshot taken");
    }

    ensure!(
        ToggleState::Shutdown.activate(&handles[leader].counters.control_toggle),
        "shutdown toggle not accepted"
    );
    let _ = wait_for("cluster shutdown", Duration::from_secs(10), || {
        handles.iter().all(|n| n.runner.is_finished())
    });

    for node in handles {
        let member_id = node.member_id;
        drop(node.services);
        match node.runner.join() {
            Ok(()) => tracing::info!(member_id, "member stopped"),
            Err(err) => tracing::warn!(member_id, error = ?err, "member stopped with error"),
        }
    }

    Ok(())
}
