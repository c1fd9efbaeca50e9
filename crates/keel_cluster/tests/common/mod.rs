//! Shared helpers for integration tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use keel_cluster::counters::{ClusterCounters, CounterRegistry, MarkFile};
use keel_cluster::idle::SleepingIdle;
use keel_cluster::sequencer::SequencerContext;
use keel_cluster::{Archive, MediaBus, RecordingLog, ServiceHost};

/// Upper bound for cluster start-up and propagation waits.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Observable handles for one node, cloned out of its context.
pub struct NodeWiring {
    pub registry: CounterRegistry,
    pub counters: ClusterCounters,
    pub mark_file: MarkFile,
}

pub fn members_string(member_count: usize) -> String {
    (0..member_count)
        .map(|i| format!("{i}@client-{i}@member-{i}@log-{i}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Ingress channel a client uses to reach `member_id` in a given era.
pub fn ingress_channel(era: &str, member_id: u32) -> String {
    format!("mem://ingress-{era}?endpoint=client-{member_id}")
}

/// Build a node context wired to the shared bus.
///
/// Per-node channels are era-suffixed so a restarted node does not re-read
/// buffered traffic from its previous life on the shared in-process bus.
pub fn node_context(
    member_id: u32,
    member_count: usize,
    bus: &MediaBus,
    data_dir: &Path,
    era: &str,
) -> (SequencerContext, NodeWiring) {
    let archive = Archive::connect(bus);
    let recording_log =
        RecordingLog::load_or_init(data_dir.join(format!("node-{member_id}-recording.json")))
            .expect("recording log");

    let mut ctx = SequencerContext::new(
        member_id,
        &members_string(member_count),
        bus.clone(),
        archive,
        recording_log,
    );
    ctx.ingress_channel = format!("mem://ingress-{era}");
    ctx.member_status_channel = format!("mem://member-status-{era}");
    ctx.service_control_channel =
        format!("mem://service-control?endpoint=member-{member_id}-{era}");
    ctx.replay_channel = format!("mem://replay?endpoint=member-{member_id}-{era}");
    ctx.snapshot_channel = format!("mem://snapshot?endpoint=member-{member_id}-{era}");
    ctx.idle_strategy = Arc::new(SleepingIdle::default());

    let wiring = NodeWiring {
        registry: ctx.registry.clone(),
        counters: ctx.counters.clone(),
        mark_file: ctx.mark_file.clone(),
    };
    (ctx, wiring)
}

/// Restart-with-archive helper: a fresh context in a new era that keeps the
/// node's archive and recording log.
pub fn node_context_with_archive(
    member_id: u32,
    member_count: usize,
    bus: &MediaBus,
    archive: Archive,
    data_dir: &Path,
    era: &str,
) -> (SequencerContext, NodeWiring) {
    let (mut ctx, wiring) = node_context(member_id, member_count, bus, data_dir, era);
    ctx.archive = archive;
    ctx.recording_log =
        RecordingLog::load_or_init(data_dir.join(format!("node-{member_id}-recording.json")))
            .expect("recording log");
    (ctx, wiring)
}

/// Drives a service host on its own thread until stopped.
pub struct ServiceRunner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ServiceRunner {
    pub fn spawn(mut host: ServiceHost) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("service-{}", host.service_id()))
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    match host.do_work() {
                        Ok(0) => std::thread::sleep(Duration::from_micros(200)),
                        Ok(_) => {}
                        Err(err) => {
                            eprintln!("service host failed: {err:?}");
                            break;
                        }
                    }
                }
            })
            .expect("spawn service host thread");
        Self {
            stop,
            handle: Some(handle),
        }
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

/// Poll `condition` until it holds or the timeout expires.
pub fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}
