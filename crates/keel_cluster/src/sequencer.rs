//! The sequencer agent: the single-threaded control loop that turns the
//! replicated log into a linearizable stream of committed messages.
//!
//! One agent runs per cluster node. It owns the session pipeline, the timer
//! service, role and consensus state, and all position counters; everything
//! else is reached through collaborator handles. `do_work` performs one
//! bounded tick; startup (`on_start`) recovers from the recording log and
//! runs the appointed-leader election through explicit spin-idles.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, ensure, Context};

use crate::archive::{Archive, RecordingPos, SourceLocation};
use crate::auth::{Authenticator, SessionProxy};
use crate::bus::{ChannelUri, ControlledAction, Image, MediaBus, Subscription};
use crate::counters::{
    ClusterCounters, CommitPos, CounterRegistry, MarkFile, RecoveryState, ToggleState,
};
use crate::egress::{EgressPublisher, EventCode};
use crate::idle::IdleStrategy;
use crate::ingress::{AdminQueryType, IngressAdapter, IngressHandler};
use crate::log::{LogAdapter, LogAppender, LogEventHandler};
use crate::member::{self, ClusterMember, MemberId};
use crate::member_status::{MemberStatusAdapter, MemberStatusListener, MemberStatusPublisher};
use crate::recording_log::{RecordingLog, RecoveryPlan, ReplayStep};
use crate::service::{ClusterAction, ServiceControlAdapter, ServiceControlListener,
    ServiceControlPublisher};
use crate::session::{CloseReason, ClusterSession, SessionId, SessionState};
use crate::snapshot::{SnapshotHandler, SnapshotLoader, SnapshotTaker};
use crate::time::{CachedEpochClock, EpochClock};
use crate::timers::TimerService;

pub const SESSION_LIMIT_MSG: &str = "concurrent session limit";
pub const SESSION_REJECTED_MSG: &str = "session rejected due to authentication";
pub const SESSION_TIMEOUT_MSG: &str = "session inactivity timeout";
const RECORDING_LOG_QUERY_MSG: &str = "recording log query not supported";

/// Node role within the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn code(self) -> u64 {
        match self {
            Role::Follower => 0,
            Role::Candidate => 1,
            Role::Leader => 2,
        }
    }
}

/// Consensus-module state, orthogonal to the role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsensusState {
    Init,
    Active,
    Suspended,
    Snapshot,
    Shutdown,
    Abort,
    Closed,
}

impl ConsensusState {
    pub fn code(self) -> u64 {
        match self {
            ConsensusState::Init => 0,
            ConsensusState::Active => 1,
            ConsensusState::Suspended => 2,
            ConsensusState::Snapshot => 3,
            ConsensusState::Shutdown => 4,
            ConsensusState::Abort => 5,
            ConsensusState::Closed => 6,
        }
    }

    /// Which service acks are legal in this state.
    pub fn is_valid(self, action: ClusterAction) -> bool {
        matches!(
            (self, action),
            (ConsensusState::Init, ClusterAction::Ready)
                | (ConsensusState::Init, ClusterAction::Replay)
                | (ConsensusState::Active, ClusterAction::Ready)
                | (ConsensusState::Snapshot, ClusterAction::Snapshot)
                | (ConsensusState::Shutdown, ClusterAction::Shutdown)
                | (ConsensusState::Abort, ClusterAction::Abort)
        )
    }
}

/// Construction-time wiring and tuning for a sequencer agent.
pub struct SequencerContext {
    pub member_id: MemberId,
    pub appointed_leader_id: MemberId,
    pub cluster_members: String,
    pub service_count: usize,
    pub max_concurrent_sessions: usize,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub fragment_limit: usize,
    pub ingress_channel: String,
    pub ingress_stream_id: i32,
    pub log_channel: String,
    pub log_stream_id: i32,
    pub member_status_channel: String,
    pub member_status_stream_id: i32,
    pub service_control_channel: String,
    pub service_control_stream_id: i32,
    pub replay_channel: String,
    pub replay_stream_id: i32,
    pub snapshot_channel: String,
    pub snapshot_stream_id: i32,
    pub owns_bus_client: bool,
    pub bus: MediaBus,
    pub archive: Archive,
    pub recording_log: RecordingLog,
    pub registry: CounterRegistry,
    pub counters: ClusterCounters,
    pub mark_file: MarkFile,
    pub epoch_clock: Arc<dyn EpochClock>,
    pub idle_strategy: Arc<dyn IdleStrategy>,
    pub termination_hook: Arc<dyn Fn() + Send + Sync>,
    pub interrupt: Arc<AtomicBool>,
}

impl SequencerContext {
    pub fn new(
        member_id: MemberId,
        cluster_members: &str,
        bus: MediaBus,
        archive: Archive,
        recording_log: RecordingLog,
    ) -> Self {
        Self {
            member_id,
            appointed_leader_id: 0,
            cluster_members: cluster_members.to_string(),
            service_count: 0,
            max_concurrent_sessions: 10,
            session_timeout_ms: 10_000,
            heartbeat_interval_ms: 500,
            heartbeat_timeout_ms: 10_000,
            fragment_limit: 10,
            ingress_channel: "mem://ingress".to_string(),
            ingress_stream_id: 101,
            log_channel: "mem://log".to_string(),
            log_stream_id: 100,
            member_status_channel: "mem://member-status".to_string(),
            member_status_stream_id: 108,
            service_control_channel: "mem://service-control".to_string(),
            service_control_stream_id: 104,
            replay_channel: "mem://replay".to_string(),
            replay_stream_id: 103,
            snapshot_channel: "mem://snapshot".to_string(),
            snapshot_stream_id: 106,
            owns_bus_client: false,
            bus,
            archive,
            recording_log,
            registry: CounterRegistry::default(),
            counters: ClusterCounters::default(),
            mark_file: MarkFile::default(),
            epoch_clock: Arc::new(crate::time::SystemEpochClock),
            idle_strategy: Arc::new(crate::idle::BusySpinIdle),
            termination_hook: Arc::new(|| {}),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// The per-node sequencer agent.
pub struct SequencerAgent {
    ctx: SequencerContext,
    authenticator: Box<dyn Authenticator>,

    role: Role,
    state: ConsensusState,
    leader_member_id: MemberId,
    voted_for_member_id: Option<MemberId>,
    leadership_term_id: i64,
    base_log_position: u64,
    follower_commit_position: Option<u64>,
    time_of_last_log_update_ms: u64,
    last_appended_position: Option<u64>,
    next_session_id: SessionId,
    service_ack_count: usize,
    log_session_id: i32,
    log_recording_id: Option<u64>,
    is_recovered: bool,
    cached_clock: CachedEpochClock,

    cluster_members: Vec<ClusterMember>,
    ranked_positions: Vec<u64>,
    member_endpoints_detail: String,
    sessions: HashMap<SessionId, ClusterSession>,
    pending_sessions: Vec<ClusterSession>,
    rejected_sessions: Vec<ClusterSession>,
    timer_service: TimerService,
    failed_timer_cancellations: Vec<u64>,
    recovery_plan: Option<RecoveryPlan>,

    ingress_adapter: IngressAdapter,
    egress_publisher: EgressPublisher,
    log_appender: LogAppender,
    log_adapter: Option<LogAdapter>,
    member_status_adapter: MemberStatusAdapter,
    member_status_publisher: MemberStatusPublisher,
    service_control_adapter: ServiceControlAdapter,
    service_control_publisher: ServiceControlPublisher,
    log_recording_position: Option<RecordingPos>,
    commit_position: Option<Arc<CommitPos>>,
}

impl SequencerAgent {
    pub fn new(ctx: SequencerContext, authenticator: Box<dyn Authenticator>) -> anyhow::Result<Self> {
        let mut cluster_members = member::parse_members(&ctx.cluster_members)?;
        ensure!(
            (ctx.member_id as usize) < cluster_members.len(),
            "member id {} outside cluster of {}",
            ctx.member_id,
            cluster_members.len()
        );
        ensure!(
            (ctx.appointed_leader_id as usize) < cluster_members.len(),
            "appointed leader {} outside cluster of {}",
            ctx.appointed_leader_id,
            cluster_members.len()
        );

        let this_member = &cluster_members[ctx.member_id as usize];
        let status_channel = ChannelUri::parse(&ctx.member_status_channel)?
            .with_endpoint(&this_member.member_endpoint)
            .to_string();
        let member_status_adapter = MemberStatusAdapter::new(
            ctx.bus
                .add_subscription(&status_channel, ctx.member_status_stream_id)?,
        );

        let mut ingress_uri = ChannelUri::parse(&ctx.ingress_channel)?;
        if ingress_uri.endpoint.is_none() {
            ingress_uri = ingress_uri.with_endpoint(&this_member.client_endpoint);
        }
        let ingress_adapter = IngressAdapter::new(
            ctx.bus
                .add_subscription(&ingress_uri.to_string(), ctx.ingress_stream_id)?,
            ctx.counters.invalid_requests.clone(),
        );

        let service_control_adapter = ServiceControlAdapter::new(
            ctx.bus
                .add_subscription(&ctx.service_control_channel, ctx.service_control_stream_id)?,
        );
        let service_control_publisher = ServiceControlPublisher::new(
            ctx.bus
                .add_publication(&ctx.service_control_channel, ctx.service_control_stream_id)?,
        );

        member::add_member_status_publications(
            &mut cluster_members,
            ctx.member_id,
            &ctx.member_status_channel,
            ctx.member_status_stream_id,
            &ctx.bus,
        )?;

        let ranked_positions = Vec::with_capacity(cluster_members.len());
        let leader_member_id = ctx.appointed_leader_id;

        let mut agent = Self {
            ctx,
            authenticator,
            role: Role::Follower,
            state: ConsensusState::Init,
            leader_member_id,
            voted_for_member_id: None,
            leadership_term_id: -1,
            base_log_position: 0,
            follower_commit_position: None,
            time_of_last_log_update_ms: 0,
            last_appended_position: None,
            next_session_id: 1,
            service_ack_count: 0,
            log_session_id: 0,
            log_recording_id: None,
            is_recovered: false,
            cached_clock: CachedEpochClock::default(),
            cluster_members,
            ranked_positions,
            member_endpoints_detail: String::new(),
            sessions: HashMap::new(),
            pending_sessions: Vec::new(),
            rejected_sessions: Vec::new(),
            timer_service: TimerService::new(),
            failed_timer_cancellations: Vec::new(),
            recovery_plan: None,
            ingress_adapter,
            egress_publisher: EgressPublisher,
            log_appender: LogAppender::new(),
            log_adapter: None,
            member_status_adapter,
            member_status_publisher: MemberStatusPublisher,
            service_control_adapter,
            service_control_publisher,
            log_recording_position: None,
            commit_position: None,
        };
        agent.set_role(Role::Follower);
        agent.set_state(ConsensusState::Init);
        Ok(agent)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn consensus_state(&self) -> ConsensusState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConsensusState::Closed
    }

    pub fn leadership_term_id(&self) -> i64 {
        self.leadership_term_id
    }

    pub fn leader_member_id(&self) -> MemberId {
        self.leader_member_id
    }

    pub fn base_log_position(&self) -> u64 {
        self.base_log_position
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_session_id
    }

    pub fn session_states(&self) -> Vec<(SessionId, SessionState)> {
        let mut states: Vec<_> = self
            .sessions
            .iter()
            .map(|(id, session)| (*id, session.state()))
            .collect();
        states.sort_unstable_by_key(|(id, _)| *id);
        states
    }

    pub fn session_activity_ms(&self, session_id: SessionId) -> Option<u64> {
        self.sessions
            .get(&session_id)
            .map(ClusterSession::time_of_last_activity_ms)
    }

    pub fn timer_entries(&self) -> Vec<(u64, u64)> {
        self.timer_service.entries()
    }

    pub fn commit_position_value(&self) -> Option<u64> {
        self.commit_position.as_ref().map(|c| c.get())
    }

    pub fn idle_strategy_handle(&self) -> Arc<dyn IdleStrategy> {
        Arc::clone(&self.ctx.idle_strategy)
    }

    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ctx.interrupt)
    }

    fn set_state(&mut self, state: ConsensusState) {
        if self.state != state {
            tracing::info!(member_id = self.ctx.member_id, ?state, "consensus state");
        }
        self.state = state;
        self.ctx.counters.module_state.set_ordered(state.code());
    }

    fn set_role(&mut self, role: Role) {
        if self.role != role {
            tracing::info!(member_id = self.ctx.member_id, ?role, "cluster role");
        }
        self.role = role;
        self.ctx.counters.cluster_role.set_ordered(role.code());
    }

    fn idle(&self, work_count: usize) -> anyhow::Result<()> {
        ensure!(
            !self.ctx.interrupt.load(Ordering::Acquire),
            "agent interrupted during idle"
        );
        self.ctx.bus.conduct();
        self.ctx.idle_strategy.idle(work_count);
        Ok(())
    }

    fn retry_offer(&self, mut offer: impl FnMut() -> bool) -> anyhow::Result<()> {
        loop {
            if offer() {
                return Ok(());
            }
            self.idle(0)?;
        }
    }

    /// Recover, elect, and take up the resulting role.
    pub fn on_start(&mut self) -> anyhow::Result<()> {
        // A fresh archive connection restarts the replay-session sequence,
        // which the per-term session id check below depends on.
        self.ctx.archive = self.ctx.archive.reconnect();
        let plan = self
            .ctx
            .recording_log
            .create_recovery_plan(&self.ctx.archive)?;

        self.service_ack_count = 0;
        self.publish_recovery_state(&plan);

        if let Some(snapshot_step) = plan.snapshot_step.clone() {
            self.recover_from_snapshot(&snapshot_step)?;
        }
        self.await_service_acks()?;

        if !plan.term_steps.is_empty() {
            self.recover_from_log(&plan.term_steps)?;
        }
        self.is_recovered = true;
        self.recovery_plan = Some(plan);

        self.set_state(ConsensusState::Active);
        self.leadership_term_id += 1;

        if self.cluster_members.len() > 1 {
            self.elect_leader()?;
        }

        if self.ctx.member_id == self.leader_member_id || self.cluster_members.len() == 1 {
            self.become_leader()?;
        } else {
            self.become_follower()?;
        }

        let now_ms = self.ctx.epoch_clock.time_ms();
        self.cached_clock.update(now_ms);
        self.time_of_last_log_update_ms = now_ms;

        let recording_id = self.log_recording_id.context("log recording id missing")?;
        self.ctx.recording_log.append_term(
            recording_id,
            self.leadership_term_id,
            self.base_log_position,
            now_ms,
        )?;
        Ok(())
    }

    /// One bounded tick of sequencer work.
    pub fn do_work(&mut self) -> anyhow::Result<usize> {
        let mut work_count = 0;

        let now_ms = self.ctx.epoch_clock.time_ms();
        let is_slow_tick = now_ms != self.cached_clock.time_ms();
        if is_slow_tick {
            self.cached_clock.update(now_ms);
        }

        let fragment_limit = self.ctx.fragment_limit;
        match self.role {
            Role::Leader => {
                if self.state == ConsensusState::Active {
                    let adapter = self.ingress_adapter.clone();
                    work_count += adapter.poll(self, fragment_limit);
                }
            }
            Role::Follower => {
                if matches!(
                    self.state,
                    ConsensusState::Active | ConsensusState::Suspended
                ) {
                    if let (Some(adapter), Some(limit)) =
                        (self.log_adapter.clone(), self.follower_commit_position)
                    {
                        work_count += adapter.poll(self, limit, fragment_limit)?;
                    }
                }
            }
            Role::Candidate => {}
        }

        let adapter = self.member_status_adapter.clone();
        work_count += adapter.poll(self, fragment_limit)?;
        work_count += self.update_member_position(now_ms)?;

        if is_slow_tick {
            work_count += self.slow_tick_cycle(now_ms)?;
        }

        Ok(work_count)
    }

    /// Release references to shared transport resources.
    pub fn on_close(&mut self) {
        if !self.ctx.owns_bus_client {
            for session in self.sessions.values_mut() {
                session.disconnect();
            }
            for member in self.cluster_members.iter_mut() {
                member.publication = None;
            }
            self.log_appender.disconnect();
            self.log_adapter = None;
        }
    }

    fn slow_tick_cycle(&mut self, now_ms: u64) -> anyhow::Result<usize> {
        let mut work_count = 0;

        self.ctx.mark_file.update_activity_timestamp(now_ms);
        self.ctx.bus.conduct();

        let fragment_limit = self.ctx.fragment_limit;
        let adapter = self.service_control_adapter.clone();
        work_count += adapter.poll(self, fragment_limit)?;

        if self.role == Role::Leader {
            work_count += self.check_control_toggle(now_ms)?;

            if self.state == ConsensusState::Active {
                work_count += self.process_pending_sessions(now_ms);
                work_count += self.check_sessions(now_ms);
                work_count += self.process_rejected_sessions(now_ms);

                let leadership_term_id = self.leadership_term_id;
                let log_appender = &self.log_appender;
                work_count += self.timer_service.poll(now_ms, |correlation_id, timer_now| {
                    log_appender.append_timer_event(correlation_id, leadership_term_id, timer_now)
                });
            }
        }

        self.ctx.archive.check_for_error_response()?;
        Ok(work_count)
    }

    fn update_member_position(&mut self, now_ms: u64) -> anyhow::Result<usize> {
        let mut work_count = 0;

        match self.role {
            Role::Leader => {
                let (Some(recording_position), Some(commit_position)) =
                    (&self.log_recording_position, &self.commit_position)
                else {
                    return Ok(0);
                };
                self.cluster_members[self.ctx.member_id as usize].term_position =
                    Some(recording_position.get());

                let quorum_position =
                    member::quorum_position(&self.cluster_members, &mut self.ranked_positions);
                if quorum_position > commit_position.get_weak()
                    || now_ms >= self.time_of_last_log_update_ms + self.ctx.heartbeat_interval_ms
                {
                    for cluster_member in &self.cluster_members {
                        if let Some(publication) = &cluster_member.publication {
                            self.member_status_publisher.commit_position(
                                publication,
                                quorum_position,
                                self.leadership_term_id,
                                self.ctx.member_id,
                                self.log_session_id,
                            );
                        }
                    }
                    commit_position.set_ordered(quorum_position);
                    self.time_of_last_log_update_ms = now_ms;
                    work_count = 1;
                }
            }
            Role::Follower => {
                if let Some(recording_position) = &self.log_recording_position {
                    let position = recording_position.get();
                    if self.last_appended_position != Some(position) {
                        let leader = &self.cluster_members[self.leader_member_id as usize];
                        if let Some(publication) = &leader.publication {
                            if self.member_status_publisher.appended_position(
                                publication,
                                position,
                                self.leadership_term_id,
                                self.ctx.member_id,
                            ) {
                                self.last_appended_position = Some(position);
                            }
                        }
                        work_count = 1;
                    }
                }

                if let (Some(commit_position), Some(adapter)) =
                    (&self.commit_position, &self.log_adapter)
                {
                    commit_position.propose_max_ordered(adapter.position());
                }

                if now_ms >= self.time_of_last_log_update_ms + self.ctx.heartbeat_timeout_ms {
                    bail!("no heartbeat detected from cluster leader");
                }
            }
            Role::Candidate => {}
        }

        Ok(work_count)
    }

    // ---- control toggle and cluster actions ----

    fn check_control_toggle(&mut self, now_ms: u64) -> anyhow::Result<usize> {
        let toggle = self.ctx.counters.control_toggle.clone();
        match ToggleState::get(&toggle) {
            ToggleState::Neutral => return Ok(0),
            ToggleState::Suspend => {
                if self.state == ConsensusState::Active
                    && self.append_action(ClusterAction::Suspend, now_ms)
                {
                    self.set_state(ConsensusState::Suspended);
                    ToggleState::reset(&toggle);
                }
            }
            ToggleState::Resume => {
                if self.state == ConsensusState::Suspended
                    && self.append_action(ClusterAction::Resume, now_ms)
                {
                    self.set_state(ConsensusState::Active);
                    ToggleState::reset(&toggle);
                }
            }
            ToggleState::Snapshot => {
                self.service_ack_count = 0;
                if self.state == ConsensusState::Active
                    && self.append_action(ClusterAction::Snapshot, now_ms)
                {
                    self.set_state(ConsensusState::Snapshot);
                    let term_position = self.log_appender.position();
                    self.take_snapshot(now_ms, term_position)?;
                    if self.ctx.service_count == 0 {
                        self.complete_action(ClusterAction::Snapshot, term_position)?;
                    }
                }
            }
            ToggleState::Shutdown => {
                self.service_ack_count = 0;
                if self.state == ConsensusState::Active
                    && self.append_action(ClusterAction::Shutdown, now_ms)
                {
                    self.set_state(ConsensusState::Shutdown);
                    let term_position = self.log_appender.position();
                    self.take_snapshot(now_ms, term_position)?;
                    if self.ctx.service_count == 0 {
                        self.complete_action(ClusterAction::Shutdown, term_position)?;
                    }
                }
            }
            ToggleState::Abort => {
                self.service_ack_count = 0;
                if self.state == ConsensusState::Active
                    && self.append_action(ClusterAction::Abort, now_ms)
                {
                    self.set_state(ConsensusState::Abort);
                    if self.ctx.service_count == 0 {
                        let term_position = self.log_appender.position();
                        self.complete_action(ClusterAction::Abort, term_position)?;
                    }
                }
            }
        }
        Ok(1)
    }

    fn append_action(&self, action: ClusterAction, now_ms: u64) -> bool {
        self.log_appender.append_cluster_action(
            action,
            self.leadership_term_id,
            self.base_log_position,
            now_ms,
        )
    }

    fn complete_action(
        &mut self,
        action: ClusterAction,
        term_position: u64,
    ) -> anyhow::Result<()> {
        match action {
            ClusterAction::Snapshot => {
                self.ctx.counters.snapshot_count.increment_ordered();
                self.set_state(ConsensusState::Active);
                ToggleState::reset(&self.ctx.counters.control_toggle);

                let now_ms = self.ctx.epoch_clock.time_ms();
                for session in self.sessions.values_mut() {
                    session.set_time_of_last_activity(now_ms);
                }
            }
            ClusterAction::Shutdown => {
                self.ctx.counters.snapshot_count.increment_ordered();
                self.ctx
                    .recording_log
                    .commit_leadership_term_position(self.leadership_term_id, term_position)?;
                self.set_state(ConsensusState::Closed);
                (self.ctx.termination_hook)();
            }
            ClusterAction::Abort => {
                self.ctx
                    .recording_log
                    .commit_leadership_term_position(self.leadership_term_id, term_position)?;
                self.set_state(ConsensusState::Closed);
                (self.ctx.termination_hook)();
            }
            _ => {}
        }
        Ok(())
    }

    fn validate_service_ack(
        &self,
        log_position: u64,
        leadership_term_id: i64,
        service_id: u32,
        action: ClusterAction,
    ) -> anyhow::Result<()> {
        let current_log_position = self.base_log_position + self.current_term_position();
        ensure!(
            log_position == current_log_position && leadership_term_id == self.leadership_term_id,
            "invalid log state in ack: service_id={service_id} log_position={log_position} \
             current={current_log_position} leadership_term_id={leadership_term_id} current_term={}",
            self.leadership_term_id
        );
        ensure!(
            self.state.is_valid(action),
            "invalid service ack for state {:?}: {action:?}",
            self.state
        );
        Ok(())
    }

    fn current_term_position(&self) -> u64 {
        match &self.log_adapter {
            Some(adapter) => adapter.position(),
            None => self.log_appender.position(),
        }
    }

    // ---- session pipeline ----

    fn process_pending_sessions(&mut self, now_ms: u64) -> usize {
        let mut work_count = 0;

        let mut pending = mem::take(&mut self.pending_sessions);
        for mut session in pending.drain(..).rev() {
            if matches!(
                session.state(),
                SessionState::Init | SessionState::Connected
            ) && session.is_response_publication_connected()
            {
                session.set_state(SessionState::Connected);
                let mut proxy = SessionProxy::new(
                    &mut session,
                    &self.egress_publisher,
                    &self.member_endpoints_detail,
                );
                self.authenticator
                    .on_process_connected_session(&mut proxy, now_ms);
            }

            if session.state() == SessionState::Challenged
                && session.is_response_publication_connected()
            {
                let mut proxy = SessionProxy::new(
                    &mut session,
                    &self.egress_publisher,
                    &self.member_endpoints_detail,
                );
                self.authenticator
                    .on_process_challenged_session(&mut proxy, now_ms);
            }

            match session.state() {
                SessionState::Authenticated => {
                    session.set_time_of_last_activity(now_ms);
                    self.append_connected_session(&mut session, now_ms);
                    self.sessions.insert(session.id(), session);
                    work_count += 1;
                }
                SessionState::Rejected => self.rejected_sessions.push(session),
                _ if now_ms > session.time_of_last_activity_ms() + self.ctx.session_timeout_ms => {
                    tracing::debug!(session_id = session.id(), "pending session timed out");
                }
                _ => self.pending_sessions.push(session),
            }
        }

        work_count
    }

    fn process_rejected_sessions(&mut self, now_ms: u64) -> usize {
        let mut work_count = 0;

        let mut rejected = mem::take(&mut self.rejected_sessions);
        for session in rejected.drain(..).rev() {
            let (event_code, detail) = if session.state() == SessionState::Rejected {
                (EventCode::AuthenticationRejected, SESSION_REJECTED_MSG)
            } else {
                (EventCode::Error, SESSION_LIMIT_MSG)
            };

            if self.egress_publisher.send_event(&session, event_code, detail)
                || now_ms > session.time_of_last_activity_ms() + self.ctx.session_timeout_ms
            {
                work_count += 1;
            } else {
                self.rejected_sessions.push(session);
            }
        }

        work_count
    }

    fn check_sessions(&mut self, now_ms: u64) -> usize {
        let mut work_count = 0;

        let session_ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for session_id in session_ids {
            let Some(mut session) = self.sessions.remove(&session_id) else {
                continue;
            };
            let state = session.state();

            if now_ms > session.time_of_last_activity_ms() + self.ctx.session_timeout_ms {
                work_count += 1;
                match state {
                    SessionState::Open { .. } => {
                        self.egress_publisher.send_event(
                            &session,
                            EventCode::Error,
                            SESSION_TIMEOUT_MSG,
                        );
                        if !self.append_closed_session(&mut session, CloseReason::Timeout, now_ms)
                        {
                            session.set_state(SessionState::TimedOut);
                            self.sessions.insert(session_id, session);
                        }
                    }
                    SessionState::TimedOut => {
                        if !self.append_closed_session(&mut session, CloseReason::Timeout, now_ms)
                        {
                            self.sessions.insert(session_id, session);
                        }
                    }
                    SessionState::Closed { reason } => {
                        if !self.append_closed_session(&mut session, reason, now_ms) {
                            self.sessions.insert(session_id, session);
                        }
                    }
                    _ => {}
                }
            } else {
                match state {
                    SessionState::Connected | SessionState::Authenticated => {
                        self.append_connected_session(&mut session, now_ms);
                        work_count += 1;
                        self.sessions.insert(session_id, session);
                    }
                    SessionState::Open { .. } if session.admin_response_detail().is_some() => {
                        let detail = session
                            .admin_response_detail()
                            .map(str::to_string)
                            .unwrap_or_default();
                        if self
                            .egress_publisher
                            .send_event(&session, EventCode::Ok, &detail)
                        {
                            session.set_admin_response_detail(None);
                        }
                        self.sessions.insert(session_id, session);
                    }
                    _ => {
                        self.sessions.insert(session_id, session);
                    }
                }
            }
        }

        work_count
    }

    fn append_connected_session(&self, session: &mut ClusterSession, now_ms: u64) {
        if let Some(position) =
            self.log_appender
                .append_session_open(session, self.leadership_term_id, now_ms)
        {
            session.open(position);
        }
    }

    fn append_closed_session(
        &self,
        session: &mut ClusterSession,
        close_reason: CloseReason,
        now_ms: u64,
    ) -> bool {
        if self.log_appender.append_session_close(
            session,
            close_reason,
            self.leadership_term_id,
            now_ms,
        ) {
            session.close(close_reason);
            return true;
        }
        false
    }

    // ---- election and role transitions ----

    fn elect_leader(&mut self) -> anyhow::Result<()> {
        self.await_connected_members()?;

        if self.ctx.appointed_leader_id == self.ctx.member_id {
            self.set_role(Role::Candidate);
            member::become_candidate(&mut self.cluster_members, self.ctx.member_id);
            self.voted_for_member_id = Some(self.ctx.member_id);

            let plan = self.recovery_plan.as_ref().context("recovery plan")?;
            let last_log_position = plan.last_log_position;
            let last_term_position = plan.last_term_position_appended;
            for cluster_member in &self.cluster_members {
                if let Some(publication) = &cluster_member.publication {
                    ensure!(
                        self.member_status_publisher.request_vote(
                            publication,
                            self.leadership_term_id,
                            last_log_position,
                            last_term_position,
                            self.ctx.member_id,
                        ),
                        "failed to request vote from member {}",
                        cluster_member.id
                    );
                }
            }

            let fragment_limit = self.ctx.fragment_limit;
            loop {
                let adapter = self.member_status_adapter.clone();
                let fragments = adapter.poll(self, fragment_limit)?;
                if !member::awaiting_votes(&self.cluster_members) {
                    break;
                }
                self.idle(fragments)?;
            }

            self.leader_member_id = self.ctx.member_id;
        } else {
            self.voted_for_member_id = None;
            // The appointed leader is configured, so there is nothing to
            // spin for; votes are answered while awaiting the leader's log.
        }
        Ok(())
    }

    fn await_connected_members(&self) -> anyhow::Result<()> {
        self.ctx.idle_strategy.reset();
        while !member::are_publications_connected(&self.cluster_members) {
            self.idle(0)?;
        }
        Ok(())
    }

    fn become_leader(&mut self) -> anyhow::Result<()> {
        self.leader_member_id = self.ctx.member_id;
        self.update_member_details(self.ctx.member_id);
        self.set_role(Role::Leader);

        let log_uri = ChannelUri::parse(&self.ctx.log_channel)?;
        let publication = self
            .ctx
            .bus
            .add_exclusive_publication(&self.ctx.log_channel, self.ctx.log_stream_id)?;
        if log_uri.endpoint.is_none() {
            for cluster_member in &self.cluster_members {
                if cluster_member.id != self.ctx.member_id {
                    publication.add_destination(&cluster_member.log_endpoint);
                }
            }
        }

        self.log_adapter = None;
        self.log_session_id = publication.session_id();

        let recording_channel = log_uri
            .clone()
            .with_session_id(self.log_session_id)
            .to_string();
        self.ctx.archive.start_recording(
            &recording_channel,
            self.ctx.log_stream_id,
            SourceLocation::Local,
        )?;
        self.log_appender.connect(publication);

        self.create_position_counters()?;

        let service_channel = log_uri
            .with_session_id(self.log_session_id)
            .prefix_spy()
            .to_string();
        self.await_services_ready(&service_channel)?;
        self.await_followers_ready()?;

        let now_ms = self.ctx.epoch_clock.time_ms();
        for session in self.sessions.values_mut() {
            if let Err(err) = session.connect(&self.ctx.bus) {
                tracing::warn!(session_id = session.id(), error = ?err, "session reconnect failed");
            }
            session.set_time_of_last_activity(now_ms);
        }

        tracing::info!(
            member_id = self.ctx.member_id,
            leadership_term_id = self.leadership_term_id,
            log_session_id = self.log_session_id,
            "became leader"
        );
        Ok(())
    }

    fn become_follower(&mut self) -> anyhow::Result<()> {
        self.follower_commit_position = None;
        self.update_member_details(self.leader_member_id);
        self.set_role(Role::Follower);

        let fragment_limit = self.ctx.fragment_limit;
        loop {
            let adapter = self.member_status_adapter.clone();
            let fragments = adapter.poll(self, fragment_limit)?;
            if self.follower_commit_position.is_some() {
                break;
            }
            self.idle(fragments)?;
        }

        let log_channel = ChannelUri::parse(&self.ctx.log_channel)?
            .with_session_id(self.log_session_id)
            .to_string();
        self.ctx.archive.start_recording(
            &log_channel,
            self.ctx.log_stream_id,
            SourceLocation::Remote,
        )?;

        let subscription = self
            .ctx
            .bus
            .add_subscription(&log_channel, self.ctx.log_stream_id)?;
        let image = self.await_image(self.log_session_id, &subscription)?;
        self.log_adapter = Some(LogAdapter::new(image));

        self.create_position_counters()?;
        self.await_services_ready(&log_channel)?;

        tracing::info!(
            member_id = self.ctx.member_id,
            leader_member_id = self.leader_member_id,
            leadership_term_id = self.leadership_term_id,
            log_session_id = self.log_session_id,
            "became follower"
        );
        Ok(())
    }

    fn await_followers_ready(&mut self) -> anyhow::Result<()> {
        member::reset_term_positions(&mut self.cluster_members);
        let recording_position = self
            .log_recording_position
            .as_ref()
            .context("log recording position")?
            .get();
        self.cluster_members[self.ctx.member_id as usize].term_position = Some(recording_position);

        loop {
            let now_ms = self.ctx.epoch_clock.time_ms();
            if now_ms > self.time_of_last_log_update_ms + self.ctx.heartbeat_interval_ms {
                self.time_of_last_log_update_ms = now_ms;
                for cluster_member in &self.cluster_members {
                    if let Some(publication) = &cluster_member.publication {
                        self.member_status_publisher.commit_position(
                            publication,
                            0,
                            self.leadership_term_id,
                            self.ctx.member_id,
                            self.log_session_id,
                        );
                    }
                }
            }

            let fragment_limit = self.ctx.fragment_limit;
            let adapter = self.member_status_adapter.clone();
            let fragments = adapter.poll(self, fragment_limit)?;

            let reached = member::count_reached_position(&self.cluster_members, 0);
            if reached >= member::quorum_threshold(self.cluster_members.len()) {
                break;
            }
            self.idle(fragments)?;
        }
        Ok(())
    }

    fn create_position_counters(&mut self) -> anyhow::Result<()> {
        let recording_position = self.await_recording_counter(self.log_session_id)?;
        self.log_recording_id = Some(recording_position.recording_id());
        self.commit_position = Some(self.ctx.registry.allocate_commit_pos(
            recording_position.recording_id(),
            self.base_log_position,
            self.leadership_term_id,
            self.log_session_id,
        ));
        self.log_recording_position = Some(recording_position);
        self.last_appended_position = None;
        Ok(())
    }

    fn await_services_ready(&mut self, channel: &str) -> anyhow::Result<()> {
        self.service_ack_count = 0;
        let commit_position_id = self
            .commit_position
            .as_ref()
            .context("commit position counter")?
            .id;
        let leadership_term_id = self.leadership_term_id;
        let log_session_id = self.log_session_id;
        let log_stream_id = self.ctx.log_stream_id;
        let publisher = self.service_control_publisher.clone();
        self.retry_offer(|| {
            publisher.join_log(
                leadership_term_id,
                commit_position_id,
                log_session_id,
                log_stream_id,
                channel,
            )
        })?;
        self.await_service_acks()
    }

    fn update_member_details(&mut self, leader_member_id: MemberId) {
        member::set_leader(&mut self.cluster_members, leader_member_id);

        let leader_index = leader_member_id as usize;
        let mut detail = self.cluster_members[leader_index].client_endpoint.clone();
        for (index, cluster_member) in self.cluster_members.iter().enumerate() {
            if index != leader_index {
                detail.push(',');
                detail.push_str(&cluster_member.client_endpoint);
            }
        }
        self.member_endpoints_detail = detail;
    }

    // ---- recovery ----

    fn publish_recovery_state(&self, plan: &RecoveryPlan) {
        let recovery_state = match &plan.snapshot_step {
            Some(step) => RecoveryState {
                leadership_term_id: step.entry.leadership_term_id,
                log_position: step.entry.log_position,
                term_position: step.entry.term_position,
                timestamp_ms: step.entry.timestamp_ms,
                term_count: plan.term_steps.len(),
            },
            None => RecoveryState {
                leadership_term_id: self.leadership_term_id,
                log_position: 0,
                term_position: None,
                timestamp_ms: 0,
                term_count: plan.term_steps.len(),
            },
        };
        self.ctx.registry.publish_recovery_state(recovery_state);
    }

    fn recover_from_snapshot(&mut self, snapshot_step: &ReplayStep) -> anyhow::Result<()> {
        let entry = &snapshot_step.entry;
        self.cached_clock.update(entry.timestamp_ms);
        self.base_log_position = entry.log_position;
        self.leadership_term_id = entry.leadership_term_id;

        let extent = self
            .ctx
            .archive
            .list_recording(entry.recording_id)
            .with_context(|| format!("snapshot recording {} not found", entry.recording_id))?;
        let length = extent.stop_position - extent.start_position;
        let session_id = self.ctx.archive.start_snapshot_replay(
            entry.recording_id,
            extent.start_position,
            length,
            &self.ctx.replay_channel,
            self.ctx.replay_stream_id,
        )?;

        let channel = ChannelUri::parse(&self.ctx.replay_channel)?
            .with_session_id(session_id)
            .to_string();
        let subscription = self
            .ctx
            .bus
            .add_subscription(&channel, self.ctx.replay_stream_id)?;
        let image = self.await_image(session_id, &subscription)?;

        let mut loader = SnapshotLoader::new(image);
        loop {
            let fragments = loader.poll(self)?;
            if fragments == 0 {
                if loader.is_done() {
                    break;
                }
                ensure!(!loader.image().is_closed(), "snapshot ended unexpectedly");
            }
            self.idle(fragments)?;
        }
        subscription.close();

        tracing::info!(
            member_id = self.ctx.member_id,
            leadership_term_id = self.leadership_term_id,
            base_log_position = self.base_log_position,
            sessions = self.sessions.len(),
            "recovered from snapshot"
        );
        Ok(())
    }

    fn recover_from_log(&mut self, term_steps: &[ReplayStep]) -> anyhow::Result<()> {
        for (step_index, step) in term_steps.iter().enumerate() {
            let entry = &step.entry;
            ensure!(
                entry.log_position == self.base_log_position,
                "base position for term not as expected: expected {} actual {}",
                self.base_log_position,
                entry.log_position
            );
            self.leadership_term_id = entry.leadership_term_id;
            self.log_adapter = None;

            let commit_position = self.ctx.registry.allocate_commit_pos(
                entry.recording_id,
                entry.log_position,
                entry.leadership_term_id,
                step_index as i32,
            );
            if let Some(stop_position) = step.recording_stop_position {
                commit_position.set_ordered(stop_position);
            }

            let channel = ChannelUri::parse(&self.ctx.replay_channel)?
                .with_session_id(step_index as i32)
                .to_string();
            let subscription = self
                .ctx
                .bus
                .add_subscription(&channel, self.ctx.replay_stream_id)?;

            self.service_ack_count = 0;
            let publisher = self.service_control_publisher.clone();
            let leadership_term_id = self.leadership_term_id;
            let commit_position_id = commit_position.id;
            let replay_stream_id = self.ctx.replay_stream_id;
            self.retry_offer(|| {
                publisher.join_log(
                    leadership_term_id,
                    commit_position_id,
                    step_index as i32,
                    replay_stream_id,
                    &channel,
                )
            })?;
            self.await_service_acks()?;

            let length = match step.recording_stop_position {
                Some(stop_position) => stop_position - step.recording_start_position,
                None => u64::MAX,
            };
            let session_id = self.ctx.archive.start_replay(
                entry.recording_id,
                step.recording_start_position,
                length,
                &channel,
                self.ctx.replay_stream_id,
            )?;
            ensure!(
                session_id == step_index as i32,
                "replay session id {session_id} not for term step {step_index}"
            );
            let image = self.await_image(session_id, &subscription)?;

            self.service_ack_count = 0;
            self.replay_term(image, step.recording_stop_position)?;
            self.await_service_acks()?;

            let term_position = self
                .log_adapter
                .as_ref()
                .map(LogAdapter::position)
                .unwrap_or_default();
            if entry.term_position.map_or(true, |p| p < term_position) {
                self.ctx
                    .recording_log
                    .commit_leadership_term_position(self.leadership_term_id, term_position)?;
            }
            self.base_log_position += term_position;

            for correlation_id in mem::take(&mut self.failed_timer_cancellations) {
                self.timer_service.cancel_timer(correlation_id);
            }

            self.ctx.registry.free_commit_pos(commit_position.id);
            subscription.close();

            tracing::info!(
                member_id = self.ctx.member_id,
                leadership_term_id = self.leadership_term_id,
                term_position,
                base_log_position = self.base_log_position,
                "recovered leadership term"
            );
        }
        Ok(())
    }

    fn replay_term(&mut self, image: Image, stop_position: Option<u64>) -> anyhow::Result<()> {
        self.log_adapter = Some(LogAdapter::new(image.clone()));
        let limit_position = stop_position.unwrap_or(u64::MAX);

        loop {
            let fragment_limit = self.ctx.fragment_limit;
            let adapter = self.log_adapter.clone().context("log adapter")?;
            let fragments = adapter.poll(self, limit_position, fragment_limit)?;
            if fragments == 0 {
                if let Some(stop_position) = stop_position {
                    if image.position() >= stop_position {
                        break;
                    }
                }
                if image.is_closed() {
                    ensure!(image.is_end_of_stream(), "unexpected close of replay image");
                    break;
                }
            }
            self.idle(fragments)?;
        }
        Ok(())
    }

    fn await_service_acks(&mut self) -> anyhow::Result<()> {
        let fragment_limit = self.ctx.fragment_limit;
        loop {
            let adapter = self.service_control_adapter.clone();
            let fragments = adapter.poll(self, fragment_limit)?;
            if self.service_ack_count >= self.ctx.service_count {
                return Ok(());
            }
            self.idle(fragments)?;
        }
    }

    fn await_image(&self, session_id: i32, subscription: &Subscription) -> anyhow::Result<Image> {
        self.ctx.idle_strategy.reset();
        loop {
            if let Some(image) = subscription.image_by_session_id(session_id) {
                return Ok(image);
            }
            self.idle(0)?;
        }
    }

    fn await_recording_counter(&self, session_id: i32) -> anyhow::Result<RecordingPos> {
        self.ctx.idle_strategy.reset();
        loop {
            if let Some(recording_position) = self.ctx.archive.recording_pos(session_id) {
                return Ok(recording_position);
            }
            self.idle(0)?;
        }
    }

    // ---- snapshot ----

    fn take_snapshot(&mut self, timestamp_ms: u64, term_position: u64) -> anyhow::Result<()> {
        let log_position = self.base_log_position + term_position;
        let publication = self.ctx.archive.add_recorded_exclusive_publication(
            &self.ctx.snapshot_channel,
            self.ctx.snapshot_stream_id,
        )?;
        let recording_position = self.await_recording_counter(publication.session_id())?;
        let recording_id = recording_position.recording_id();

        let taker = SnapshotTaker::new(publication.clone());
        let leadership_term_id = self.leadership_term_id;
        self.retry_offer(|| taker.mark_begin(log_position, leadership_term_id, 0))?;
        for session in self.sessions.values().filter(|s| s.is_open()) {
            self.retry_offer(|| taker.snapshot_session(session))?;
        }
        for (correlation_id, deadline_ms) in self.timer_service.entries() {
            self.retry_offer(|| taker.snapshot_timer(correlation_id, deadline_ms))?;
        }
        let next_session_id = self.next_session_id;
        self.retry_offer(|| taker.sequencer_state(next_session_id))?;
        self.retry_offer(|| taker.mark_end(log_position, leadership_term_id, 0))?;

        loop {
            if recording_position.get() >= publication.position() {
                break;
            }
            ensure!(
                recording_position.is_active(),
                "recording {recording_id} stopped unexpectedly"
            );
            self.idle(0)?;
        }
        self.ctx.archive.stop_recording(recording_id)?;
        publication.close();

        self.ctx.recording_log.append_snapshot(
            recording_id,
            self.leadership_term_id,
            self.base_log_position,
            term_position,
            timestamp_ms,
        )?;

        tracing::info!(
            member_id = self.ctx.member_id,
            recording_id,
            log_position,
            "snapshot taken"
        );
        Ok(())
    }
}

// ---- ingress dispatch ----

impl IngressHandler for SequencerAgent {
    fn on_session_connect(
        &mut self,
        correlation_id: u64,
        response_stream_id: i32,
        response_channel: &str,
        credentials: &[u8],
    ) {
        let now_ms = self.cached_clock.time_ms();
        let session_id = self.next_session_id;
        self.next_session_id += 1;

        let mut session = ClusterSession::new(session_id, response_stream_id, response_channel);
        if let Err(err) = session.connect(&self.ctx.bus) {
            tracing::warn!(error = ?err, response_channel, "rejecting unconnectable session");
            self.ctx.counters.invalid_requests.increment_ordered();
            return;
        }
        session.last_activity(now_ms, correlation_id);

        if self.pending_sessions.len() + self.sessions.len() < self.ctx.max_concurrent_sessions {
            self.authenticator
                .on_connect_request(session_id, credentials, now_ms);
            self.pending_sessions.push(session);
        } else {
            self.rejected_sessions.push(session);
        }
    }

    fn on_session_close(&mut self, cluster_session_id: SessionId) {
        let Some(mut session) = self.sessions.remove(&cluster_session_id) else {
            return;
        };
        let now_ms = self.cached_clock.time_ms();
        session.close(CloseReason::UserAction);
        if !self.append_closed_session(&mut session, CloseReason::UserAction, now_ms) {
            self.sessions.insert(cluster_session_id, session);
        }
    }

    fn on_session_message(
        &mut self,
        payload: &[u8],
        cluster_session_id: SessionId,
        correlation_id: u64,
    ) -> ControlledAction {
        let now_ms = self.cached_clock.time_ms();
        let Some(session) = self.sessions.get(&cluster_session_id) else {
            return ControlledAction::Continue;
        };
        match session.state() {
            SessionState::TimedOut | SessionState::Closed { .. } => ControlledAction::Continue,
            SessionState::Open { .. } => {
                if self
                    .log_appender
                    .append_session_message(
                        cluster_session_id,
                        correlation_id,
                        payload,
                        self.leadership_term_id,
                        now_ms,
                    )
                    .is_some()
                {
                    if let Some(session) = self.sessions.get_mut(&cluster_session_id) {
                        session.last_activity(now_ms, correlation_id);
                    }
                    ControlledAction::Continue
                } else {
                    ControlledAction::Abort
                }
            }
            _ => ControlledAction::Abort,
        }
    }

    fn on_keep_alive(&mut self, cluster_session_id: SessionId) {
        let now_ms = self.cached_clock.time_ms();
        if let Some(session) = self.sessions.get_mut(&cluster_session_id) {
            session.set_time_of_last_activity(now_ms);
        }
    }

    fn on_challenge_response(
        &mut self,
        correlation_id: u64,
        cluster_session_id: SessionId,
        credentials: &[u8],
    ) {
        let now_ms = self.cached_clock.time_ms();
        for session in self.pending_sessions.iter_mut().rev() {
            if session.id() == cluster_session_id && session.state() == SessionState::Challenged {
                session.last_activity(now_ms, correlation_id);
                self.authenticator
                    .on_challenge_response(cluster_session_id, credentials, now_ms);
                break;
            }
        }
    }

    fn on_admin_query(
        &mut self,
        correlation_id: u64,
        cluster_session_id: SessionId,
        query_type: AdminQueryType,
    ) {
        let now_ms = self.cached_clock.time_ms();
        let this_member = &self.cluster_members[self.ctx.member_id as usize];
        let endpoints_detail = format!(
            "id={},memberStatus={},log={},archive=in-process",
            this_member.id, this_member.member_endpoint, this_member.log_endpoint
        );

        let Some(session) = self.sessions.get_mut(&cluster_session_id) else {
            return;
        };
        if !session.is_open() {
            return;
        }

        match query_type {
            AdminQueryType::Endpoints => {
                session.last_activity(now_ms, correlation_id);
                session.set_admin_response_detail(Some(endpoints_detail));
                let detail = session
                    .admin_response_detail()
                    .map(str::to_string)
                    .unwrap_or_default();
                if self
                    .egress_publisher
                    .send_event(session, EventCode::Ok, &detail)
                {
                    session.set_admin_response_detail(None);
                }
            }
            AdminQueryType::RecordingLog => {
                session.last_activity(now_ms, correlation_id);
                self.egress_publisher
                    .send_event(session, EventCode::Error, RECORDING_LOG_QUERY_MSG);
            }
        }
    }
}

// ---- member status dispatch ----

impl MemberStatusListener for SequencerAgent {
    fn on_request_vote(
        &mut self,
        candidate_term_id: i64,
        last_base_log_position: u64,
        last_term_position: u64,
        candidate_id: MemberId,
    ) -> anyhow::Result<()> {
        let (plan_log_position, plan_term_position) = match &self.recovery_plan {
            Some(plan) => (plan.last_log_position, plan.last_term_position_appended),
            None => (0, 0),
        };

        let grant_basis = self.role == Role::Follower
            && candidate_term_id == self.leadership_term_id
            && last_base_log_position == plan_log_position;

        if grant_basis {
            let potential_leader = last_term_position >= plan_term_position;
            self.publish_vote(
                candidate_id,
                candidate_term_id,
                last_base_log_position,
                last_term_position,
                potential_leader,
            );
            ensure!(
                potential_leader,
                "candidate {candidate_id} behind member {}: {last_term_position} < {plan_term_position}",
                self.ctx.member_id
            );
            self.voted_for_member_id = Some(candidate_id);
            // A voter whose own appended position trails the candidate would
            // need a catch-up phase before consuming the new term.
        } else {
            self.publish_vote(
                candidate_id,
                candidate_term_id,
                last_base_log_position,
                last_term_position,
                false,
            );
        }
        Ok(())
    }

    fn on_vote(
        &mut self,
        candidate_term_id: i64,
        last_base_log_position: u64,
        last_term_position: u64,
        candidate_id: MemberId,
        follower_id: MemberId,
        vote: bool,
    ) -> anyhow::Result<()> {
        let (plan_log_position, plan_term_position) = match &self.recovery_plan {
            Some(plan) => (plan.last_log_position, plan.last_term_position_appended),
            None => (0, 0),
        };

        if self.role == Role::Candidate
            && candidate_term_id == self.leadership_term_id
            && candidate_id == self.ctx.member_id
            && last_base_log_position == plan_log_position
            && last_term_position == plan_term_position
        {
            ensure!(
                vote,
                "member {follower_id} voted against leadership of candidate {candidate_id}"
            );
            self.cluster_members[follower_id as usize].voted_for_id = Some(candidate_id);
        }
        Ok(())
    }

    fn on_appended_position(
        &mut self,
        term_position: u64,
        leadership_term_id: i64,
        follower_id: MemberId,
    ) -> anyhow::Result<()> {
        if leadership_term_id == self.leadership_term_id {
            self.cluster_members[follower_id as usize].term_position = Some(term_position);
        }
        Ok(())
    }

    fn on_commit_position(
        &mut self,
        term_position: u64,
        leadership_term_id: i64,
        leader_id: MemberId,
        log_session_id: i32,
    ) -> anyhow::Result<()> {
        if leadership_term_id == self.leadership_term_id {
            ensure!(
                leader_id == self.leader_member_id,
                "commit position not for current leader: expected {} received {leader_id}",
                self.leader_member_id
            );
            if term_position == 0
                && Some(leader_id) == self.voted_for_member_id
                && self.log_session_id != log_session_id
            {
                self.log_session_id = log_session_id;
            }
            self.time_of_last_log_update_ms = self.cached_clock.time_ms();
            self.follower_commit_position = Some(term_position);
        }
        Ok(())
    }
}

impl SequencerAgent {
    fn publish_vote(
        &self,
        candidate_id: MemberId,
        candidate_term_id: i64,
        last_base_log_position: u64,
        last_term_position: u64,
        vote: bool,
    ) {
        let Some(candidate) = self.cluster_members.get(candidate_id as usize) else {
            return;
        };
        if let Some(publication) = &candidate.publication {
            self.member_status_publisher.vote(
                publication,
                candidate_term_id,
                last_base_log_position,
                last_term_position,
                candidate_id,
                self.ctx.member_id,
                vote,
            );
        }
    }
}

// ---- service control dispatch ----

impl ServiceControlListener for SequencerAgent {
    fn on_service_ack(
        &mut self,
        log_position: u64,
        leadership_term_id: i64,
        service_id: u32,
        action: ClusterAction,
    ) -> anyhow::Result<()> {
        self.validate_service_ack(log_position, leadership_term_id, service_id, action)?;

        self.service_ack_count += 1;
        ensure!(
            self.service_ack_count <= self.ctx.service_count,
            "service ack count exceeded: {}",
            self.service_ack_count
        );
        if self.service_ack_count == self.ctx.service_count {
            let term_position = log_position - self.base_log_position;
            self.complete_action(action, term_position)?;
        }
        Ok(())
    }

    fn on_schedule_timer(&mut self, correlation_id: u64, deadline_ms: u64) -> anyhow::Result<()> {
        self.timer_service.schedule_timer(correlation_id, deadline_ms);
        Ok(())
    }

    fn on_cancel_timer(&mut self, correlation_id: u64) -> anyhow::Result<()> {
        self.timer_service.cancel_timer(correlation_id);
        Ok(())
    }
}

// ---- log replay dispatch ----

impl LogEventHandler for SequencerAgent {
    fn on_replay_session_open(
        &mut self,
        term_position: u64,
        correlation_id: u64,
        cluster_session_id: SessionId,
        timestamp_ms: u64,
        response_stream_id: i32,
        response_channel: &str,
    ) {
        self.cached_clock.update(timestamp_ms);

        let mut session =
            ClusterSession::new(cluster_session_id, response_stream_id, response_channel);
        session.open(term_position);
        session.last_activity(timestamp_ms, correlation_id);
        self.sessions.insert(cluster_session_id, session);

        if cluster_session_id >= self.next_session_id {
            self.next_session_id = cluster_session_id + 1;
        }
    }

    fn on_replay_session_message(
        &mut self,
        cluster_session_id: SessionId,
        correlation_id: u64,
        timestamp_ms: u64,
        _payload: &[u8],
    ) {
        self.cached_clock.update(timestamp_ms);
        if let Some(session) = self.sessions.get_mut(&cluster_session_id) {
            session.last_activity(timestamp_ms, correlation_id);
        }
    }

    fn on_replay_session_close(
        &mut self,
        cluster_session_id: SessionId,
        timestamp_ms: u64,
        close_reason: CloseReason,
    ) {
        self.cached_clock.update(timestamp_ms);
        match self.sessions.remove(&cluster_session_id) {
            Some(mut session) => session.close(close_reason),
            None => {
                tracing::warn!(cluster_session_id, "replayed close for unknown session");
            }
        }
    }

    fn on_replay_timer_event(&mut self, correlation_id: u64, timestamp_ms: u64) {
        self.cached_clock.update(timestamp_ms);
        if !self.timer_service.cancel_timer(correlation_id) {
            self.failed_timer_cancellations.push(correlation_id);
        }
    }

    fn on_replay_cluster_action(
        &mut self,
        log_position: u64,
        _leadership_term_id: i64,
        timestamp_ms: u64,
        action: ClusterAction,
    ) -> anyhow::Result<()> {
        self.cached_clock.update(timestamp_ms);
        let term_position = log_position - self.base_log_position;

        match action {
            ClusterAction::Suspend => self.set_state(ConsensusState::Suspended),
            ClusterAction::Resume => self.set_state(ConsensusState::Active),
            ClusterAction::Snapshot => {
                if self.is_recovered {
                    self.service_ack_count = 0;
                    self.set_state(ConsensusState::Snapshot);
                    self.take_snapshot(timestamp_ms, term_position)?;
                    if self.ctx.service_count == 0 {
                        self.complete_action(ClusterAction::Snapshot, term_position)?;
                    }
                }
            }
            ClusterAction::Shutdown => {
                if self.is_recovered {
                    self.service_ack_count = 0;
                    self.set_state(ConsensusState::Shutdown);
                    self.take_snapshot(timestamp_ms, term_position)?;
                    if self.ctx.service_count == 0 {
                        self.complete_action(ClusterAction::Shutdown, term_position)?;
                    }
                }
            }
            ClusterAction::Abort => {
                if self.is_recovered {
                    self.service_ack_count = 0;
                    self.set_state(ConsensusState::Abort);
                    if self.ctx.service_count == 0 {
                        self.complete_action(ClusterAction::Abort, term_position)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

// ---- snapshot load dispatch ----

impl SnapshotHandler for SequencerAgent {
    fn on_reload_state(&mut self, next_session_id: SessionId) {
        self.next_session_id = next_session_id;
    }

    fn on_loaded_session(
        &mut self,
        cluster_session_id: SessionId,
        correlation_id: u64,
        open_term_position: u64,
        time_of_last_activity_ms: u64,
        response_stream_id: i32,
        response_channel: &str,
    ) {
        let mut session =
            ClusterSession::new(cluster_session_id, response_stream_id, response_channel);
        session.open(open_term_position);
        session.last_activity(time_of_last_activity_ms, correlation_id);
        self.sessions.insert(cluster_session_id, session);

        if cluster_session_id >= self.next_session_id {
            self.next_session_id = cluster_session_id + 1;
        }
    }

    fn on_loaded_timer(&mut self, correlation_id: u64, deadline_ms: u64) {
        self.timer_service.schedule_timer(correlation_id, deadline_ms);
    }
}
