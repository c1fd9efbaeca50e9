//! Minimal co-hosted service replica driver.
//!
//! A real deployment hosts application state machines behind this surface;
//! the driver covers the cluster-facing half: join announced logs, consume
//! records, and acknowledge recovery boundaries and cluster actions.

use std::collections::VecDeque;

use crate::bus::{ControlledAction, Image, MediaBus, Subscription};
use crate::counters::CounterRegistry;
use crate::log::LogEntry;
use crate::service::{
    ClusterAction, ServiceControlAdapter, ServiceControlListener, ServiceControlPublisher,
};

#[derive(Debug)]
struct JoinedLog {
    subscription: Subscription,
    image: Option<Image>,
    log_session_id: i32,
    base_log_position: u64,
    leadership_term_id: i64,
    replay_acked: bool,
}

#[derive(Debug)]
struct PendingAck {
    log_position: u64,
    leadership_term_id: i64,
    action: ClusterAction,
}

/// One service replica co-hosted with a sequencer.
pub struct ServiceHost {
    service_id: u32,
    bus: MediaBus,
    registry: CounterRegistry,
    adapter: ServiceControlAdapter,
    publisher: ServiceControlPublisher,
    recovery_acked: bool,
    join: Option<JoinedLog>,
    pending_acks: VecDeque<PendingAck>,
    observed_entries: u64,
}

impl ServiceHost {
    pub fn new(
        service_id: u32,
        bus: &MediaBus,
        registry: &CounterRegistry,
        service_control_channel: &str,
        service_control_stream_id: i32,
    ) -> anyhow::Result<Self> {
        let subscription = bus.add_subscription(service_control_channel, service_control_stream_id)?;
        let publication = bus.add_publication(service_control_channel, service_control_stream_id)?;
        Ok(Self {
            service_id,
            bus: bus.clone(),
            registry: registry.clone(),
            adapter: ServiceControlAdapter::new(subscription),
            publisher: ServiceControlPublisher::new(publication),
            recovery_acked: false,
            join: None,
            pending_acks: VecDeque::new(),
            observed_entries: 0,
        })
    }

    pub fn service_id(&self) -> u32 {
        self.service_id
    }

    /// Log records this replica has consumed, across joins.
    pub fn observed_entries(&self) -> u64 {
        self.observed_entries
    }

    /// Schedule a cluster timer on behalf of the hosted service.
    pub fn schedule_timer(&self, correlation_id: u64, deadline_ms: u64) -> bool {
        self.publisher.schedule_timer(correlation_id, deadline_ms)
    }

    pub fn cancel_timer(&self, correlation_id: u64) -> bool {
        self.publisher.cancel_timer(correlation_id)
    }

    pub fn do_work(&mut self) -> anyhow::Result<usize> {
        let mut work = 0;

        if !self.recovery_acked {
            if let Some(recovery_state) = self.registry.recovery_state() {
                self.pending_acks.push_back(PendingAck {
                    log_position: recovery_state.log_position,
                    leadership_term_id: recovery_state.leadership_term_id,
                    action: ClusterAction::Ready,
                });
                self.recovery_acked = true;
                work += 1;
            }
        }

        let adapter = self.adapter.clone();
        work += adapter.poll(self, 16)?;
        work += self.poll_log();
        work += self.drain_acks();

        Ok(work)
    }

    fn poll_log(&mut self) -> usize {
        let Some(join) = &mut self.join else {
            return 0;
        };
        if join.image.is_none() {
            join.image = join.subscription.image_by_session_id(join.log_session_id);
        }
        let Some(image) = join.image.clone() else {
            return 0;
        };

        let mut actions = Vec::new();
        let mut observed = 0u64;
        let fragments = image.controlled_poll(
            &mut |_, payload| {
                match LogEntry::decode(payload) {
                    Ok(LogEntry::ClusterAction {
                        leadership_term_id,
                        log_position,
                        action,
                        ..
                    }) => {
                        if matches!(
                            action,
                            ClusterAction::Snapshot | ClusterAction::Shutdown | ClusterAction::Abort
                        ) {
                            actions.push(PendingAck {
                                log_position,
                                leadership_term_id,
                                action,
                            });
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(error = ?err, "service replica dropped a log record");
                    }
                }
                observed += 1;
                ControlledAction::Continue
            },
            16,
        );
        self.observed_entries += observed;
        self.pending_acks.extend(actions);

        let join = self.join.as_mut().expect("joined log present");
        if !join.replay_acked && image.is_end_of_stream() {
            // Replayed term fully consumed; report the boundary position.
            self.pending_acks.push_back(PendingAck {
                log_position: join.base_log_position + image.position(),
                leadership_term_id: join.leadership_term_id,
                action: ClusterAction::Replay,
            });
            join.replay_acked = true;
        }

        fragments
    }

    fn drain_acks(&mut self) -> usize {
        let mut sent = 0;
        while let Some(ack) = self.pending_acks.front() {
            if !self.publisher.service_ack(
                ack.log_position,
                ack.leadership_term_id,
                self.service_id,
                ack.action,
            ) {
                break;
            }
            self.pending_acks.pop_front();
            sent += 1;
        }
        sent
    }
}

impl ServiceControlListener for ServiceHost {
    fn on_join_log(
        &mut self,
        leadership_term_id: i64,
        commit_position_id: i32,
        log_session_id: i32,
        log_stream_id: i32,
        channel: &str,
    ) -> anyhow::Result<()> {
        let commit_pos = self
            .registry
            .commit_pos(commit_position_id)
            .ok_or_else(|| anyhow::anyhow!("unknown commit position id {commit_position_id}"))?;
        let subscription = self.bus.add_subscription(channel, log_stream_id)?;
        tracing::debug!(
            service_id = self.service_id,
            leadership_term_id,
            log_session_id,
            channel,
            "service joining log"
        );
        self.join = Some(JoinedLog {
            subscription,
            image: None,
            log_session_id,
            base_log_position: commit_pos.base_log_position,
            leadership_term_id,
            replay_acked: false,
        });
        self.pending_acks.push_back(PendingAck {
            log_position: commit_pos.base_log_position,
            leadership_term_id,
            action: ClusterAction::Ready,
        });
        Ok(())
    }
}
