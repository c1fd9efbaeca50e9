//! Control plane between the sequencer and co-hosted service replicas.

use anyhow::anyhow;

use crate::bus::{ControlledAction, Publication, Subscription};
use crate::codec::{
    put_i32, put_i64, put_str, put_u32, put_u64, put_u8_tag, read_i32_at, read_i64_at,
    read_str_at, read_u32_at, read_u64_at, read_u8_tag_at,
};

/// Actions services acknowledge or the cluster records in the log.
///
/// READY and REPLAY are ack-only recovery boundaries; the rest are appended
/// as cluster-action records and observed through log replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterAction {
    Ready,
    Replay,
    Suspend,
    Resume,
    Snapshot,
    Shutdown,
    Abort,
}

impl ClusterAction {
    pub fn code(self) -> u8 {
        match self {
            ClusterAction::Ready => 0,
            ClusterAction::Replay => 1,
            ClusterAction::Suspend => 2,
            ClusterAction::Resume => 3,
            ClusterAction::Snapshot => 4,
            ClusterAction::Shutdown => 5,
            ClusterAction::Abort => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ClusterAction::Ready),
            1 => Some(ClusterAction::Replay),
            2 => Some(ClusterAction::Suspend),
            3 => Some(ClusterAction::Resume),
            4 => Some(ClusterAction::Snapshot),
            5 => Some(ClusterAction::Shutdown),
            6 => Some(ClusterAction::Abort),
            _ => None,
        }
    }
}

const JOIN_LOG_TAG: u8 = 1;
const SERVICE_ACK_TAG: u8 = 2;
const SCHEDULE_TIMER_TAG: u8 = 3;
const CANCEL_TIMER_TAG: u8 = 4;

/// Decoded service-control message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceControlMessage {
    JoinLog {
        leadership_term_id: i64,
        commit_position_id: i32,
        log_session_id: i32,
        log_stream_id: i32,
        channel: String,
    },
    ServiceAck {
        log_position: u64,
        leadership_term_id: i64,
        service_id: u32,
        action: ClusterAction,
    },
    ScheduleTimer {
        correlation_id: u64,
        deadline_ms: u64,
    },
    CancelTimer {
        correlation_id: u64,
    },
}

impl ServiceControlMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ServiceControlMessage::JoinLog {
                leadership_term_id,
                commit_position_id,
                log_session_id,
                log_stream_id,
                channel,
            } => {
                put_u8_tag(&mut out, JOIN_LOG_TAG);
                put_i64(&mut out, *leadership_term_id);
                put_i32(&mut out, *commit_position_id);
                put_i32(&mut out, *log_session_id);
                put_i32(&mut out, *log_stream_id);
                put_str(&mut out, channel);
            }
            ServiceControlMessage::ServiceAck {
                log_position,
                leadership_term_id,
                service_id,
                action,
            } => {
                put_u8_tag(&mut out, SERVICE_ACK_TAG);
                put_u64(&mut out, *log_position);
                put_i64(&mut out, *leadership_term_id);
                put_u32(&mut out, *service_id);
                put_u8_tag(&mut out, action.code());
            }
            ServiceControlMessage::ScheduleTimer {
                correlation_id,
                deadline_ms,
            } => {
                put_u8_tag(&mut out, SCHEDULE_TIMER_TAG);
                put_u64(&mut out, *correlation_id);
                put_u64(&mut out, *deadline_ms);
            }
            ServiceControlMessage::CancelTimer { correlation_id } => {
                put_u8_tag(&mut out, CANCEL_TIMER_TAG);
                put_u64(&mut out, *correlation_id);
            }
        }
        out
    }

    pub fn decode(payload: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0;
        let tag = read_u8_tag_at(payload, &mut offset)?;
        match tag {
            JOIN_LOG_TAG => Ok(ServiceControlMessage::JoinLog {
                leadership_term_id: read_i64_at(payload, &mut offset)?,
                commit_position_id: read_i32_at(payload, &mut offset)?,
                log_session_id: read_i32_at(payload, &mut offset)?,
                log_stream_id: read_i32_at(payload, &mut offset)?,
                channel: read_str_at(payload, &mut offset)?,
            }),
            SERVICE_ACK_TAG => {
                let log_position = read_u64_at(payload, &mut offset)?;
                let leadership_term_id = read_i64_at(payload, &mut offset)?;
                let service_id = read_u32_at(payload, &mut offset)?;
                let code = read_u8_tag_at(payload, &mut offset)?;
                let action = ClusterAction::from_code(code)
                    .ok_or_else(|| anyhow!("unknown service ack action {code}"))?;
                Ok(ServiceControlMessage::ServiceAck {
                    log_position,
                    leadership_term_id,
                    service_id,
                    action,
                })
            }
            SCHEDULE_TIMER_TAG => Ok(ServiceControlMessage::ScheduleTimer {
                correlation_id: read_u64_at(payload, &mut offset)?,
                deadline_ms: read_u64_at(payload, &mut offset)?,
            }),
            CANCEL_TIMER_TAG => Ok(ServiceControlMessage::CancelTimer {
                correlation_id: read_u64_at(payload, &mut offset)?,
            }),
            other => Err(anyhow!("unknown service control tag {other}")),
        }
    }
}

/// Listener for service-control traffic; both sides share the channel and
/// ignore the directions they do not own.
pub trait ServiceControlListener {
    fn on_service_ack(
        &mut self,
        _log_position: u64,
        _leadership_term_id: i64,
        _service_id: u32,
        _action: ClusterAction,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_join_log(
        &mut self,
        _leadership_term_id: i64,
        _commit_position_id: i32,
        _log_session_id: i32,
        _log_stream_id: i32,
        _channel: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_schedule_timer(&mut self, _correlation_id: u64, _deadline_ms: u64) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_cancel_timer(&mut self, _correlation_id: u64) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ServiceControlAdapter {
    subscription: Subscription,
}

impl ServiceControlAdapter {
    pub fn new(subscription: Subscription) -> Self {
        Self { subscription }
    }

    pub fn poll(
        &self,
        listener: &mut impl ServiceControlListener,
        fragment_limit: usize,
    ) -> anyhow::Result<usize> {
        let mut error = None;
        let fragments = self.subscription.controlled_poll(
            &mut |_, payload| {
                let result = ServiceControlMessage::decode(payload)
                    .and_then(|message| Self::dispatch(listener, message));
                match result {
                    Ok(()) => ControlledAction::Continue,
                    Err(err) => {
                        error = Some(err);
                        ControlledAction::Abort
                    }
                }
            },
            fragment_limit,
        );
        match error {
            Some(err) => Err(err),
            None => Ok(fragments),
        }
    }

    fn dispatch(
        listener: &mut impl ServiceControlListener,
        message: ServiceControlMessage,
    ) -> anyhow::Result<()> {
        match message {
            ServiceControlMessage::JoinLog {
                leadership_term_id,
                commit_position_id,
                log_session_id,
                log_stream_id,
                channel,
            } => listener.on_join_log(
                leadership_term_id,
                commit_position_id,
                log_session_id,
                log_stream_id,
                &channel,
            ),
            ServiceControlMessage::ServiceAck {
                log_position,
                leadership_term_id,
                service_id,
                action,
            } => listener.on_service_ack(log_position, leadership_term_id, service_id, action),
            ServiceControlMessage::ScheduleTimer {
                correlation_id,
                deadline_ms,
            } => listener.on_schedule_timer(correlation_id, deadline_ms),
            ServiceControlMessage::CancelTimer { correlation_id } => {
                listener.on_cancel_timer(correlation_id)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServiceControlPublisher {
    publication: Publication,
}

impl ServiceControlPublisher {
    pub fn new(publication: Publication) -> Self {
        Self { publication }
    }

    pub fn join_log(
        &self,
        leadership_term_id: i64,
        commit_position_id: i32,
        log_session_id: i32,
        log_stream_id: i32,
        channel: &str,
    ) -> bool {
        let message = ServiceControlMessage::JoinLog {
            leadership_term_id,
            commit_position_id,
            log_session_id,
            log_stream_id,
            channel: channel.to_string(),
        };
        self.publication.offer(&message.encode()).is_some()
    }

    pub fn service_ack(
        &self,
        log_position: u64,
        leadership_term_id: i64,
        service_id: u32,
        action: ClusterAction,
    ) -> bool {
        let message = ServiceControlMessage::ServiceAck {
            log_position,
            leadership_term_id,
            service_id,
            action,
        };
        self.publication.offer(&message.encode()).is_some()
    }

    pub fn schedule_timer(&self, correlation_id: u64, deadline_ms: u64) -> bool {
        let message = ServiceControlMessage::ScheduleTimer {
            correlation_id,
            deadline_ms,
        };
        self.publication.offer(&message.encode()).is_some()
    }

    pub fn cancel_timer(&self, correlation_id: u64) -> bool {
        let message = ServiceControlMessage::CancelTimer { correlation_id };
        self.publication.offer(&message.encode()).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_log_round_trip() {
        let message = ServiceControlMessage::JoinLog {
            leadership_term_id: 3,
            commit_position_id: 2,
            log_session_id: 9,
            log_stream_id: 100,
            channel: "spy:mem://log?session-id=9".to_string(),
        };
        assert_eq!(
            ServiceControlMessage::decode(&message.encode()).unwrap(),
            message
        );
    }

    #[test]
    fn service_ack_round_trip() {
        let message = ServiceControlMessage::ServiceAck {
            log_position: 4096,
            leadership_term_id: 3,
            service_id: 0,
            action: ClusterAction::Snapshot,
        };
        assert_eq!(
            ServiceControlMessage::decode(&message.encode()).unwrap(),
            message
        );
    }
}
