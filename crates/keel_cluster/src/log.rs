//! Replicated log records, the leader-side appender, and the replay adapter.

use anyhow::anyhow;

use crate::bus::{ControlledAction, Image, Publication};
use crate::codec::{
    framed_len, put_bytes, put_i32, put_i64, put_str, put_u64, put_u8_tag, read_bytes_at,
    read_i32_at, read_i64_at, read_str_at, read_u64_at, read_u8_tag_at,
};
use crate::service::ClusterAction;
use crate::session::{CloseReason, ClusterSession, SessionId};

const SESSION_OPEN_TAG: u8 = 1;
const SESSION_MESSAGE_TAG: u8 = 2;
const SESSION_CLOSE_TAG: u8 = 3;
const TIMER_EVENT_TAG: u8 = 4;
const CLUSTER_ACTION_TAG: u8 = 5;

/// One record in the replicated log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEntry {
    SessionOpen {
        leadership_term_id: i64,
        correlation_id: u64,
        cluster_session_id: SessionId,
        timestamp_ms: u64,
        response_stream_id: i32,
        response_channel: String,
    },
    SessionMessage {
        leadership_term_id: i64,
        cluster_session_id: SessionId,
        correlation_id: u64,
        timestamp_ms: u64,
        payload: Vec<u8>,
    },
    SessionClose {
        leadership_term_id: i64,
        cluster_session_id: SessionId,
        timestamp_ms: u64,
        close_reason: CloseReason,
    },
    TimerEvent {
        leadership_term_id: i64,
        correlation_id: u64,
        timestamp_ms: u64,
    },
    ClusterAction {
        leadership_term_id: i64,
        log_position: u64,
        timestamp_ms: u64,
        action: ClusterAction,
    },
}

impl LogEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            LogEntry::SessionOpen {
                leadership_term_id,
                correlation_id,
                cluster_session_id,
                timestamp_ms,
                response_stream_id,
                response_channel,
            } => {
                put_u8_tag(&mut out, SESSION_OPEN_TAG);
                put_i64(&mut out, *leadership_term_id);
                put_u64(&mut out, *correlation_id);
                put_u64(&mut out, *cluster_session_id);
                put_u64(&mut out, *timestamp_ms);
                put_i32(&mut out, *response_stream_id);
                put_str(&mut out, response_channel);
            }
            LogEntry::SessionMessage {
                leadership_term_id,
                cluster_session_id,
                correlation_id,
                timestamp_ms,
                payload,
            } => {
                put_u8_tag(&mut out, SESSION_MESSAGE_TAG);
                put_i64(&mut out, *leadership_term_id);
                put_u64(&mut out, *cluster_session_id);
                put_u64(&mut out, *correlation_id);
                put_u64(&mut out, *timestamp_ms);
                put_bytes(&mut out, payload);
            }
            LogEntry::SessionClose {
                leadership_term_id,
                cluster_session_id,
                timestamp_ms,
                close_reason,
            } => {
                put_u8_tag(&mut out, SESSION_CLOSE_TAG);
                put_i64(&mut out, *leadership_term_id);
                put_u64(&mut out, *cluster_session_id);
                put_u64(&mut out, *timestamp_ms);
                put_u8_tag(&mut out, close_reason.code());
            }
            LogEntry::TimerEvent {
                leadership_term_id,
                correlation_id,
                timestamp_ms,
            } => {
                put_u8_tag(&mut out, TIMER_EVENT_TAG);
                put_i64(&mut out, *leadership_term_id);
                put_u64(&mut out, *correlation_id);
                put_u64(&mut out, *timestamp_ms);
            }
            LogEntry::ClusterAction {
                leadership_term_id,
                log_position,
                timestamp_ms,
                action,
            } => {
                put_u8_tag(&mut out, CLUSTER_ACTION_TAG);
                put_i64(&mut out, *leadership_term_id);
                put_u64(&mut out, *log_position);
                put_u64(&mut out, *timestamp_ms);
                put_u8_tag(&mut out, action.code());
            }
        }
        out
    }

    pub fn decode(payload: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0;
        let tag = read_u8_tag_at(payload, &mut offset)?;
        match tag {
            SESSION_OPEN_TAG => Ok(LogEntry::SessionOpen {
                leadership_term_id: read_i64_at(payload, &mut offset)?,
                correlation_id: read_u64_at(payload, &mut offset)?,
                cluster_session_id: read_u64_at(payload, &mut offset)?,
                timestamp_ms: read_u64_at(payload, &mut offset)?,
                response_stream_id: read_i32_at(payload, &mut offset)?,
                response_channel: read_str_at(payload, &mut offset)?,
            }),
            SESSION_MESSAGE_TAG => Ok(LogEntry::SessionMessage {
                leadership_term_id: read_i64_at(payload, &mut offset)?,
                cluster_session_id: read_u64_at(payload, &mut offset)?,
                correlation_id: read_u64_at(payload, &mut offset)?,
                timestamp_ms: read_u64_at(payload, &mut offset)?,
                payload: read_bytes_at(payload, &mut offset)?,
            }),
            SESSION_CLOSE_TAG => {
                let leadership_term_id = read_i64_at(payload, &mut offset)?;
                let cluster_session_id = read_u64_at(payload, &mut offset)?;
                let timestamp_ms = read_u64_at(payload, &mut offset)?;
                let code = read_u8_tag_at(payload, &mut offset)?;
                let close_reason = CloseReason::from_code(code)
                    .ok_or_else(|| anyhow!("unknown close reason {code}"))?;
                Ok(LogEntry::SessionClose {
                    leadership_term_id,
                    cluster_session_id,
                    timestamp_ms,
                    close_reason,
                })
            }
            TIMER_EVENT_TAG => Ok(LogEntry::TimerEvent {
                leadership_term_id: read_i64_at(payload, &mut offset)?,
                correlation_id: read_u64_at(payload, &mut offset)?,
                timestamp_ms: read_u64_at(payload, &mut offset)?,
            }),
            CLUSTER_ACTION_TAG => {
                let leadership_term_id = read_i64_at(payload, &mut offset)?;
                let log_position = read_u64_at(payload, &mut offset)?;
                let timestamp_ms = read_u64_at(payload, &mut offset)?;
                let code = read_u8_tag_at(payload, &mut offset)?;
                let action = ClusterAction::from_code(code)
                    .ok_or_else(|| anyhow!("unknown cluster action {code}"))?;
                Ok(LogEntry::ClusterAction {
                    leadership_term_id,
                    log_position,
                    timestamp_ms,
                    action,
                })
            }
            other => Err(anyhow!("unknown log record tag {other}")),
        }
    }
}

/// Leader-side writer of the replicated log.
///
/// Every append returns the resulting term position, or `None` under
/// back-pressure; callers retry on the next tick.
#[derive(Debug, Default)]
pub struct LogAppender {
    publication: Option<Publication>,
}

impl LogAppender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, publication: Publication) {
        self.publication = Some(publication);
    }

    pub fn disconnect(&mut self) {
        self.publication = None;
    }

    pub fn is_connected(&self) -> bool {
        self.publication.is_some()
    }

    pub fn position(&self) -> u64 {
        self.publication.as_ref().map_or(0, Publication::position)
    }

    fn append(&self, entry: &LogEntry) -> Option<u64> {
        self.publication.as_ref()?.offer(&entry.encode())
    }

    pub fn append_session_open(
        &self,
        session: &ClusterSession,
        leadership_term_id: i64,
        now_ms: u64,
    ) -> Option<u64> {
        self.append(&LogEntry::SessionOpen {
            leadership_term_id,
            correlation_id: session.last_correlation_id(),
            cluster_session_id: session.id(),
            timestamp_ms: now_ms,
            response_stream_id: session.response_stream_id(),
            response_channel: session.response_channel().to_string(),
        })
    }

    pub fn append_session_message(
        &self,
        cluster_session_id: SessionId,
        correlation_id: u64,
        payload: &[u8],
        leadership_term_id: i64,
        now_ms: u64,
    ) -> Option<u64> {
        self.append(&LogEntry::SessionMessage {
            leadership_term_id,
            cluster_session_id,
            correlation_id,
            timestamp_ms: now_ms,
            payload: payload.to_vec(),
        })
    }

    pub fn append_session_close(
        &self,
        session: &ClusterSession,
        close_reason: CloseReason,
        leadership_term_id: i64,
        now_ms: u64,
    ) -> bool {
        self.append(&LogEntry::SessionClose {
            leadership_term_id,
            cluster_session_id: session.id(),
            timestamp_ms: now_ms,
            close_reason,
        })
        .is_some()
    }

    pub fn append_timer_event(
        &self,
        correlation_id: u64,
        leadership_term_id: i64,
        now_ms: u64,
    ) -> bool {
        self.append(&LogEntry::TimerEvent {
            leadership_term_id,
            correlation_id,
            timestamp_ms: now_ms,
        })
        .is_some()
    }

    /// Append a cluster action stamped with the log position the record
    /// itself ends at.
    pub fn append_cluster_action(
        &self,
        action: ClusterAction,
        leadership_term_id: i64,
        base_log_position: u64,
        now_ms: u64,
    ) -> bool {
        let probe = LogEntry::ClusterAction {
            leadership_term_id,
            log_position: 0,
            timestamp_ms: now_ms,
            action,
        };
        let log_position =
            base_log_position + self.position() + framed_len(probe.encode().len()) as u64;
        self.append(&LogEntry::ClusterAction {
            leadership_term_id,
            log_position,
            timestamp_ms: now_ms,
            action,
        })
        .is_some()
    }
}

/// Handlers invoked as log records are replayed into the sequencer.
pub trait LogEventHandler {
    fn on_replay_session_open(
        &mut self,
        term_position: u64,
        correlation_id: u64,
        cluster_session_id: SessionId,
        timestamp_ms: u64,
        response_stream_id: i32,
        response_channel: &str,
    );

    fn on_replay_session_message(
        &mut self,
        cluster_session_id: SessionId,
        correlation_id: u64,
        timestamp_ms: u64,
        payload: &[u8],
    );

    fn on_replay_session_close(
        &mut self,
        cluster_session_id: SessionId,
        timestamp_ms: u64,
        close_reason: CloseReason,
    );

    fn on_replay_timer_event(&mut self, correlation_id: u64, timestamp_ms: u64);

    fn on_replay_cluster_action(
        &mut self,
        log_position: u64,
        leadership_term_id: i64,
        timestamp_ms: u64,
        action: ClusterAction,
    ) -> anyhow::Result<()>;
}

/// Follower/recovery-side consumer of the replicated log.
#[derive(Clone, Debug)]
pub struct LogAdapter {
    image: Image,
}

impl LogAdapter {
    pub fn new(image: Image) -> Self {
        Self { image }
    }

    pub fn position(&self) -> u64 {
        self.image.position()
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Poll up to `limit_position`, dispatching records to the handler.
    pub fn poll(
        &self,
        handler: &mut impl LogEventHandler,
        limit_position: u64,
        fragment_limit: usize,
    ) -> anyhow::Result<usize> {
        let mut error = None;
        let fragments = self.image.bounded_controlled_poll(
            &mut |end_position, payload| {
                let result = LogEntry::decode(payload)
                    .and_then(|entry| Self::dispatch(handler, end_position, entry));
                match result {
                    Ok(()) => ControlledAction::Continue,
                    Err(err) => {
                        error = Some(err);
                        ControlledAction::Abort
                    }
                }
            },
            limit_position,
            fragment_limit,
        );
        match error {
            Some(err) => Err(err),
            None => Ok(fragments),
        }
    }

    fn dispatch(
        handler: &mut impl LogEventHandler,
        end_position: u64,
        entry: LogEntry,
    ) -> anyhow::Result<()> {
        match entry {
            LogEntry::SessionOpen {
                correlation_id,
                cluster_session_id,
                timestamp_ms,
                response_stream_id,
                response_channel,
                ..
            } => {
                handler.on_replay_session_open(
                    end_position,
                    correlation_id,
                    cluster_session_id,
                    timestamp_ms,
                    response_stream_id,
                    &response_channel,
                );
                Ok(())
            }
            LogEntry::SessionMessage {
                cluster_session_id,
                correlation_id,
                timestamp_ms,
                payload,
                ..
            } => {
                handler.on_replay_session_message(
                    cluster_session_id,
                    correlation_id,
                    timestamp_ms,
                    &payload,
                );
                Ok(())
            }
            LogEntry::SessionClose {
                cluster_session_id,
                timestamp_ms,
                close_reason,
                ..
            } => {
                handler.on_replay_session_close(cluster_session_id, timestamp_ms, close_reason);
                Ok(())
            }
            LogEntry::TimerEvent {
                correlation_id,
                timestamp_ms,
                ..
            } => {
                handler.on_replay_timer_event(correlation_id, timestamp_ms);
                Ok(())
            }
            LogEntry::ClusterAction {
                leadership_term_id,
                log_position,
                timestamp_ms,
                action,
            } => handler.on_replay_cluster_action(
                log_position,
                leadership_term_id,
                timestamp_ms,
                action,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MediaBus;

    #[test]
    fn log_entry_round_trips() {
        let entries = vec![
            LogEntry::SessionOpen {
                leadership_term_id: 0,
                correlation_id: 1,
                cluster_session_id: 7,
                timestamp_ms: 1_000,
                response_stream_id: 102,
                response_channel: "mem://egress-7".to_string(),
            },
            LogEntry::SessionMessage {
                leadership_term_id: 0,
                cluster_session_id: 7,
                correlation_id: 2,
                timestamp_ms: 1_001,
                payload: b"order:42".to_vec(),
            },
            LogEntry::SessionClose {
                leadership_term_id: 0,
                cluster_session_id: 7,
                timestamp_ms: 1_002,
                close_reason: CloseReason::Timeout,
            },
            LogEntry::TimerEvent {
                leadership_term_id: 0,
                correlation_id: 9,
                timestamp_ms: 1_003,
            },
            LogEntry::ClusterAction {
                leadership_term_id: 0,
                log_position: 512,
                timestamp_ms: 1_004,
                action: ClusterAction::Snapshot,
            },
        ];
        for entry in entries {
            assert_eq!(LogEntry::decode(&entry.encode()).unwrap(), entry);
        }
    }

    #[test]
    fn cluster_action_position_is_the_record_end() {
        let bus = MediaBus::new();
        let publication = bus.add_publication("mem://log", 1).unwrap();
        let subscription = bus.add_subscription("mem://log", 1).unwrap();

        let mut appender = LogAppender::new();
        appender.connect(publication);
        assert!(appender.append_cluster_action(ClusterAction::Snapshot, 0, 1_024, 5));

        let image = subscription.images().pop().unwrap();
        let mut seen = None;
        image.controlled_poll(
            &mut |_, payload| {
                seen = Some(LogEntry::decode(payload).unwrap());
                ControlledAction::Continue
            },
            4,
        );
        match seen.unwrap() {
            LogEntry::ClusterAction { log_position, .. } => {
                assert_eq!(log_position, 1_024 + appender.position());
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn appender_without_publication_back_pressures() {
        let appender = LogAppender::new();
        assert_eq!(appender.position(), 0);
        assert!(!appender.append_timer_event(1, 0, 0));
    }
}
