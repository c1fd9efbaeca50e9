//! Snapshot stream written by the sequencer and replayed during recovery.

use anyhow::{anyhow, ensure};

use crate::bus::{ControlledAction, Image, Publication};
use crate::codec::{
    put_i32, put_i64, put_str, put_u32, put_u64, put_u8_tag, read_i32_at, read_i64_at,
    read_str_at, read_u32_at, read_u64_at, read_u8_tag_at,
};
use crate::session::{ClusterSession, SessionId};

/// Type id carried by the snapshot markers.
pub const SNAPSHOT_TYPE_ID: u32 = 2;

const MARKER_BEGIN_TAG: u8 = 1;
const MARKER_END_TAG: u8 = 2;
const SESSION_TAG: u8 = 3;
const TIMER_TAG: u8 = 4;
const SEQUENCER_STATE_TAG: u8 = 5;

/// One record of the snapshot stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotRecord {
    MarkerBegin {
        type_id: u32,
        log_position: u64,
        leadership_term_id: i64,
        index: u32,
    },
    MarkerEnd {
        type_id: u32,
        log_position: u64,
        leadership_term_id: i64,
        index: u32,
    },
    Session {
        cluster_session_id: SessionId,
        correlation_id: u64,
        open_term_position: u64,
        time_of_last_activity_ms: u64,
        response_stream_id: i32,
        response_channel: String,
    },
    Timer {
        correlation_id: u64,
        deadline_ms: u64,
    },
    SequencerState {
        next_session_id: SessionId,
    },
}

impl SnapshotRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            SnapshotRecord::MarkerBegin {
                type_id,
                log_position,
                leadership_term_id,
                index,
            } => {
                put_u8_tag(&mut out, MARKER_BEGIN_TAG);
                put_u32(&mut out, *type_id);
                put_u64(&mut out, *log_position);
                put_i64(&mut out, *leadership_term_id);
                put_u32(&mut out, *index);
            }
            SnapshotRecord::MarkerEnd {
                type_id,
                log_position,
                leadership_term_id,
                index,
            } => {
                put_u8_tag(&mut out, MARKER_END_TAG);
                put_u32(&mut out, *type_id);
                put_u64(&mut out, *log_position);
                put_i64(&mut out, *leadership_term_id);
                put_u32(&mut out, *index);
            }
            SnapshotRecord::Session {
                cluster_session_id,
                correlation_id,
                open_term_position,
                time_of_last_activity_ms,
                response_stream_id,
                response_channel,
            } => {
                put_u8_tag(&mut out, SESSION_TAG);
                put_u64(&mut out, *cluster_session_id);
                put_u64(&mut out, *correlation_id);
                put_u64(&mut out, *open_term_position);
                put_u64(&mut out, *time_of_last_activity_ms);
                put_i32(&mut out, *response_stream_id);
                put_str(&mut out, response_channel);
            }
            SnapshotRecord::Timer {
                correlation_id,
                deadline_ms,
            } => {
                put_u8_tag(&mut out, TIMER_TAG);
                put_u64(&mut out, *correlation_id);
                put_u64(&mut out, *deadline_ms);
            }
            SnapshotRecord::SequencerState { next_session_id } => {
                put_u8_tag(&mut out, SEQUENCER_STATE_TAG);
                put_u64(&mut out, *next_session_id);
            }
        }
        out
    }

    pub fn decode(payload: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0;
        let tag = read_u8_tag_at(payload, &mut offset)?;
        match tag {
            MARKER_BEGIN_TAG | MARKER_END_TAG => {
                let type_id = read_u32_at(payload, &mut offset)?;
                let log_position = read_u64_at(payload, &mut offset)?;
                let leadership_term_id = read_i64_at(payload, &mut offset)?;
                let index = read_u32_at(payload, &mut offset)?;
                if tag == MARKER_BEGIN_TAG {
                    Ok(SnapshotRecord::MarkerBegin {
                        type_id,
                        log_position,
                        leadership_term_id,
                        index,
                    })
                } else {
                    Ok(SnapshotRecord::MarkerEnd {
                        type_id,
                        log_position,
                        leadership_term_id,
                        index,
                    })
                }
            }
            SESSION_TAG => Ok(SnapshotRecord::Session {
                cluster_session_id: read_u64_at(payload, &mut offset)?,
                correlation_id: read_u64_at(payload, &mut offset)?,
                open_term_position: read_u64_at(payload, &mut offset)?,
                time_of_last_activity_ms: read_u64_at(payload, &mut offset)?,
                response_stream_id: read_i32_at(payload, &mut offset)?,
                response_channel: read_str_at(payload, &mut offset)?,
            }),
            TIMER_TAG => Ok(SnapshotRecord::Timer {
                correlation_id: read_u64_at(payload, &mut offset)?,
                deadline_ms: read_u64_at(payload, &mut offset)?,
            }),
            SEQUENCER_STATE_TAG => Ok(SnapshotRecord::SequencerState {
                next_session_id: read_u64_at(payload, &mut offset)?,
            }),
            other => Err(anyhow!("unknown snapshot record tag {other}")),
        }
    }
}

/// Writes the snapshot stream onto a recorded publication.
///
/// Every emit returns whether the record went out; the agent retries
/// through its idle strategy.
#[derive(Debug)]
pub struct SnapshotTaker {
    publication: Publication,
}

impl SnapshotTaker {
    pub fn new(publication: Publication) -> Self {
        Self { publication }
    }

    fn offer(&self, record: &SnapshotRecord) -> bool {
        self.publication.offer(&record.encode()).is_some()
    }

    pub fn mark_begin(&self, log_position: u64, leadership_term_id: i64, index: u32) -> bool {
        self.offer(&SnapshotRecord::MarkerBegin {
            type_id: SNAPSHOT_TYPE_ID,
            log_position,
            leadership_term_id,
            index,
        })
    }

    pub fn mark_end(&self, log_position: u64, leadership_term_id: i64, index: u32) -> bool {
        self.offer(&SnapshotRecord::MarkerEnd {
            type_id: SNAPSHOT_TYPE_ID,
            log_position,
            leadership_term_id,
            index,
        })
    }

    pub fn snapshot_session(&self, session: &ClusterSession) -> bool {
        self.offer(&SnapshotRecord::Session {
            cluster_session_id: session.id(),
            correlation_id: session.last_correlation_id(),
            open_term_position: session.open_term_position().unwrap_or(0),
            time_of_last_activity_ms: session.time_of_last_activity_ms(),
            response_stream_id: session.response_stream_id(),
            response_channel: session.response_channel().to_string(),
        })
    }

    pub fn snapshot_timer(&self, correlation_id: u64, deadline_ms: u64) -> bool {
        self.offer(&SnapshotRecord::Timer {
            correlation_id,
            deadline_ms,
        })
    }

    pub fn sequencer_state(&self, next_session_id: SessionId) -> bool {
        self.offer(&SnapshotRecord::SequencerState { next_session_id })
    }
}

/// Sequencer-side sink for a loaded snapshot.
pub trait SnapshotHandler {
    fn on_reload_state(&mut self, next_session_id: SessionId);

    #[allow(clippy::too_many_arguments)]
    fn on_loaded_session(
        &mut self,
        cluster_session_id: SessionId,
        correlation_id: u64,
        open_term_position: u64,
        time_of_last_activity_ms: u64,
        response_stream_id: i32,
        response_channel: &str,
    );

    fn on_loaded_timer(&mut self, correlation_id: u64, deadline_ms: u64);
}

/// Replays a snapshot image until the end marker.
#[derive(Debug)]
pub struct SnapshotLoader {
    image: Image,
    in_snapshot: bool,
    done: bool,
}

impl SnapshotLoader {
    pub fn new(image: Image) -> Self {
        Self {
            image,
            in_snapshot: false,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn poll(&mut self, handler: &mut impl SnapshotHandler) -> anyhow::Result<usize> {
        let mut error = None;
        let in_snapshot = &mut self.in_snapshot;
        let done = &mut self.done;
        let fragments = self.image.controlled_poll(
            &mut |_, payload| {
                if *done {
                    return ControlledAction::Abort;
                }
                match Self::dispatch(handler, in_snapshot, done, payload) {
                    Ok(()) => ControlledAction::Continue,
                    Err(err) => {
                        error = Some(err);
                        ControlledAction::Abort
                    }
                }
            },
            usize::MAX,
        );
        match error {
            Some(err) => Err(err),
            None => Ok(fragments),
        }
    }

    fn dispatch(
        handler: &mut impl SnapshotHandler,
        in_snapshot: &mut bool,
        done: &mut bool,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        match SnapshotRecord::decode(payload)? {
            SnapshotRecord::MarkerBegin { type_id, .. } => {
                ensure!(
                    type_id == SNAPSHOT_TYPE_ID,
                    "snapshot type id {type_id} not supported"
                );
                ensure!(!*in_snapshot, "nested snapshot begin marker");
                *in_snapshot = true;
                Ok(())
            }
            SnapshotRecord::MarkerEnd { type_id, .. } => {
                ensure!(
                    type_id == SNAPSHOT_TYPE_ID,
                    "snapshot type id {type_id} not supported"
                );
                ensure!(*in_snapshot, "snapshot end marker before begin");
                *done = true;
                Ok(())
            }
            SnapshotRecord::Session {
                cluster_session_id,
                correlation_id,
                open_term_position,
                time_of_last_activity_ms,
                response_stream_id,
                response_channel,
            } => {
                ensure!(*in_snapshot, "session record outside snapshot markers");
                handler.on_loaded_session(
                    cluster_session_id,
                    correlation_id,
                    open_term_position,
                    time_of_last_activity_ms,
                    response_stream_id,
                    &response_channel,
                );
                Ok(())
            }
            SnapshotRecord::Timer {
                correlation_id,
                deadline_ms,
            } => {
                ensure!(*in_snapshot, "timer record outside snapshot markers");
                handler.on_loaded_timer(correlation_id, deadline_ms);
                Ok(())
            }
            SnapshotRecord::SequencerState { next_session_id } => {
                ensure!(*in_snapshot, "state record outside snapshot markers");
                handler.on_reload_state(next_session_id);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MediaBus;

    #[derive(Default)]
    struct Collected {
        next_session_id: SessionId,
        sessions: Vec<(SessionId, u64)>,
        timers: Vec<(u64, u64)>,
    }

    impl SnapshotHandler for Collected {
        fn on_reload_state(&mut self, next_session_id: SessionId) {
            self.next_session_id = next_session_id;
        }

        fn on_loaded_session(
            &mut self,
            cluster_session_id: SessionId,
            _correlation_id: u64,
            open_term_position: u64,
            _time_of_last_activity_ms: u64,
            _response_stream_id: i32,
            _response_channel: &str,
        ) {
            self.sessions.push((cluster_session_id, open_term_position));
        }

        fn on_loaded_timer(&mut self, correlation_id: u64, deadline_ms: u64) {
            self.timers.push((correlation_id, deadline_ms));
        }
    }

    #[test]
    fn loads_what_the_taker_wrote() {
        let bus = MediaBus::new();
        let publication = bus.add_publication("mem://snapshot", 30).unwrap();
        let subscription = bus.add_subscription("mem://snapshot", 30).unwrap();

        let taker = SnapshotTaker::new(publication);
        assert!(taker.mark_begin(1_024, 3, 0));
        let mut session = ClusterSession::new(7, 102, "mem://egress-7");
        session.open(512);
        session.last_activity(9_000, 4);
        assert!(taker.snapshot_session(&session));
        assert!(taker.snapshot_timer(11, 10_000));
        assert!(taker.sequencer_state(8));
        assert!(taker.mark_end(1_024, 3, 0));

        let image = subscription.images().pop().unwrap();
        let mut loader = SnapshotLoader::new(image);
        let mut collected = Collected::default();
        while !loader.is_done() {
            loader.poll(&mut collected).unwrap();
        }
        assert_eq!(collected.next_session_id, 8);
        assert_eq!(collected.sessions, vec![(7, 512)]);
        assert_eq!(collected.timers, vec![(11, 10_000)]);
    }

    #[test]
    fn rejects_records_outside_markers() {
        let bus = MediaBus::new();
        let publication = bus.add_publication("mem://snapshot", 30).unwrap();
        let subscription = bus.add_subscription("mem://snapshot", 30).unwrap();

        let taker = SnapshotTaker::new(publication);
        assert!(taker.sequencer_state(8));

        let image = subscription.images().pop().unwrap();
        let mut loader = SnapshotLoader::new(image);
        assert!(loader.poll(&mut Collected::default()).is_err());
    }
}
