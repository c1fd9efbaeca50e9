//! Peer-to-peer member-status RPCs: votes and position propagation.

use anyhow::anyhow;

use crate::bus::{ControlledAction, Publication, Subscription};
use crate::codec::{
    put_bool, put_i32, put_i64, put_u32, put_u64, put_u8_tag, read_bool_at, read_i32_at,
    read_i64_at, read_u32_at, read_u64_at, read_u8_tag_at,
};
use crate::member::MemberId;

const REQUEST_VOTE_TAG: u8 = 1;
const VOTE_TAG: u8 = 2;
const APPENDED_POSITION_TAG: u8 = 3;
const COMMIT_POSITION_TAG: u8 = 4;

/// Fixed-layout member-status message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberStatusMessage {
    RequestVote {
        candidate_term_id: i64,
        last_base_log_position: u64,
        last_term_position: u64,
        candidate_id: MemberId,
    },
    Vote {
        candidate_term_id: i64,
        last_base_log_position: u64,
        last_term_position: u64,
        candidate_id: MemberId,
        follower_id: MemberId,
        vote: bool,
    },
    AppendedPosition {
        term_position: u64,
        leadership_term_id: i64,
        follower_id: MemberId,
    },
    CommitPosition {
        term_position: u64,
        leadership_term_id: i64,
        leader_id: MemberId,
        log_session_id: i32,
    },
}

impl MemberStatusMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            MemberStatusMessage::RequestVote {
                candidate_term_id,
                last_base_log_position,
                last_term_position,
                candidate_id,
            } => {
                put_u8_tag(&mut out, REQUEST_VOTE_TAG);
                put_i64(&mut out, *candidate_term_id);
                put_u64(&mut out, *last_base_log_position);
                put_u64(&mut out, *last_term_position);
                put_u32(&mut out, *candidate_id);
            }
            MemberStatusMessage::Vote {
                candidate_term_id,
                last_base_log_position,
                last_term_position,
                candidate_id,
                follower_id,
                vote,
            } => {
                put_u8_tag(&mut out, VOTE_TAG);
                put_i64(&mut out, *candidate_term_id);
                put_u64(&mut out, *last_base_log_position);
                put_u64(&mut out, *last_term_position);
                put_u32(&mut out, *candidate_id);
                put_u32(&mut out, *follower_id);
                put_bool(&mut out, *vote);
            }
            MemberStatusMessage::AppendedPosition {
                term_position,
                leadership_term_id,
                follower_id,
            } => {
                put_u8_tag(&mut out, APPENDED_POSITION_TAG);
                put_u64(&mut out, *term_position);
                put_i64(&mut out, *leadership_term_id);
                put_u32(&mut out, *follower_id);
            }
            MemberStatusMessage::CommitPosition {
                term_position,
                leadership_term_id,
                leader_id,
                log_session_id,
            } => {
                put_u8_tag(&mut out, COMMIT_POSITION_TAG);
                put_u64(&mut out, *term_position);
                put_i64(&mut out, *leadership_term_id);
                put_u32(&mut out, *leader_id);
                put_i32(&mut out, *log_session_id);
            }
        }
        out
    }

    pub fn decode(payload: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0;
        let tag = read_u8_tag_at(payload, &mut offset)?;
        match tag {
            REQUEST_VOTE_TAG => Ok(MemberStatusMessage::RequestVote {
                candidate_term_id: read_i64_at(payload, &mut offset)?,
                last_base_log_position: read_u64_at(payload, &mut offset)?,
                last_term_position: read_u64_at(payload, &mut offset)?,
                candidate_id: read_u32_at(payload, &mut offset)?,
            }),
            VOTE_TAG => Ok(MemberStatusMessage::Vote {
                candidate_term_id: read_i64_at(payload, &mut offset)?,
                last_base_log_position: read_u64_at(payload, &mut offset)?,
                last_term_position: read_u64_at(payload, &mut offset)?,
                candidate_id: read_u32_at(payload, &mut offset)?,
                follower_id: read_u32_at(payload, &mut offset)?,
                vote: read_bool_at(payload, &mut offset)?,
            }),
            APPENDED_POSITION_TAG => Ok(MemberStatusMessage::AppendedPosition {
                term_position: read_u64_at(payload, &mut offset)?,
                leadership_term_id: read_i64_at(payload, &mut offset)?,
                follower_id: read_u32_at(payload, &mut offset)?,
            }),
            COMMIT_POSITION_TAG => Ok(MemberStatusMessage::CommitPosition {
                term_position: read_u64_at(payload, &mut offset)?,
                leadership_term_id: read_i64_at(payload, &mut offset)?,
                leader_id: read_u32_at(payload, &mut offset)?,
                log_session_id: read_i32_at(payload, &mut offset)?,
            }),
            other => Err(anyhow!("unknown member status tag {other}")),
        }
    }
}

/// Sequencer-side dispatch for member-status traffic.
pub trait MemberStatusListener {
    fn on_request_vote(
        &mut self,
        candidate_term_id: i64,
        last_base_log_position: u64,
        last_term_position: u64,
        candidate_id: MemberId,
    ) -> anyhow::Result<()>;

    fn on_vote(
        &mut self,
        candidate_term_id: i64,
        last_base_log_position: u64,
        last_term_position: u64,
        candidate_id: MemberId,
        follower_id: MemberId,
        vote: bool,
    ) -> anyhow::Result<()>;

    fn on_appended_position(
        &mut self,
        term_position: u64,
        leadership_term_id: i64,
        follower_id: MemberId,
    ) -> anyhow::Result<()>;

    fn on_commit_position(
        &mut self,
        term_position: u64,
        leadership_term_id: i64,
        leader_id: MemberId,
        log_session_id: i32,
    ) -> anyhow::Result<()>;
}

#[derive(Clone, Debug)]
pub struct MemberStatusAdapter {
    subscription: Subscription,
}

impl MemberStatusAdapter {
    pub fn new(subscription: Subscription) -> Self {
        Self { subscription }
    }

    pub fn poll(
        &self,
        listener: &mut impl MemberStatusListener,
        fragment_limit: usize,
    ) -> anyhow::Result<usize> {
        let mut error = None;
        let fragments = self.subscription.controlled_poll(
            &mut |_, payload| {
                let result = MemberStatusMessage::decode(payload)
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
        listener: &mut impl MemberStatusListener,
        message: MemberStatusMessage,
    ) -> anyhow::Result<()> {
        match message {
            MemberStatusMessage::RequestVote {
                candidate_term_id,
                last_base_log_position,
                last_term_position,
                candidate_id,
            } => listener.on_request_vote(
                candidate_term_id,
                last_base_log_position,
                last_term_position,
                candidate_id,
            ),
            MemberStatusMessage::Vote {
                candidate_term_id,
                last_base_log_position,
                last_term_position,
                candidate_id,
                follower_id,
                vote,
            } => listener.on_vote(
                candidate_term_id,
                last_base_log_position,
                last_term_position,
                candidate_id,
                follower_id,
                vote,
            ),
            MemberStatusMessage::AppendedPosition {
                term_position,
                leadership_term_id,
                follower_id,
            } => listener.on_appended_position(term_position, leadership_term_id, follower_id),
            MemberStatusMessage::CommitPosition {
                term_position,
                leadership_term_id,
                leader_id,
                log_session_id,
            } => listener.on_commit_position(
                term_position,
                leadership_term_id,
                leader_id,
                log_session_id,
            ),
        }
    }
}

/// Encodes and offers member-status messages to a peer publication.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemberStatusPublisher;

impl MemberStatusPublisher {
    pub fn request_vote(
        &self,
        publication: &Publication,
        candidate_term_id: i64,
        last_base_log_position: u64,
        last_term_position: u64,
        candidate_id: MemberId,
    ) -> bool {
        let message = MemberStatusMessage::RequestVote {
            candidate_term_id,
            last_base_log_position,
            last_term_position,
            candidate_id,
        };
        publication.offer(&message.encode()).is_some()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn vote(
        &self,
        publication: &Publication,
        candidate_term_id: i64,
        last_base_log_position: u64,
        last_term_position: u64,
        candidate_id: MemberId,
        follower_id: MemberId,
        vote: bool,
    ) -> bool {
        let message = MemberStatusMessage::Vote {
            candidate_term_id,
            last_base_log_position,
            last_term_position,
            candidate_id,
            follower_id,
            vote,
        };
        publication.offer(&message.encode()).is_some()
    }

    pub fn appended_position(
        &self,
        publication: &Publication,
        term_position: u64,
        leadership_term_id: i64,
        follower_id: MemberId,
    ) -> bool {
        let message = MemberStatusMessage::AppendedPosition {
            term_position,
            leadership_term_id,
            follower_id,
        };
        publication.offer(&message.encode()).is_some()
    }

    pub fn commit_position(
        &self,
        publication: &Publication,
        term_position: u64,
        leadership_term_id: i64,
        leader_id: MemberId,
        log_session_id: i32,
    ) -> bool {
        let message = MemberStatusMessage::CommitPosition {
            term_position,
            leadership_term_id,
            leader_id,
            log_session_id,
        };
        publication.offer(&message.encode()).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_round_trips() {
        let messages = vec![
            MemberStatusMessage::RequestVote {
                candidate_term_id: 2,
                last_base_log_position: 1_024,
                last_term_position: 512,
                candidate_id: 1,
            },
            MemberStatusMessage::Vote {
                candidate_term_id: 2,
                last_base_log_position: 1_024,
                last_term_position: 512,
                candidate_id: 1,
                follower_id: 0,
                vote: true,
            },
            MemberStatusMessage::AppendedPosition {
                term_position: 256,
                leadership_term_id: 2,
                follower_id: 2,
            },
            MemberStatusMessage::CommitPosition {
                term_position: 256,
                leadership_term_id: 2,
                leader_id: 1,
                log_session_id: 11,
            },
        ];
        for message in messages {
            assert_eq!(
                MemberStatusMessage::decode(&message.encode()).unwrap(),
                message
            );
        }
    }
}
