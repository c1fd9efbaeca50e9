//! Egress messages from the cluster to clients.

use anyhow::anyhow;

use crate::codec::{
    put_bytes, put_str, put_u64, put_u8_tag, read_bytes_at, read_str_at, read_u64_at,
};
use crate::session::{ClusterSession, SessionId};

/// Outcome code carried by a session event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventCode {
    Ok,
    Error,
    AuthenticationRejected,
}

impl EventCode {
    fn code(self) -> u8 {
        match self {
            EventCode::Ok => 0,
            EventCode::Error => 1,
            EventCode::AuthenticationRejected => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(EventCode::Ok),
            1 => Some(EventCode::Error),
            2 => Some(EventCode::AuthenticationRejected),
            _ => None,
        }
    }
}

const EVENT_TAG: u8 = 1;
const CHALLENGE_TAG: u8 = 2;

/// Decoded egress message, as seen by a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EgressMessage {
    Event {
        cluster_session_id: SessionId,
        correlation_id: u64,
        code: EventCode,
        detail: String,
    },
    Challenge {
        correlation_id: u64,
        cluster_session_id: SessionId,
        challenge_data: Vec<u8>,
    },
}

impl EgressMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            EgressMessage::Event {
                cluster_session_id,
                correlation_id,
                code,
                detail,
            } => {
                put_u8_tag(&mut out, EVENT_TAG);
                put_u64(&mut out, *cluster_session_id);
                put_u64(&mut out, *correlation_id);
                put_u8_tag(&mut out, code.code());
                put_str(&mut out, detail);
            }
            EgressMessage::Challenge {
                correlation_id,
                cluster_session_id,
                challenge_data,
            } => {
                put_u8_tag(&mut out, CHALLENGE_TAG);
                put_u64(&mut out, *correlation_id);
                put_u64(&mut out, *cluster_session_id);
                put_bytes(&mut out, challenge_data);
            }
        }
        out
    }

    pub fn decode(payload: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0;
        let tag = crate::codec::read_u8_tag_at(payload, &mut offset)?;
        match tag {
            EVENT_TAG => {
                let cluster_session_id = read_u64_at(payload, &mut offset)?;
                let correlation_id = read_u64_at(payload, &mut offset)?;
                let code = crate::codec::read_u8_tag_at(payload, &mut offset)?;
                let code = EventCode::from_code(code)
                    .ok_or_else(|| anyhow!("unknown egress event code {code}"))?;
                let detail = read_str_at(payload, &mut offset)?;
                Ok(EgressMessage::Event {
                    cluster_session_id,
                    correlation_id,
                    code,
                    detail,
                })
            }
            CHALLENGE_TAG => {
                let correlation_id = read_u64_at(payload, &mut offset)?;
                let cluster_session_id = read_u64_at(payload, &mut offset)?;
                let challenge_data = read_bytes_at(payload, &mut offset)?;
                Ok(EgressMessage::Challenge {
                    correlation_id,
                    cluster_session_id,
                    challenge_data,
                })
            }
            other => Err(anyhow!("unknown egress message tag {other}")),
        }
    }
}

/// Sends egress messages over a session's response publication.
///
/// Every send returns whether the message went out; callers retry on the
/// next tick rather than buffering.
#[derive(Clone, Copy, Debug, Default)]
pub struct EgressPublisher;

impl EgressPublisher {
    pub fn send_event(&self, session: &ClusterSession, code: EventCode, detail: &str) -> bool {
        let message = EgressMessage::Event {
            cluster_session_id: session.id(),
            correlation_id: session.last_correlation_id(),
            code,
            detail: detail.to_string(),
        };
        self.send(session, &message)
    }

    pub fn send_challenge(&self, session: &ClusterSession, challenge_data: &[u8]) -> bool {
        let message = EgressMessage::Challenge {
            correlation_id: session.last_correlation_id(),
            cluster_session_id: session.id(),
            challenge_data: challenge_data.to_vec(),
        };
        self.send(session, &message)
    }

    fn send(&self, session: &ClusterSession, message: &EgressMessage) -> bool {
        match session.response_publication() {
            Some(publication) => publication.offer(&message.encode()).is_some(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trip() {
        let message = EgressMessage::Event {
            cluster_session_id: 9,
            correlation_id: 3,
            code: EventCode::AuthenticationRejected,
            detail: "session rejected due to authentication".to_string(),
        };
        assert_eq!(EgressMessage::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn challenge_round_trip() {
        let message = EgressMessage::Challenge {
            correlation_id: 11,
            cluster_session_id: 9,
            challenge_data: b"nonce".to_vec(),
        };
        assert_eq!(EgressMessage::decode(&message.encode()).unwrap(), message);
    }
}
