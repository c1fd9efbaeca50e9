//! Ingress messages from clients and their adapter.

use anyhow::anyhow;

use crate::bus::{ControlledAction, Subscription};
use crate::codec::{
    put_bytes, put_str, put_u64, put_u8_tag, read_bytes_at, read_str_at, read_u64_at,
    read_u8_tag_at,
};
use crate::counters::Counter;
use crate::session::SessionId;

/// Admin queries a client can issue over an open session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminQueryType {
    Endpoints,
    RecordingLog,
}

impl AdminQueryType {
    fn code(self) -> u8 {
        match self {
            AdminQueryType::Endpoints => 0,
            AdminQueryType::RecordingLog => 1,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AdminQueryType::Endpoints),
            1 => Some(AdminQueryType::RecordingLog),
            _ => None,
        }
    }
}

const SESSION_CONNECT_TAG: u8 = 1;
const SESSION_CLOSE_TAG: u8 = 2;
const SESSION_MESSAGE_TAG: u8 = 3;
const KEEP_ALIVE_TAG: u8 = 4;
const CHALLENGE_RESPONSE_TAG: u8 = 5;
const ADMIN_QUERY_TAG: u8 = 6;

/// Decoded client request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngressMessage {
    SessionConnect {
        correlation_id: u64,
        response_stream_id: i32,
        response_channel: String,
        credentials: Vec<u8>,
    },
    SessionClose {
        cluster_session_id: SessionId,
    },
    SessionMessage {
        cluster_session_id: SessionId,
        correlation_id: u64,
        payload: Vec<u8>,
    },
    KeepAlive {
        cluster_session_id: SessionId,
    },
    ChallengeResponse {
        correlation_id: u64,
        cluster_session_id: SessionId,
        credentials: Vec<u8>,
    },
    AdminQuery {
        correlation_id: u64,
        cluster_session_id: SessionId,
        query_type: AdminQueryType,
    },
}

impl IngressMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            IngressMessage::SessionConnect {
                correlation_id,
                response_stream_id,
                response_channel,
                credentials,
            } => {
                put_u8_tag(&mut out, SESSION_CONNECT_TAG);
                put_u64(&mut out, *correlation_id);
                crate::codec::put_i32(&mut out, *response_stream_id);
                put_str(&mut out, response_channel);
                put_bytes(&mut out, credentials);
            }
            IngressMessage::SessionClose { cluster_session_id } => {
                put_u8_tag(&mut out, SESSION_CLOSE_TAG);
                put_u64(&mut out, *cluster_session_id);
            }
            IngressMessage::SessionMessage {
                cluster_session_id,
                correlation_id,
                payload,
            } => {
                put_u8_tag(&mut out, SESSION_MESSAGE_TAG);
                put_u64(&mut out, *cluster_session_id);
                put_u64(&mut out, *correlation_id);
                put_bytes(&mut out, payload);
            }
            IngressMessage::KeepAlive { cluster_session_id } => {
                put_u8_tag(&mut out, KEEP_ALIVE_TAG);
                put_u64(&mut out, *cluster_session_id);
            }
            IngressMessage::ChallengeResponse {
                correlation_id,
                cluster_session_id,
                credentials,
            } => {
                put_u8_tag(&mut out, CHALLENGE_RESPONSE_TAG);
                put_u64(&mut out, *correlation_id);
                put_u64(&mut out, *cluster_session_id);
                put_bytes(&mut out, credentials);
            }
            IngressMessage::AdminQuery {
                correlation_id,
                cluster_session_id,
                query_type,
            } => {
                put_u8_tag(&mut out, ADMIN_QUERY_TAG);
                put_u64(&mut out, *correlation_id);
                put_u64(&mut out, *cluster_session_id);
                put_u8_tag(&mut out, query_type.code());
            }
        }
        out
    }

    pub fn decode(payload: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0;
        let tag = read_u8_tag_at(payload, &mut offset)?;
        match tag {
            SESSION_CONNECT_TAG => Ok(IngressMessage::SessionConnect {
                correlation_id: read_u64_at(payload, &mut offset)?,
                response_stream_id: crate::codec::read_i32_at(payload, &mut offset)?,
                response_channel: read_str_at(payload, &mut offset)?,
                credentials: read_bytes_at(payload, &mut offset)?,
            }),
            SESSION_CLOSE_TAG => Ok(IngressMessage::SessionClose {
                cluster_session_id: read_u64_at(payload, &mut offset)?,
            }),
            SESSION_MESSAGE_TAG => Ok(IngressMessage::SessionMessage {
                cluster_session_id: read_u64_at(payload, &mut offset)?,
                correlation_id: read_u64_at(payload, &mut offset)?,
                payload: read_bytes_at(payload, &mut offset)?,
            }),
            KEEP_ALIVE_TAG => Ok(IngressMessage::KeepAlive {
                cluster_session_id: read_u64_at(payload, &mut offset)?,
            }),
            CHALLENGE_RESPONSE_TAG => Ok(IngressMessage::ChallengeResponse {
                correlation_id: read_u64_at(payload, &mut offset)?,
                cluster_session_id: read_u64_at(payload, &mut offset)?,
                credentials: read_bytes_at(payload, &mut offset)?,
            }),
            ADMIN_QUERY_TAG => {
                let correlation_id = read_u64_at(payload, &mut offset)?;
                let cluster_session_id = read_u64_at(payload, &mut offset)?;
                let code = read_u8_tag_at(payload, &mut offset)?;
                let query_type = AdminQueryType::from_code(code)
                    .ok_or_else(|| anyhow!("unknown admin query type {code}"))?;
                Ok(IngressMessage::AdminQuery {
                    correlation_id,
                    cluster_session_id,
                    query_type,
                })
            }
            other => Err(anyhow!("unknown ingress message tag {other}")),
        }
    }
}

/// Sequencer-side handler for decoded ingress.
pub trait IngressHandler {
    fn on_session_connect(
        &mut self,
        correlation_id: u64,
        response_stream_id: i32,
        response_channel: &str,
        credentials: &[u8],
    );

    fn on_session_close(&mut self, cluster_session_id: SessionId);

    /// ABORT leaves the message queued so the next poll re-presents it.
    fn on_session_message(
        &mut self,
        payload: &[u8],
        cluster_session_id: SessionId,
        correlation_id: u64,
    ) -> ControlledAction;

    fn on_keep_alive(&mut self, cluster_session_id: SessionId);

    fn on_challenge_response(
        &mut self,
        correlation_id: u64,
        cluster_session_id: SessionId,
        credentials: &[u8],
    );

    fn on_admin_query(
        &mut self,
        correlation_id: u64,
        cluster_session_id: SessionId,
        query_type: AdminQueryType,
    );
}

/// Polls the ingress subscription and dispatches to the sequencer.
#[derive(Clone, Debug)]
pub struct IngressAdapter {
    subscription: Subscription,
    invalid_requests: Counter,
}

impl IngressAdapter {
    pub fn new(subscription: Subscription, invalid_requests: Counter) -> Self {
        Self {
            subscription,
            invalid_requests,
        }
    }

    pub fn poll(&self, handler: &mut impl IngressHandler, fragment_limit: usize) -> usize {
        self.subscription.controlled_poll(
            &mut |_, payload| match IngressMessage::decode(payload) {
                Ok(message) => Self::dispatch(handler, message),
                Err(err) => {
                    tracing::warn!(error = ?err, "dropping invalid ingress message");
                    self.invalid_requests.increment_ordered();
                    ControlledAction::Continue
                }
            },
            fragment_limit,
        )
    }

    fn dispatch(handler: &mut impl IngressHandler, message: IngressMessage) -> ControlledAction {
        match message {
            IngressMessage::SessionConnect {
                correlation_id,
                response_stream_id,
                response_channel,
                credentials,
            } => {
                handler.on_session_connect(
                    correlation_id,
                    response_stream_id,
                    &response_channel,
                    &credentials,
                );
                ControlledAction::Continue
            }
            IngressMessage::SessionClose { cluster_session_id } => {
                handler.on_session_close(cluster_session_id);
                ControlledAction::Continue
            }
            IngressMessage::SessionMessage {
                cluster_session_id,
                correlation_id,
                payload,
            } => handler.on_session_message(&payload, cluster_session_id, correlation_id),
            IngressMessage::KeepAlive { cluster_session_id } => {
                handler.on_keep_alive(cluster_session_id);
                ControlledAction::Continue
            }
            IngressMessage::ChallengeResponse {
                correlation_id,
                cluster_session_id,
                credentials,
            } => {
                handler.on_challenge_response(correlation_id, cluster_session_id, &credentials);
                ControlledAction::Continue
            }
            IngressMessage::AdminQuery {
                correlation_id,
                cluster_session_id,
                query_type,
            } => {
                handler.on_admin_query(correlation_id, cluster_session_id, query_type);
                ControlledAction::Continue
            }
        }
    }
}
