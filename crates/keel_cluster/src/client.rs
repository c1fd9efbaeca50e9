//! Minimal cluster client: encodes ingress, decodes egress.
//!
//! Non-blocking by design; callers pump `poll` alongside the cluster and
//! retry offers that back-pressure.

use crate::bus::{ControlledAction, MediaBus, Publication, Subscription};
use crate::egress::{EgressMessage, EventCode};
use crate::ingress::{AdminQueryType, IngressMessage};
use crate::session::SessionId;

/// Client-visible cluster events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    SessionOpened {
        session_id: SessionId,
        detail: String,
    },
    Ok {
        detail: String,
    },
    Error {
        detail: String,
    },
    AuthenticationRejected {
        detail: String,
    },
    Challenged {
        session_id: SessionId,
        challenge_data: Vec<u8>,
    },
}

/// One client connection to the cluster ingress.
#[derive(Debug)]
pub struct ClusterClient {
    ingress_publication: Publication,
    egress_subscription: Subscription,
    response_channel: String,
    response_stream_id: i32,
    session_id: Option<SessionId>,
    next_correlation_id: u64,
}

impl ClusterClient {
    pub fn connect(
        bus: &MediaBus,
        ingress_channel: &str,
        ingress_stream_id: i32,
        response_channel: &str,
        response_stream_id: i32,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            ingress_publication: bus.add_publication(ingress_channel, ingress_stream_id)?,
            egress_subscription: bus.add_subscription(response_channel, response_stream_id)?,
            response_channel: response_channel.to_string(),
            response_stream_id,
            session_id: None,
            next_correlation_id: 1,
        })
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    fn next_correlation(&mut self) -> u64 {
        let correlation_id = self.next_correlation_id;
        self.next_correlation_id += 1;
        correlation_id
    }

    fn offer(&self, message: &IngressMessage) -> bool {
        self.ingress_publication.offer(&message.encode()).is_some()
    }

    /// Ask the cluster for a session; the answer arrives via `poll`.
    pub fn send_connect_request(&mut self, credentials: &[u8]) -> bool {
        let message = IngressMessage::SessionConnect {
            correlation_id: self.next_correlation(),
            response_stream_id: self.response_stream_id,
            response_channel: self.response_channel.clone(),
            credentials: credentials.to_vec(),
        };
        self.offer(&message)
    }

    pub fn send_challenge_response(&mut self, session_id: SessionId, credentials: &[u8]) -> bool {
        let message = IngressMessage::ChallengeResponse {
            correlation_id: self.next_correlation(),
            cluster_session_id: session_id,
            credentials: credentials.to_vec(),
        };
        self.offer(&message)
    }

    /// Offer one session message; false means retry next tick.
    pub fn send_message(&mut self, payload: &[u8]) -> bool {
        let Some(session_id) = self.session_id else {
            return false;
        };
        let message = IngressMessage::SessionMessage {
            cluster_session_id: session_id,
            correlation_id: self.next_correlation(),
            payload: payload.to_vec(),
        };
        self.offer(&message)
    }

    pub fn send_keep_alive(&mut self) -> bool {
        let Some(session_id) = self.session_id else {
            return false;
        };
        self.offer(&IngressMessage::KeepAlive {
            cluster_session_id: session_id,
        })
    }

    pub fn send_admin_query(&mut self, query_type: AdminQueryType) -> bool {
        let Some(session_id) = self.session_id else {
            return false;
        };
        let message = IngressMessage::AdminQuery {
            correlation_id: self.next_correlation(),
            cluster_session_id: session_id,
            query_type,
        };
        self.offer(&message)
    }

    pub fn send_close_request(&mut self) -> bool {
        let Some(session_id) = self.session_id else {
            return false;
        };
        self.offer(&IngressMessage::SessionClose {
            cluster_session_id: session_id,
        })
    }

    /// Drain pending egress into client events.
    pub fn poll(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        let session_known = self.session_id.is_some();
        let mut opened = None;
        self.egress_subscription.controlled_poll(
            &mut |_, payload| {
                match EgressMessage::decode(payload) {
                    Ok(EgressMessage::Event {
                        cluster_session_id,
                        code,
                        detail,
                        ..
                    }) => {
                        let event = match code {
                            EventCode::Ok if !session_known && opened.is_none() => {
                                opened = Some(cluster_session_id);
                                ClientEvent::SessionOpened {
                                    session_id: cluster_session_id,
                                    detail,
                                }
                            }
                            EventCode::Ok => ClientEvent::Ok { detail },
                            EventCode::Error => ClientEvent::Error { detail },
                            EventCode::AuthenticationRejected => {
                                ClientEvent::AuthenticationRejected { detail }
                            }
                        };
                        events.push(event);
                    }
                    Ok(EgressMessage::Challenge {
                        cluster_session_id,
                        challenge_data,
                        ..
                    }) => {
                        events.push(ClientEvent::Challenged {
                            session_id: cluster_session_id,
                            challenge_data,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = ?err, "dropping undecodable egress message");
                    }
                }
                ControlledAction::Continue
            },
            64,
        );
        if let Some(session_id) = opened {
            self.session_id = Some(session_id);
        }
        events
    }
}
