//! Session authentication capability and its session-proxy surface.

use std::collections::HashMap;

use crate::egress::{EgressPublisher, EventCode};
use crate::session::{ClusterSession, SessionId, SessionState};

/// Narrow view of a pending session handed to the authenticator.
///
/// The proxy owns the only state transitions an authenticator may drive:
/// authenticate, challenge, or reject.
pub struct SessionProxy<'a> {
    session: &'a mut ClusterSession,
    egress_publisher: &'a EgressPublisher,
    member_endpoints_detail: &'a str,
}

impl<'a> SessionProxy<'a> {
    pub fn new(
        session: &'a mut ClusterSession,
        egress_publisher: &'a EgressPublisher,
        member_endpoints_detail: &'a str,
    ) -> Self {
        Self {
            session,
            egress_publisher,
            member_endpoints_detail,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Accept the session; sends the OK event carrying the member endpoints.
    pub fn authenticate(&mut self) -> bool {
        if self
            .egress_publisher
            .send_event(self.session, EventCode::Ok, self.member_endpoints_detail)
        {
            self.session.set_state(SessionState::Authenticated);
            return true;
        }
        false
    }

    /// Push a challenge to the client; the session ping-pongs to CHALLENGED.
    pub fn challenge(&mut self, challenge_data: &[u8]) -> bool {
        if self
            .egress_publisher
            .send_challenge(self.session, challenge_data)
        {
            self.session.set_state(SessionState::Challenged);
            return true;
        }
        false
    }

    /// Reject the session; the rejected pump reports it to the client.
    pub fn reject(&mut self) {
        self.session.set_state(SessionState::Rejected);
    }
}

/// Credential verification capability, chosen at construction.
pub trait Authenticator: Send {
    fn on_connect_request(&mut self, session_id: SessionId, credentials: &[u8], now_ms: u64);

    fn on_challenge_response(&mut self, session_id: SessionId, credentials: &[u8], now_ms: u64);

    fn on_process_connected_session(&mut self, proxy: &mut SessionProxy<'_>, now_ms: u64);

    fn on_process_challenged_session(&mut self, proxy: &mut SessionProxy<'_>, now_ms: u64);
}

/// Accepts every session without inspecting credentials.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAllAuthenticator;

impl Authenticator for AllowAllAuthenticator {
    fn on_connect_request(&mut self, _session_id: SessionId, _credentials: &[u8], _now_ms: u64) {}

    fn on_challenge_response(&mut self, _session_id: SessionId, _credentials: &[u8], _now_ms: u64) {
    }

    fn on_process_connected_session(&mut self, proxy: &mut SessionProxy<'_>, _now_ms: u64) {
        proxy.authenticate();
    }

    fn on_process_challenged_session(&mut self, _proxy: &mut SessionProxy<'_>, _now_ms: u64) {}
}

/// Shared-secret authenticator with a challenge round for empty credentials.
#[derive(Debug)]
pub struct ChallengeAuthenticator {
    secret: Vec<u8>,
    challenge_data: Vec<u8>,
    credentials_by_session: HashMap<SessionId, Vec<u8>>,
}

impl ChallengeAuthenticator {
    pub fn new(secret: &[u8], challenge_data: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
            challenge_data: challenge_data.to_vec(),
            credentials_by_session: HashMap::new(),
        }
    }
}

impl Authenticator for ChallengeAuthenticator {
    fn on_connect_request(&mut self, session_id: SessionId, credentials: &[u8], _now_ms: u64) {
        self.credentials_by_session
            .insert(session_id, credentials.to_vec());
    }

    fn on_challenge_response(&mut self, session_id: SessionId, credentials: &[u8], _now_ms: u64) {
        self.credentials_by_session
            .insert(session_id, credentials.to_vec());
    }

    fn on_process_connected_session(&mut self, proxy: &mut SessionProxy<'_>, _now_ms: u64) {
        let credentials = self
            .credentials_by_session
            .get(&proxy.session_id())
            .cloned()
            .unwrap_or_default();
        if credentials.is_empty() {
            let challenge_data = self.challenge_data.clone();
            proxy.challenge(&challenge_data);
        } else if credentials == self.secret {
            if proxy.authenticate() {
                self.credentials_by_session.remove(&proxy.session_id());
            }
        } else {
            self.credentials_by_session.remove(&proxy.session_id());
            proxy.reject();
        }
    }

    fn on_process_challenged_session(&mut self, proxy: &mut SessionProxy<'_>, _now_ms: u64) {
        let Some(credentials) = self.credentials_by_session.get(&proxy.session_id()) else {
            return;
        };
        if credentials == &self.secret {
            if proxy.authenticate() {
                self.credentials_by_session.remove(&proxy.session_id());
            }
        } else {
            self.credentials_by_session.remove(&proxy.session_id());
            proxy.reject();
        }
    }
}
