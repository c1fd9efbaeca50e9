//! Per-client session lifecycle state.

use crate::bus::{MediaBus, Publication};

/// Monotonic, non-wrapping session identifier assigned by the leader.
pub type SessionId = u64;

/// Why a session-close record was appended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    UserAction,
    Timeout,
}

impl CloseReason {
    pub fn code(self) -> u8 {
        match self {
            CloseReason::UserAction => 0,
            CloseReason::Timeout => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CloseReason::UserAction),
            1 => Some(CloseReason::Timeout),
            _ => None,
        }
    }
}

/// Session lifecycle; each variant carries only the data that state needs.
///
/// Transitions are monotonic apart from the CONNECTED↔CHALLENGED ping-pong
/// during authentication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connected,
    Challenged,
    Authenticated,
    Rejected,
    Open { term_position: u64 },
    TimedOut,
    Closed { reason: CloseReason },
}

/// One client session owned by the sequencer.
#[derive(Debug)]
pub struct ClusterSession {
    id: SessionId,
    response_stream_id: i32,
    response_channel: String,
    state: SessionState,
    time_of_last_activity_ms: u64,
    last_correlation_id: u64,
    admin_response_detail: Option<String>,
    response_publication: Option<Publication>,
}

impl ClusterSession {
    pub fn new(id: SessionId, response_stream_id: i32, response_channel: &str) -> Self {
        Self {
            id,
            response_stream_id,
            response_channel: response_channel.to_string(),
            state: SessionState::Init,
            time_of_last_activity_ms: 0,
            last_correlation_id: 0,
            admin_response_detail: None,
            response_publication: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn response_stream_id(&self) -> i32 {
        self.response_stream_id
    }

    pub fn response_channel(&self) -> &str {
        &self.response_channel
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Open { .. })
    }

    /// Open position in the log, once the session-open record appended.
    pub fn open_term_position(&self) -> Option<u64> {
        match self.state {
            SessionState::Open { term_position } => Some(term_position),
            _ => None,
        }
    }

    /// Connect the response publication for egress to this client.
    pub fn connect(&mut self, bus: &MediaBus) -> anyhow::Result<()> {
        if self.response_publication.is_none() {
            self.response_publication =
                Some(bus.add_publication(&self.response_channel, self.response_stream_id)?);
        }
        Ok(())
    }

    pub fn is_response_publication_connected(&self) -> bool {
        self.response_publication
            .as_ref()
            .is_some_and(Publication::is_connected)
    }

    pub fn response_publication(&self) -> Option<&Publication> {
        self.response_publication.as_ref()
    }

    pub fn open(&mut self, term_position: u64) {
        self.state = SessionState::Open { term_position };
    }

    pub fn close(&mut self, reason: CloseReason) {
        self.state = SessionState::Closed { reason };
        self.response_publication = None;
    }

    /// Release transport resources without recording a close reason.
    pub fn disconnect(&mut self) {
        self.response_publication = None;
    }

    pub fn last_activity(&mut self, now_ms: u64, correlation_id: u64) {
        self.time_of_last_activity_ms = now_ms;
        self.last_correlation_id = correlation_id;
    }

    pub fn set_time_of_last_activity(&mut self, now_ms: u64) {
        self.time_of_last_activity_ms = now_ms;
    }

    pub fn time_of_last_activity_ms(&self) -> u64 {
        self.time_of_last_activity_ms
    }

    pub fn last_correlation_id(&self) -> u64 {
        self.last_correlation_id
    }

    pub fn set_admin_response_detail(&mut self, detail: Option<String>) {
        self.admin_response_detail = detail;
    }

    pub fn admin_response_detail(&self) -> Option<&str> {
        self.admin_response_detail.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_carries_the_term_position() {
        let mut session = ClusterSession::new(7, 1, "mem://egress-7");
        assert_eq!(session.state(), SessionState::Init);
        assert_eq!(session.open_term_position(), None);

        session.open(640);
        assert!(session.is_open());
        assert_eq!(session.open_term_position(), Some(640));

        session.close(CloseReason::Timeout);
        assert_eq!(
            session.state(),
            SessionState::Closed {
                reason: CloseReason::Timeout
            }
        );
    }

    #[test]
    fn activity_stamps_time_and_correlation() {
        let mut session = ClusterSession::new(7, 1, "mem://egress-7");
        session.last_activity(1_000, 42);
        assert_eq!(session.time_of_last_activity_ms(), 1_000);
        assert_eq!(session.last_correlation_id(), 42);
    }

    #[test]
    fn connect_is_idempotent_and_requires_a_subscriber() {
        let bus = MediaBus::new();
        let mut session = ClusterSession::new(7, 1, "mem://egress-7");
        session.connect(&bus).unwrap();
        assert!(!session.is_response_publication_connected());

        let _subscription = bus.add_subscription("mem://egress-7", 1).unwrap();
        session.connect(&bus).unwrap();
        assert!(session.is_response_publication_connected());
    }
}
