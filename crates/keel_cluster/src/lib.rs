//! Sequencer agent for a replicated state-machine cluster.
//!
//! The crate turns a raw replicated append-only log into a linearizable
//! stream of committed messages delivered to co-hosted service replicas.
//! Each node runs one [`sequencer::SequencerAgent`]: a single-threaded
//! cooperative task driving leader election, client session lifecycle,
//! ordered command sequencing, commit propagation, snapshotting, and crash
//! recovery. Transport, archive, and counters collaborators are provided
//! in-process for single-machine clusters and tests.

pub mod archive;
pub mod auth;
pub mod bus;
pub mod client;
pub mod codec;
pub mod counters;
pub mod egress;
pub mod idle;
pub mod ingress;
pub mod log;
pub mod member;
pub mod member_status;
pub mod recording_log;
pub mod runner;
pub mod sequencer;
pub mod service;
pub mod service_host;
pub mod session;
pub mod snapshot;
pub mod time;
pub mod timers;

pub use archive::{Archive, SourceLocation};
pub use auth::{AllowAllAuthenticator, Authenticator, ChallengeAuthenticator};
pub use bus::MediaBus;
pub use client::{ClientEvent, ClusterClient};
pub use counters::{ClusterCounters, CounterRegistry, MarkFile, ToggleState};
pub use recording_log::RecordingLog;
pub use runner::AgentRunner;
pub use sequencer::{ConsensusState, Role, SequencerAgent, SequencerContext};
pub use service_host::ServiceHost;
pub use session::{CloseReason, SessionState};
