//! Externally observable cluster counters.
//!
//! Counters outlive individual role transitions and are read by operators,
//! tests, and co-hosted service replicas. Progress-advancing stores use
//! release ordering; plain loads are acceptable wherever staleness is.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Shared atomic counter with a human-readable label.
#[derive(Clone, Debug)]
pub struct Counter {
    label: String,
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Plain load where a stale value is acceptable.
    pub fn get_weak(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set_ordered(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }

    pub fn increment_ordered(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Advance to `value` only if it is greater than the current value.
    pub fn propose_max_ordered(&self, value: u64) -> bool {
        self.value.fetch_max(value, Ordering::AcqRel) < value
    }

    fn compare_and_set(&self, expected: u64, value: u64) -> bool {
        self.value
            .compare_exchange(expected, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Commands an operator can issue through the control-toggle counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToggleState {
    Neutral,
    Suspend,
    Resume,
    Snapshot,
    Shutdown,
    Abort,
}

impl ToggleState {
    pub fn code(self) -> u64 {
        match self {
            ToggleState::Neutral => 0,
            ToggleState::Suspend => 1,
            ToggleState::Resume => 2,
            ToggleState::Snapshot => 3,
            ToggleState::Shutdown => 4,
            ToggleState::Abort => 5,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(ToggleState::Neutral),
            1 => Some(ToggleState::Suspend),
            2 => Some(ToggleState::Resume),
            3 => Some(ToggleState::Snapshot),
            4 => Some(ToggleState::Shutdown),
            5 => Some(ToggleState::Abort),
            _ => None,
        }
    }

    pub fn get(toggle: &Counter) -> ToggleState {
        ToggleState::from_code(toggle.get()).unwrap_or(ToggleState::Neutral)
    }

    /// Request a command; only succeeds from NEUTRAL.
    pub fn activate(self, toggle: &Counter) -> bool {
        toggle.compare_and_set(ToggleState::Neutral.code(), self.code())
    }

    pub fn reset(toggle: &Counter) {
        toggle.set_ordered(ToggleState::Neutral.code());
    }
}

/// The per-node counter set the sequencer owns and updates.
#[derive(Clone, Debug)]
pub struct ClusterCounters {
    pub module_state: Counter,
    pub cluster_role: Counter,
    pub control_toggle: Counter,
    pub snapshot_count: Counter,
    pub invalid_requests: Counter,
}

impl Default for ClusterCounters {
    fn default() -> Self {
        Self {
            module_state: Counter::new("consensus-module-state"),
            cluster_role: Counter::new("cluster-node-role"),
            control_toggle: Counter::new("cluster-control-toggle"),
            snapshot_count: Counter::new("snapshot-count"),
            invalid_requests: Counter::new("invalid-request-count"),
        }
    }
}

/// Per-term commit-position counter with the metadata service replicas need
/// to locate themselves in the conceptual log.
#[derive(Debug)]
pub struct CommitPos {
    pub id: i32,
    pub recording_id: u64,
    pub base_log_position: u64,
    pub leadership_term_id: i64,
    pub log_session_id: i32,
    value: AtomicU64,
}

impl CommitPos {
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn get_weak(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set_ordered(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }

    pub fn propose_max_ordered(&self, value: u64) {
        self.value.fetch_max(value, Ordering::AcqRel);
    }
}

/// One-shot record published at startup describing the recovery about to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryState {
    pub leadership_term_id: i64,
    pub log_position: u64,
    pub term_position: Option<u64>,
    pub timestamp_ms: u64,
    pub term_count: usize,
}

/// Allocator and lookup for counters shared with service replicas.
#[derive(Clone, Debug, Default)]
pub struct CounterRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    next_id: i32,
    commit_positions: HashMap<i32, Arc<CommitPos>>,
    recovery_state: Option<RecoveryState>,
}

impl CounterRegistry {
    pub fn allocate_commit_pos(
        &self,
        recording_id: u64,
        base_log_position: u64,
        leadership_term_id: i64,
        log_session_id: i32,
    ) -> Arc<CommitPos> {
        let mut state = self.inner.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        let counter = Arc::new(CommitPos {
            id,
            recording_id,
            base_log_position,
            leadership_term_id,
            log_session_id,
            value: AtomicU64::new(0),
        });
        state.commit_positions.insert(id, Arc::clone(&counter));
        counter
    }

    pub fn commit_pos(&self, id: i32) -> Option<Arc<CommitPos>> {
        self.inner.lock().unwrap().commit_positions.get(&id).cloned()
    }

    pub fn free_commit_pos(&self, id: i32) {
        self.inner.lock().unwrap().commit_positions.remove(&id);
    }

    pub fn publish_recovery_state(&self, recovery_state: RecoveryState) {
        self.inner.lock().unwrap().recovery_state = Some(recovery_state);
    }

    pub fn recovery_state(&self) -> Option<RecoveryState> {
        self.inner.lock().unwrap().recovery_state
    }
}

/// Liveness mark stamped by the agent on every slow tick.
#[derive(Clone, Debug, Default)]
pub struct MarkFile {
    activity_timestamp_ms: Arc<AtomicU64>,
}

impl MarkFile {
    pub fn update_activity_timestamp(&self, now_ms: u64) {
        self.activity_timestamp_ms.store(now_ms, Ordering::Release);
    }

    pub fn activity_timestamp_ms(&self) -> u64 {
        self.activity_timestamp_ms.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propose_max_never_regresses() {
        let counter = Counter::new("commit-pos");
        assert!(counter.propose_max_ordered(10));
        assert!(!counter.propose_max_ordered(5));
        assert_eq!(counter.get(), 10);
    }

    #[test]
    fn toggle_only_activates_from_neutral() {
        let toggle = Counter::new("toggle");
        assert!(ToggleState::Snapshot.activate(&toggle));
        assert!(!ToggleState::Shutdown.activate(&toggle));
        assert_eq!(ToggleState::get(&toggle), ToggleState::Snapshot);

        ToggleState::reset(&toggle);
        assert!(ToggleState::Shutdown.activate(&toggle));
    }

    #[test]
    fn registry_hands_out_sequential_commit_pos_ids() {
        let registry = CounterRegistry::default();
        let a = registry.allocate_commit_pos(0, 0, 0, 7);
        let b = registry.allocate_commit_pos(1, 128, 1, 9);
        assert_eq!(a.id, 0);
        assert_eq!(b.id, 1);
        assert_eq!(registry.commit_pos(1).unwrap().base_log_position, 128);

        registry.free_commit_pos(0);
        assert!(registry.commit_pos(0).is_none());
    }
}
