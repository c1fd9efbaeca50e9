//! Epoch clocks used by the sequencer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock epoch milliseconds.
pub trait EpochClock: Send + Sync {
    fn time_ms(&self) -> u64;
}

/// System clock in epoch milliseconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemEpochClock;

impl EpochClock for SystemEpochClock {
    fn time_ms(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        now.as_millis().min(u128::from(u64::MAX)) as u64
    }
}

/// Manually advanced clock shared between a test and the agent under test.
#[derive(Clone, Debug, Default)]
pub struct ManualEpochClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualEpochClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::Release);
    }

    pub fn advance(&self, delta_ms: u64) -> u64 {
        self.now_ms.fetch_add(delta_ms, Ordering::AcqRel) + delta_ms
    }
}

impl EpochClock for ManualEpochClock {
    fn time_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Acquire)
    }
}

/// Millisecond-granularity cache of the epoch clock.
///
/// A tick on which the cached value changes is a slow tick; per-tick work
/// that only needs millisecond resolution reads the cache instead of the
/// system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct CachedEpochClock {
    time_ms: u64,
}

impl CachedEpochClock {
    pub fn time_ms(&self) -> u64 {
        self.time_ms
    }

    pub fn update(&mut self, now_ms: u64) {
        self.time_ms = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualEpochClock::new(100);
        assert_eq!(clock.time_ms(), 100);
        assert_eq!(clock.advance(50), 150);
        assert_eq!(clock.time_ms(), 150);
    }

    #[test]
    fn cached_clock_tracks_updates() {
        let mut cached = CachedEpochClock::default();
        cached.update(42);
        assert_eq!(cached.time_ms(), 42);
    }
}
