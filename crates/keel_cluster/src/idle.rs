//! Idle strategies for the agent duty cycle and its spin-awaits.

use std::time::Duration;

/// Cooperative idling between polls.
///
/// Every spin-await in the sequencer invokes the strategy with the previous
/// poll's work count; a strategy may spin, yield, or sleep but must not
/// block indefinitely.
pub trait IdleStrategy: Send + Sync {
    fn idle(&self, work_count: usize);

    fn reset(&self) {}
}

/// Busy-spin with a CPU relax hint. Lowest latency, one core burned.
#[derive(Clone, Copy, Debug, Default)]
pub struct BusySpinIdle;

impl IdleStrategy for BusySpinIdle {
    fn idle(&self, work_count: usize) {
        if work_count == 0 {
            std::hint::spin_loop();
        }
    }
}

/// Yield then sleep when no work was done.
#[derive(Clone, Copy, Debug)]
pub struct SleepingIdle {
    sleep: Duration,
}

impl SleepingIdle {
    pub fn new(sleep: Duration) -> Self {
        Self { sleep }
    }
}

impl Default for SleepingIdle {
    fn default() -> Self {
        Self {
            sleep: Duration::from_micros(100),
        }
    }
}

impl IdleStrategy for SleepingIdle {
    fn idle(&self, work_count: usize) {
        if work_count == 0 {
            std::thread::sleep(self.sleep);
        }
    }
}

/// No-op strategy for single-threaded deterministic tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpIdle;

impl IdleStrategy for NoOpIdle {
    fn idle(&self, _work_count: usize) {}
}
