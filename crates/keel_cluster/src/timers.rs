//! Deadline timers scheduled by services and fired through the log.

use std::collections::{BTreeSet, HashMap};

/// Timer deadlines keyed by correlation id with an ordered deadline view.
#[derive(Debug, Default)]
pub struct TimerService {
    deadline_by_correlation: HashMap<u64, u64>,
    ordered: BTreeSet<(u64, u64)>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule or overwrite the timer for `correlation_id`.
    pub fn schedule_timer(&mut self, correlation_id: u64, deadline_ms: u64) {
        if let Some(previous) = self
            .deadline_by_correlation
            .insert(correlation_id, deadline_ms)
        {
            self.ordered.remove(&(previous, correlation_id));
        }
        self.ordered.insert((deadline_ms, correlation_id));
    }

    /// Remove a scheduled timer; false when none was scheduled.
    pub fn cancel_timer(&mut self, correlation_id: u64) -> bool {
        match self.deadline_by_correlation.remove(&correlation_id) {
            Some(deadline) => {
                self.ordered.remove(&(deadline, correlation_id));
                true
            }
            None => false,
        }
    }

    /// Fire expired timers through `on_timer_event`.
    ///
    /// The handler appends the event to the log; on back-pressure it returns
    /// false and the timer stays scheduled for the next poll.
    pub fn poll(
        &mut self,
        now_ms: u64,
        mut on_timer_event: impl FnMut(u64, u64) -> bool,
    ) -> usize {
        let mut fired = 0;
        while let Some(&(deadline, correlation_id)) = self.ordered.iter().next() {
            if deadline > now_ms {
                break;
            }
            if !on_timer_event(correlation_id, now_ms) {
                break;
            }
            self.ordered.remove(&(deadline, correlation_id));
            self.deadline_by_correlation.remove(&correlation_id);
            fired += 1;
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.deadline_by_correlation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadline_by_correlation.is_empty()
    }

    /// Visit every scheduled timer in deadline order, for snapshotting.
    pub fn snapshot(&self, mut visitor: impl FnMut(u64, u64)) {
        for &(deadline, correlation_id) in &self.ordered {
            visitor(correlation_id, deadline);
        }
    }

    pub fn entries(&self) -> Vec<(u64, u64)> {
        self.ordered
            .iter()
            .map(|&(deadline, correlation_id)| (correlation_id, deadline))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_expired_timers_in_deadline_order() {
        let mut timers = TimerService::new();
        timers.schedule_timer(7, 300);
        timers.schedule_timer(5, 100);
        timers.schedule_timer(6, 200);

        let mut fired = Vec::new();
        let count = timers.poll(250, |correlation_id, _| {
            fired.push(correlation_id);
            true
        });
        assert_eq!(count, 2);
        assert_eq!(fired, vec![5, 6]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn back_pressure_leaves_the_timer_scheduled() {
        let mut timers = TimerService::new();
        timers.schedule_timer(5, 100);

        let count = timers.poll(150, |_, _| false);
        assert_eq!(count, 0);
        assert_eq!(timers.len(), 1);

        let count = timers.poll(150, |_, _| true);
        assert_eq!(count, 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn reschedule_overwrites_the_deadline() {
        let mut timers = TimerService::new();
        timers.schedule_timer(5, 100);
        timers.schedule_timer(5, 500);

        assert_eq!(timers.poll(200, |_, _| true), 0);
        assert_eq!(timers.entries(), vec![(5, 500)]);
    }

    #[test]
    fn cancel_removes_both_views() {
        let mut timers = TimerService::new();
        timers.schedule_timer(5, 100);
        assert!(timers.cancel_timer(5));
        assert!(!timers.cancel_timer(5));
        assert_eq!(timers.poll(1_000, |_, _| true), 0);
    }
}
