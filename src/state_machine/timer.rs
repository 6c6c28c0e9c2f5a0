//! Single-shot timers owned by the state machine thread.
//!
//! Each timer holds at most one pending expiry. Starting a timer that is
//! already pending replaces the old deadline and event; stopping it cancels
//! the expiry. Expired timers are collected by the engine, which posts their
//! events to the queue.

use std::time::{Duration, Instant};

use super::EventId;

/// Handle for one timer of a machine. `TimerId::DEFAULT` always exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) usize);

impl TimerId {
    /// The timer every machine has.
    pub const DEFAULT: TimerId = TimerId(0);
}

/// One armed expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pending {
    pub(crate) deadline: Instant,
    pub(crate) event: EventId,
}

#[derive(Debug)]
pub(crate) struct TimerBank {
    slots: Vec<Option<Pending>>,
}

impl TimerBank {
    pub(crate) fn new() -> Self {
        Self { slots: vec![None] }
    }

    pub(crate) fn add(&mut self) -> TimerId {
        self.slots.push(None);
        TimerId(self.slots.len() - 1)
    }

    pub(crate) fn start(&mut self, timer: TimerId, now: Instant, period: Duration, event: EventId) {
        if let Some(slot) = self.slots.get_mut(timer.0) {
            *slot = Some(Pending {
                deadline: now + period,
                event,
            });
        }
    }

    pub(crate) fn stop(&mut self, timer: TimerId) {
        if let Some(slot) = self.slots.get_mut(timer.0) {
            *slot = None;
        }
    }

    pub(crate) fn stop_all(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    pub(crate) fn is_pending(&self, timer: TimerId) -> bool {
        matches!(self.slots.get(timer.0), Some(Some(_)))
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().flatten().map(|p| p.deadline).min()
    }

    /// Remove every timer whose deadline is at or before `now`, returning them
    /// ordered by deadline.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<(TimerId, Pending)> {
        let mut due = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(pending) = *slot {
                if pending.deadline <= now {
                    due.push((TimerId(index), pending));
                    *slot = None;
                }
            }
        }
        due.sort_by_key(|(_, p)| p.deadline);
        due
    }

    /// Put back an expiry whose event could not be queued. A timer restarted
    /// in the meantime keeps its newer deadline.
    pub(crate) fn restore(&mut self, timer: TimerId, pending: Pending) {
        if let Some(slot @ None) = self.slots.get_mut(timer.0) {
            *slot = Some(pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_replaces_pending_expiry() {
        let mut bank = TimerBank::new();
        let now = Instant::now();
        bank.start(TimerId::DEFAULT, now, Duration::from_secs(5), EventId(1));
        bank.start(TimerId::DEFAULT, now, Duration::from_secs(1), EventId(2));

        assert!(bank.take_due(now + Duration::from_millis(500)).is_empty());
        let due = bank.take_due(now + Duration::from_secs(1));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1.event, EventId(2));
        // single shot
        assert!(bank.take_due(now + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn stop_cancels() {
        let mut bank = TimerBank::new();
        let now = Instant::now();
        bank.start(TimerId::DEFAULT, now, Duration::from_millis(1), EventId(1));
        bank.stop(TimerId::DEFAULT);
        assert!(!bank.is_pending(TimerId::DEFAULT));
        assert!(bank.take_due(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn due_events_are_ordered_by_deadline() {
        let mut bank = TimerBank::new();
        let retry = bank.add();
        let now = Instant::now();
        bank.start(TimerId::DEFAULT, now, Duration::from_secs(2), EventId(1));
        bank.start(retry, now, Duration::from_millis(10), EventId(7));

        assert_eq!(bank.next_deadline(), Some(now + Duration::from_millis(10)));
        let due: Vec<_> = bank
            .take_due(now + Duration::from_secs(3))
            .into_iter()
            .map(|(timer, p)| (timer, p.event))
            .collect();
        assert_eq!(due, vec![(retry, EventId(7)), (TimerId::DEFAULT, EventId(1))]);
        assert_eq!(bank.next_deadline(), None);
    }

    #[test]
    fn restore_keeps_a_newer_start() {
        let mut bank = TimerBank::new();
        let now = Instant::now();
        bank.start(TimerId::DEFAULT, now, Duration::ZERO, EventId(1));
        let (timer, pending) = bank.take_due(now)[0];

        bank.restore(timer, pending);
        assert_eq!(bank.next_deadline(), Some(now));

        bank.take_due(now);
        bank.start(TimerId::DEFAULT, now, Duration::from_secs(9), EventId(3));
        bank.restore(timer, pending);
        assert_eq!(bank.next_deadline(), Some(now + Duration::from_secs(9)));
    }
}
