//! Deadline timers driven by caller-supplied instants.
//!
//! Nothing here sleeps or spawns. The owner asks for the earliest
//! [`deadline`](Timer::deadline) across all timers, waits however it likes,
//! then calls [`poll`](Timer::poll) with the current time.

use std::time::{Duration, Instant};

/// One-shot or periodic deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timer {
    deadline: Option<Instant>,
    interval: Option<Duration>,
}

impl Timer {
    pub const fn new() -> Self {
        Self {
            deadline: None,
            interval: None,
        }
    }

    /// Arm unconditionally, replacing any pending deadline.
    pub fn arm(&mut self, now: Instant, after: Duration, interval: Option<Duration>) {
        self.deadline = Some(now + after);
        self.interval = interval.filter(|i| !i.is_zero());
    }

    /// Arm unless already armed with an earlier or equal deadline.
    ///
    /// Returns `true` if the deadline changed.
    pub fn arm_shorten(&mut self, now: Instant, after: Duration, interval: Option<Duration>) -> bool {
        let at = now + after;
        match self.deadline {
            Some(current) if current <= at => false,
            _ => {
                self.arm(now, after, interval);
                true
            }
        }
    }

    /// Arm only if not armed. Returns `true` if the timer was armed.
    pub fn arm_if_inactive(&mut self, now: Instant, after: Duration, interval: Option<Duration>) -> bool {
        if self.is_armed() {
            return false;
        }
        self.arm(now, after, interval);
        true
    }

    /// Cancel. Safe in any state.
    #[inline]
    pub fn disarm(&mut self) {
        self.deadline = None;
        self.interval = None;
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fire if due.
    ///
    /// Returns the overrun, the number of whole periods missed beyond the
    /// first expiry. One-shot timers disarm on firing; periodic timers move to
    /// the next period after `now`.
    pub fn poll(&mut self, now: Instant) -> Option<u32> {
        let deadline = self.deadline?;
        if deadline > now {
            return None;
        }

        match self.interval {
            Some(period) => {
                let late = now.duration_since(deadline);
                let missed = (late.as_nanos() / period.as_nanos()) as u64;
                let overrun = u32::try_from(missed).unwrap_or(u32::MAX);
                let step = period.saturating_mul(overrun.saturating_add(1));
                self.deadline = Some(deadline + step);
                Some(overrun)
            }
            None => {
                self.deadline = None;
                Some(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_one_shot() {
        let t0 = Instant::now();
        let mut t = Timer::new();
        assert_eq!(t.poll(t0), None);

        t.arm(t0, 5 * MS, None);
        assert_eq!(t.poll(t0 + 4 * MS), None);
        assert_eq!(t.poll(t0 + 5 * MS), Some(0));
        assert!(!t.is_armed());
        assert_eq!(t.poll(t0 + 50 * MS), None);
    }

    #[test]
    fn test_zero_delay_is_due_now() {
        let t0 = Instant::now();
        let mut t = Timer::new();
        t.arm(t0, Duration::ZERO, None);
        assert_eq!(t.poll(t0), Some(0));
    }

    #[test]
    fn test_periodic_overrun() {
        let t0 = Instant::now();
        let mut t = Timer::new();
        t.arm(t0, MS, Some(10 * MS));

        assert_eq!(t.poll(t0 + MS), Some(0));
        assert_eq!(t.deadline(), Some(t0 + 11 * MS));

        // 35ms late: three full periods missed.
        assert_eq!(t.poll(t0 + 46 * MS), Some(3));
        assert_eq!(t.deadline(), Some(t0 + 51 * MS));
    }

    #[test]
    fn test_shorten_only_moves_earlier() {
        let t0 = Instant::now();
        let mut t = Timer::new();
        assert!(t.arm_shorten(t0, 20 * MS, None));
        assert!(!t.arm_shorten(t0, 30 * MS, None));
        assert_eq!(t.deadline(), Some(t0 + 20 * MS));
        assert!(t.arm_shorten(t0, 10 * MS, None));
        assert_eq!(t.deadline(), Some(t0 + 10 * MS));
    }

    #[test]
    fn test_if_inactive() {
        let t0 = Instant::now();
        let mut t = Timer::new();
        assert!(t.arm_if_inactive(t0, 20 * MS, None));
        assert!(!t.arm_if_inactive(t0, MS, None));
        assert_eq!(t.deadline(), Some(t0 + 20 * MS));
    }

    #[test]
    fn test_disarm_idempotent() {
        let t0 = Instant::now();
        let mut t = Timer::new();
        t.disarm();
        t.arm(t0, MS, Some(MS));
        t.disarm();
        t.disarm();
        assert!(!t.is_armed());
        assert_eq!(t.poll(t0 + 10 * MS), None);
    }
}
