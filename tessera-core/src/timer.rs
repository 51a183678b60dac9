//! Token-based timers for tick-driven loops.
//!
//! Nothing here sleeps. Callers pass the current time and ask what is due.
//! Arming a slot bumps its generation, so a token handed out for an earlier
//! arming can never fire the replacement.

use std::time::Duration;

use tessera_types::Timestamp;

/// Identifies one arming of a `TimerSlot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// A single one-shot timer carrying a payload.
#[derive(Debug)]
pub struct TimerSlot<T> {
    generation: u64,
    armed: Option<Armed<T>>,
}

#[derive(Debug)]
struct Armed<T> {
    token: TimerToken,
    deadline: Timestamp,
    payload: T,
}

impl<T> Default for TimerSlot<T> {
    fn default() -> Self {
        Self {
            generation: 0,
            armed: None,
        }
    }
}

impl<T> TimerSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm for `deadline`, replacing whatever was armed before.
    pub fn arm(&mut self, deadline: Timestamp, payload: T) -> TimerToken {
        self.generation += 1;
        let token = TimerToken(self.generation);
        self.armed = Some(Armed {
            token,
            deadline,
            payload,
        });
        token
    }

    /// Disarm, returning the payload that will now never fire.
    pub fn cancel(&mut self) -> Option<T> {
        self.generation += 1;
        self.armed.take().map(|a| a.payload)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn is_current(&self, token: TimerToken) -> bool {
        self.armed.as_ref().map(|a| a.token) == Some(token)
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.armed.as_ref().map(|a| a.deadline)
    }

    pub fn payload(&self) -> Option<&T> {
        self.armed.as_ref().map(|a| &a.payload)
    }

    /// Take the payload if the deadline has been reached.
    pub fn fire(&mut self, now: Timestamp) -> Option<T> {
        match &self.armed {
            Some(armed) if armed.deadline <= now => self.armed.take().map(|a| a.payload),
            _ => None,
        }
    }
}

/// Periodic deadline with backlog skipping.
///
/// If the loop falls behind by more than one period, missed periods are
/// dropped instead of firing in a burst.
#[derive(Debug, Clone)]
pub struct Ticker {
    period: Duration,
    next: Option<Timestamp>,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self { period, next: None }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start ticking; the first tick is due at `first`.
    pub fn start_at(&mut self, first: Timestamp) {
        self.next = Some(first);
    }

    pub fn stop(&mut self) {
        self.next = None;
    }

    pub fn is_running(&self) -> bool {
        self.next.is_some()
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.next
    }

    /// Whether a tick is due at `now`. Advances the deadline when it is.
    pub fn due(&mut self, now: Timestamp) -> bool {
        let Some(next) = self.next else {
            return false;
        };
        if now < next {
            return false;
        }
        let following = next + self.period;
        self.next = Some(if following <= now { now + self.period } else { following });
        true
    }

    /// Like `due`, but also reports how many whole periods were skipped.
    pub fn due_skipping(&mut self, now: Timestamp) -> Option<u64> {
        let next = self.next?;
        if now < next {
            return None;
        }
        let period_ms = (self.period.as_millis() as u64).max(1);
        let behind = now.saturating_since(next).as_millis() as u64 / period_ms;
        self.next = Some(next.add_millis((behind + 1) * period_ms));
        Some(behind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: i64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    #[test]
    fn rearming_invalidates_previous_token() {
        let mut slot = TimerSlot::new();
        let first = slot.arm(ms(100), "a");
        let second = slot.arm(ms(200), "b");
        assert!(!slot.is_current(first));
        assert!(slot.is_current(second));
        assert_eq!(slot.fire(ms(150)), None);
        assert_eq!(slot.fire(ms(200)), Some("b"));
        assert!(!slot.is_armed());
    }

    #[test]
    fn cancel_disarms() {
        let mut slot = TimerSlot::new();
        let token = slot.arm(ms(10), 1);
        assert_eq!(slot.cancel(), Some(1));
        assert!(!slot.is_current(token));
        assert_eq!(slot.fire(ms(1_000)), None);
    }

    #[test]
    fn ticker_skips_backlog() {
        let mut ticker = Ticker::new(Duration::from_millis(100));
        ticker.start_at(ms(0));
        assert!(ticker.due(ms(0)));
        assert!(!ticker.due(ms(50)));
        assert!(ticker.due(ms(100)));
        // far behind: one tick, then rescheduled relative to now
        assert!(ticker.due(ms(1_000)));
        assert!(!ticker.due(ms(1_050)));
        assert_eq!(ticker.next_deadline(), Some(ms(1_100)));
    }

    #[test]
    fn due_skipping_counts_missed_periods() {
        let mut ticker = Ticker::new(Duration::from_millis(100));
        ticker.start_at(ms(100));
        assert_eq!(ticker.due_skipping(ms(99)), None);
        assert_eq!(ticker.due_skipping(ms(100)), Some(0));
        assert_eq!(ticker.due_skipping(ms(450)), Some(2));
        assert_eq!(ticker.next_deadline(), Some(ms(500)));
    }
}
