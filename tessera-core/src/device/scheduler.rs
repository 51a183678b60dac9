use std::time::Duration;

use tessera_types::Timestamp;

use super::poller::ResolvedEffect;
use crate::timer::{TimerSlot, TimerToken};

/// An effect waiting for its synchronized execution instant.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingActivation {
    pub effect: ResolvedEffect,
    pub execute_at: Timestamp,
}

/// Defers activation to `anchor + synch_delay`.
///
/// Every device observing the same publish computes the same instant
/// regardless of when its poll landed. There is one slot: scheduling
/// replaces whatever was pending.
pub struct EffectScheduler {
    synch_delay: Duration,
    slot: TimerSlot<PendingActivation>,
}

impl EffectScheduler {
    pub fn new(synch_delay: Duration) -> Self {
        Self {
            synch_delay,
            slot: TimerSlot::new(),
        }
    }

    pub fn synch_delay(&self) -> Duration {
        self.synch_delay
    }

    pub fn schedule(&mut self, effect: ResolvedEffect, now: Timestamp) -> TimerToken {
        let execute_at = effect.revision.anchor() + self.synch_delay;
        if let Some(replaced) = self.slot.payload() {
            log::debug!(target: "scheduler", "replacing pending '{}' with '{}'", replaced.effect.key, effect.key);
        }
        log::debug!(
            target: "scheduler",
            "'{}' scheduled for {} (in {:?})",
            effect.key,
            execute_at,
            now.until(execute_at)
        );
        self.slot.arm(execute_at, PendingActivation { effect, execute_at })
    }

    pub fn pending(&self) -> Option<&PendingActivation> {
        self.slot.payload()
    }

    pub fn cancel(&mut self) -> Option<PendingActivation> {
        self.slot.cancel()
    }

    /// The activation to fire now, if its instant has come.
    pub fn due(&mut self, now: Timestamp) -> Option<PendingActivation> {
        self.slot.fire(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::poller::Revision;
    use tessera_types::{EffectKey, EffectParams};

    fn ms(v: i64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn effect(key: &str, published: i64) -> ResolvedEffect {
        ResolvedEffect {
            key: EffectKey::new(key),
            params: EffectParams::default(),
            text: None,
            revision: Revision {
                published: ms(published),
                cell_updated: Timestamp::ZERO,
            },
        }
    }

    #[test]
    fn observation_time_does_not_move_execution() {
        let mut early = EffectScheduler::new(Duration::from_millis(2_500));
        let mut late = EffectScheduler::new(Duration::from_millis(2_500));
        early.schedule(effect("apagon", 10_000), ms(10_100));
        late.schedule(effect("apagon", 10_000), ms(12_000));

        assert_eq!(early.due(ms(12_499)), None);
        assert_eq!(late.due(ms(12_499)), None);
        assert_eq!(early.due(ms(12_500)).unwrap().execute_at, ms(12_500));
        assert_eq!(late.due(ms(12_500)).unwrap().execute_at, ms(12_500));
    }

    #[test]
    fn newer_effect_supersedes_pending() {
        let mut scheduler = EffectScheduler::new(Duration::from_millis(2_500));
        let first = scheduler.schedule(effect("apagon", 1_000), ms(1_000));
        let second = scheduler.schedule(effect("arcoiris", 1_200), ms(1_300));
        assert!(!scheduler.slot.is_current(first));
        assert!(scheduler.slot.is_current(second));

        let fired = scheduler.due(ms(10_000)).unwrap();
        assert_eq!(fired.effect.key.as_str(), "arcoiris");
        assert_eq!(scheduler.due(ms(20_000)), None);
    }

    #[test]
    fn past_instant_fires_immediately() {
        let mut scheduler = EffectScheduler::new(Duration::from_millis(2_500));
        scheduler.schedule(effect("apagon", 1_000), ms(60_000));
        assert!(scheduler.due(ms(60_000)).is_some());
    }
}
