use crate::sampler::NO_SIGNAL_DBM;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Near,
    Far,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    BecameNear,
    BecameFar,
}

/// Receives the outcome of every sampling tick. Called synchronously from
/// the sampling thread, so implementations should return promptly.
pub trait TransitionHandler: Send {
    fn on_near(&mut self);

    fn on_far(&mut self);

    /// Raw reading for display, `None` when there was no measurement.
    fn on_signal(&mut self, _rssi: Option<i8>) {}
}

/// Consecutive-miss hysteresis. A miss is a failed sample or one below the
/// threshold; `miss_limit` consecutive misses flip the state to `Far`, and the
/// first in-range sample after any miss reports `Near`.
#[derive(Clone, Debug)]
pub struct PresenceTracker {
    state: Presence,
    misses: u32,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        PresenceTracker {
            state: Presence::Near,
            misses: 0,
        }
    }

    pub fn state(&self) -> Presence {
        self.state
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn reset(&mut self) {
        self.state = Presence::Near;
        self.misses = 0;
    }

    pub fn observe(
        &mut self,
        rssi: Option<i8>,
        threshold: i8,
        miss_limit: u32,
    ) -> Option<Transition> {
        let in_range = matches!(rssi, Some(v) if v != NO_SIGNAL_DBM && v >= threshold);

        if in_range {
            if self.misses == 0 {
                return None;
            }
            self.misses = 0;
            self.state = Presence::Near;
            return Some(Transition::BecameNear);
        }

        self.misses = self.misses.saturating_add(1);
        if self.state == Presence::Near && self.misses >= miss_limit.max(1) {
            self.state = Presence::Far;
            return Some(Transition::BecameFar);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(
        tracker: &mut PresenceTracker,
        samples: &[Option<i8>],
        threshold: i8,
        limit: u32,
    ) -> Vec<Option<Transition>> {
        samples
            .iter()
            .map(|s| tracker.observe(*s, threshold, limit))
            .collect()
    }

    #[test]
    fn test_far_fires_when_limit_reached() {
        let mut tracker = PresenceTracker::new();
        let events = run(&mut tracker, &[Some(-5), Some(-20), Some(-20), Some(-20)], -10, 3);
        assert_eq!(events, vec![None, None, None, Some(Transition::BecameFar)]);
        assert_eq!(tracker.state(), Presence::Far);
        assert_eq!(tracker.misses(), 3);
    }

    #[test]
    fn test_near_fires_after_far() {
        let mut tracker = PresenceTracker::new();
        run(&mut tracker, &[Some(-20), Some(-20), Some(-20)], -10, 3);
        assert_eq!(tracker.observe(Some(-5), -10, 3), Some(Transition::BecameNear));
        assert_eq!(tracker.misses(), 0);
        assert_eq!(tracker.state(), Presence::Near);
    }

    #[test]
    fn test_near_fires_after_partial_miss_streak() {
        let mut tracker = PresenceTracker::new();
        assert_eq!(tracker.observe(None, -10, 3), None);
        assert_eq!(tracker.observe(Some(-1), -10, 3), Some(Transition::BecameNear));
    }

    #[test]
    fn test_transitions_do_not_repeat() {
        let mut tracker = PresenceTracker::new();
        let events = run(&mut tracker, &[None; 8], -10, 3);
        assert_eq!(events.iter().filter(|e| e.is_some()).count(), 1);
        assert_eq!(events[2], Some(Transition::BecameFar));

        let events = run(&mut tracker, &[Some(0); 5], -10, 3);
        assert_eq!(events[0], Some(Transition::BecameNear));
        assert!(events[1..].iter().all(|e| e.is_none()));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut tracker = PresenceTracker::new();
        tracker.observe(None, -10, 3);
        assert_eq!(tracker.observe(Some(-10), -10, 3), Some(Transition::BecameNear));
    }

    #[test]
    fn test_sentinel_is_always_a_miss() {
        let mut tracker = PresenceTracker::new();
        assert_eq!(tracker.observe(Some(NO_SIGNAL_DBM), -120, 1), Some(Transition::BecameFar));
    }

    #[test]
    fn test_lowered_limit_fires_once() {
        // Counter already past the new limit: fire on the next miss, then stay quiet.
        let mut tracker = PresenceTracker::new();
        run(&mut tracker, &[None, None, None, None], -10, 10);
        assert_eq!(tracker.state(), Presence::Near);
        assert_eq!(tracker.observe(None, -10, 2), Some(Transition::BecameFar));
        assert_eq!(tracker.observe(None, -10, 2), None);
    }

    #[test]
    fn test_counter_bounded_until_far() {
        let mut tracker = PresenceTracker::new();
        let limit = 4;
        for i in 1..=limit {
            let event = tracker.observe(Some(-50), -10, limit);
            assert!(tracker.misses() <= limit);
            assert_eq!(event.is_some(), i == limit);
        }
    }

    #[test]
    fn test_zero_limit_treated_as_one() {
        let mut tracker = PresenceTracker::new();
        assert_eq!(tracker.observe(None, -10, 0), Some(Transition::BecameFar));
    }
}
