//! [`StuckDetector`]: sliding-window lack-of-progress heuristic.
//!
//! The detector keeps the last `window` environment fingerprints and the
//! number of consecutive failed/timed-out actions. It signals stuck when the
//! whole window holds one fingerprint, or when the failure streak reaches
//! `window`.
//!
//! Static screens that are legitimately unchanged produce false positives, and
//! oscillating-but-unproductive states produce false negatives. Both are
//! accepted.
//!
//! The detector is part of the run snapshot and is only mutated by folding
//! events (see [`crate::core::run`]), so a rebuilt run carries the same window
//! as the live one did.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::ActionStatus;

pub const DEFAULT_WINDOW: usize = 3;

/// Why the detector fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckTrigger {
    IdenticalObservations,
    ConsecutiveFailures,
}

impl fmt::Display for StuckTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StuckTrigger::IdenticalObservations => f.write_str("identical_observations"),
            StuckTrigger::ConsecutiveFailures => f.write_str("consecutive_failures"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckDetector {
    window: usize,
    fingerprints: VecDeque<String>,
    consecutive_failures: u32,
    /// A recovery ran and the run has not yet shown progress since.
    recovery_spent: bool,
}

impl Default for StuckDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl StuckDetector {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            fingerprints: VecDeque::with_capacity(window),
            consecutive_failures: 0,
            recovery_spent: false,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn recovery_spent(&self) -> bool {
        self.recovery_spent
    }

    /// Record the outcome of a planned action and the fingerprint observed after it.
    pub fn record_action(&mut self, status: ActionStatus, fingerprint: Option<&str>) {
        if let Some(fingerprint) = fingerprint {
            self.fingerprints.push_back(fingerprint.to_string());
            while self.fingerprints.len() > self.window {
                self.fingerprints.pop_front();
            }
        }
        self.count(status);
    }

    /// Mark that the single recovery attempt has been used.
    pub fn record_recovery_started(&mut self) {
        self.recovery_spent = true;
    }

    /// Record the outcome of the recovery action itself.
    ///
    /// A successful recovery clears the fingerprint window; its fingerprint is
    /// not added so the next `window` planned actions start from scratch.
    pub fn record_recovery_result(&mut self, status: ActionStatus) {
        if status == ActionStatus::Success {
            self.fingerprints.clear();
        }
        self.count(status);
    }

    /// Called when a step commits: progress clears a spent recovery.
    pub fn record_step_completed(&mut self) {
        if self.signal().is_none() {
            self.recovery_spent = false;
        }
    }

    /// Current verdict. Identical observations win when both conditions hold.
    pub fn signal(&self) -> Option<StuckTrigger> {
        let window_full = self.fingerprints.len() == self.window;
        if window_full
            && self
                .fingerprints
                .iter()
                .all(|fingerprint| fingerprint == &self.fingerprints[0])
        {
            return Some(StuckTrigger::IdenticalObservations);
        }
        if self.consecutive_failures as usize >= self.window {
            return Some(StuckTrigger::ConsecutiveFailures);
        }
        None
    }

    fn count(&mut self, status: ActionStatus) {
        match status {
            ActionStatus::Success => self.consecutive_failures = 0,
            ActionStatus::Failed | ActionStatus::Timeout => self.consecutive_failures += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_window_signals() {
        let mut detector = StuckDetector::new(3);
        detector.record_action(ActionStatus::Success, Some("a"));
        detector.record_action(ActionStatus::Success, Some("a"));
        assert_eq!(detector.signal(), None);
        detector.record_action(ActionStatus::Success, Some("a"));
        assert_eq!(detector.signal(), Some(StuckTrigger::IdenticalObservations));
    }

    #[test]
    fn window_slides_past_old_fingerprints() {
        let mut detector = StuckDetector::new(3);
        for fingerprint in ["a", "b", "a", "c", "c"] {
            detector.record_action(ActionStatus::Success, Some(fingerprint));
        }
        assert_eq!(detector.signal(), None);
        detector.record_action(ActionStatus::Success, Some("c"));
        assert_eq!(detector.signal(), Some(StuckTrigger::IdenticalObservations));
    }

    #[test]
    fn failure_streak_signals_and_success_resets_it() {
        let mut detector = StuckDetector::new(3);
        detector.record_action(ActionStatus::Failed, Some("a"));
        detector.record_action(ActionStatus::Timeout, Some("b"));
        detector.record_action(ActionStatus::Success, Some("c"));
        assert_eq!(detector.consecutive_failures(), 0);

        detector.record_action(ActionStatus::Failed, Some("d"));
        detector.record_action(ActionStatus::Failed, Some("e"));
        assert_eq!(detector.signal(), None);
        detector.record_action(ActionStatus::Failed, Some("f"));
        assert_eq!(detector.signal(), Some(StuckTrigger::ConsecutiveFailures));
    }

    #[test]
    fn successful_recovery_clears_both_conditions() {
        let mut detector = StuckDetector::new(3);
        for _ in 0..3 {
            detector.record_action(ActionStatus::Failed, Some("same"));
        }
        assert!(detector.signal().is_some());

        detector.record_recovery_started();
        detector.record_recovery_result(ActionStatus::Success);
        assert_eq!(detector.signal(), None);

        detector.record_step_completed();
        assert!(!detector.recovery_spent());
    }

    #[test]
    fn failed_recovery_keeps_the_recovery_spent() {
        let mut detector = StuckDetector::new(3);
        for _ in 0..3 {
            detector.record_action(ActionStatus::Failed, Some("same"));
        }
        detector.record_recovery_started();
        detector.record_recovery_result(ActionStatus::Failed);
        detector.record_step_completed();

        assert!(detector.recovery_spent());
        assert_eq!(detector.signal(), Some(StuckTrigger::IdenticalObservations));
    }

    #[test]
    fn zero_window_is_treated_as_one() {
        let mut detector = StuckDetector::new(0);
        assert_eq!(detector.window(), 1);
        detector.record_action(ActionStatus::Success, Some("a"));
        assert_eq!(detector.signal(), Some(StuckTrigger::IdenticalObservations));
    }
}
