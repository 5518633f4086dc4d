//! Throttler: rate-limits a named event stream to at most `max_count`
//! fires per sliding `window`, across any number of configured rules.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One `(window_duration, max_count)` rule.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleRule {
    pub window: Duration,
    pub max_count: usize,
}

/// Result of asking the throttler for permission to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireDecision {
    Allowed,
    DeferUntil(Instant),
}

/// Per-rule ring of recent fire timestamps, capped at `max_count` entries.
struct RuleState {
    rule: ThrottleRule,
    fires: VecDeque<Instant>,
}

impl RuleState {
    fn earliest_allowed(&self, now: Instant) -> Option<Instant> {
        if self.fires.len() < self.rule.max_count {
            return None;
        }
        let oldest = *self.fires.front().expect("len checked above");
        let allowed_at = oldest + self.rule.window;
        if allowed_at <= now {
            None
        } else {
            Some(allowed_at)
        }
    }

    fn record_fire(&mut self, now: Instant) {
        self.fires.push_back(now);
        while self.fires.len() > self.rule.max_count {
            self.fires.pop_front();
        }
    }
}

/// Rate-limits fires against every configured rule simultaneously. A fire
/// is allowed only if every rule would allow it; otherwise the caller gets
/// back the earliest time at which *all* rules are satisfied.
///
/// The throttler holds no timer of its own — `try_fire` is a pure function
/// of `now` and internal history; the caller (the batcher's scheduler
/// entry) is responsible for scheduling exactly one re-check at the
/// returned deadline, and must not call `try_fire` again before then.
pub struct Throttler {
    rules: Vec<RuleState>,
    deferred_until: Option<Instant>,
}

impl Throttler {
    pub fn new(rules: Vec<ThrottleRule>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|rule| RuleState { rule, fires: VecDeque::with_capacity(rule.max_count) })
                .collect(),
            deferred_until: None,
        }
    }

    /// Ask for permission to fire at `now`. A call while already deferred
    /// (a previous call returned `DeferUntil` and `now` has not yet
    /// reached it) is a no-op that returns the same deadline.
    pub fn try_fire(&mut self, now: Instant) -> FireDecision {
        if let Some(until) = self.deferred_until {
            if now < until {
                return FireDecision::DeferUntil(until);
            }
            self.deferred_until = None;
        }

        let deadline = self
            .rules
            .iter()
            .filter_map(|r| r.earliest_allowed(now))
            .max();

        match deadline {
            Some(until) => {
                self.deferred_until = Some(until);
                FireDecision::DeferUntil(until)
            }
            None => {
                for rule in &mut self.rules {
                    rule.record_fire(now);
                }
                FireDecision::Allowed
            }
        }
    }
}
