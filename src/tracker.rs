//! Per-rule alert state machine
//!
//! Transitions per poll cycle, driven by a [`BreachSignal`]:
//!
//! ```text
//! Ok       + breach                  → Pending   (debounce timer starts)
//! Pending  + breach, elapsed ≥ for   → Firing    (fire event, once)
//! Pending  + no breach               → Ok        (timer cancelled)
//! Firing   + no breach               → Resolved  (resolve event, once)
//! Resolved + next observation        → Ok        (transient bookkeeping state)
//! ```
//!
//! Transient backend errors are "no observation this cycle" and leave state
//! untouched, so an outage can neither resolve a firing rule nor restart a
//! pending timer. Debounce is a wall-clock comparison against the passed-in
//! `now`, never a sleeping task, which makes the machine directly testable
//! with fabricated timestamps.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::actors::messages::AlertEvent;
use crate::config::Rule;
use crate::evaluator::BreachSignal;

/// Phase of a rule's alert lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPhase {
    Ok,
    Pending,
    Firing,
    Resolved,
}

/// What the scheduler observed for one rule in one cycle.
#[derive(Debug, Clone)]
pub enum Observation {
    /// Normal evaluation result
    Signal(BreachSignal),

    /// Malformed query or empty result: non-breaching, surfaced as diagnostic
    EvalError(String),

    /// Timeout or unreachable backend: no observation this cycle
    Transient,
}

/// Read-only view of one rule's state for the dashboard boundary.
#[derive(Debug, Clone, Serialize)]
pub struct RuleSnapshot {
    pub rule: String,
    pub phase: AlertPhase,
    pub last_value: Option<f64>,

    /// When the current phase began
    pub since: DateTime<Utc>,

    /// Last query-evaluation diagnostic, cleared on the next good observation
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct RuleState {
    phase: AlertPhase,
    phase_since: DateTime<Utc>,
    pending_since: Option<DateTime<Utc>>,
    last_value: Option<f64>,
    last_notified: Option<DateTime<Utc>>,
    last_error: Option<String>,

    /// Consecutive cycles the owning rule was absent from the active generation
    missing_cycles: u8,
}

impl RuleState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            phase: AlertPhase::Ok,
            phase_since: now,
            pending_since: None,
            last_value: None,
            last_notified: None,
            last_error: None,
            missing_cycles: 0,
        }
    }

    fn set_phase(&mut self, phase: AlertPhase, now: DateTime<Utc>) {
        self.phase = phase;
        self.phase_since = now;
    }
}

/// Owns the per-rule alert state map exclusively.
///
/// Only the scheduler's cycle-processing path touches this, so per-rule
/// transitions are strictly sequential without any locking.
#[derive(Debug, Default)]
pub struct AlertStateTracker {
    states: HashMap<String, RuleState>,
}

impl AlertStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one cycle's observation for a rule; returns the notification
    /// event to emit, if the transition crossed a notify threshold.
    pub fn apply(
        &mut self,
        rule: &Rule,
        observation: Observation,
        now: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        let state = self
            .states
            .entry(rule.name.clone())
            .or_insert_with(|| RuleState::new(now));
        state.missing_cycles = 0;

        match observation {
            Observation::Transient => None,

            Observation::EvalError(message) => {
                if state.last_error.as_deref() != Some(message.as_str()) {
                    warn!(rule = %rule.name, "query evaluation failed: {message}");
                }
                state.last_error = Some(message);
                let value = state.last_value.unwrap_or(f64::NAN);
                Self::transition(state, rule, false, value, now)
            }

            Observation::Signal(signal) => {
                state.last_error = None;
                state.last_value = Some(signal.value);
                Self::transition(state, rule, signal.breached, signal.value, now)
            }
        }
    }

    fn transition(
        state: &mut RuleState,
        rule: &Rule,
        breached: bool,
        value: f64,
        now: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        // Resolved is transient bookkeeping; it collapses to Ok on the next
        // observation before the regular table applies.
        if state.phase == AlertPhase::Resolved {
            state.set_phase(AlertPhase::Ok, now);
            state.pending_since = None;
        }

        match (state.phase, breached) {
            (AlertPhase::Ok, false) => None,

            (AlertPhase::Ok, true) => {
                state.set_phase(AlertPhase::Pending, now);
                state.pending_since = Some(now);
                debug!(rule = %rule.name, value, "breach observed, debounce started");
                // a zero `for` duration fires on the first breach
                Self::maybe_fire(state, rule, value, now)
            }

            (AlertPhase::Pending, true) => Self::maybe_fire(state, rule, value, now),

            (AlertPhase::Pending, false) => {
                debug!(rule = %rule.name, "breach cleared before debounce elapsed");
                state.set_phase(AlertPhase::Ok, now);
                state.pending_since = None;
                None
            }

            (AlertPhase::Firing, true) => Self::maybe_renotify(state, rule, value, now),

            (AlertPhase::Firing, false) => {
                debug!(rule = %rule.name, "firing episode resolved");
                state.set_phase(AlertPhase::Resolved, now);
                state.pending_since = None;
                Some(AlertEvent::Resolve { rule: rule.name.clone(), at: now })
            }

            // Resolved was collapsed to Ok above
            (AlertPhase::Resolved, _) => None,
        }
    }

    /// Move Pending → Firing once the breach has persisted for `for`.
    fn maybe_fire(
        state: &mut RuleState,
        rule: &Rule,
        value: f64,
        now: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        let pending_since = state.pending_since?;
        if now - pending_since < rule.for_duration {
            return None;
        }

        state.set_phase(AlertPhase::Firing, now);
        state.last_notified = Some(now);
        debug!(rule = %rule.name, value, "debounce elapsed, firing");

        Some(AlertEvent::Fire {
            rule: rule.name.clone(),
            value,
            at: now,
            message: render_message(rule, value),
            priority: rule.priority,
        })
    }

    /// Optional repeat notification while continuously firing.
    fn maybe_renotify(
        state: &mut RuleState,
        rule: &Rule,
        value: f64,
        now: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        let interval = rule.renotify?;
        let last = state.last_notified?;
        if now - last < interval {
            return None;
        }

        state.last_notified = Some(now);
        Some(AlertEvent::Fire {
            rule: rule.name.clone(),
            value,
            at: now,
            message: render_message(rule, value),
            priority: rule.priority,
        })
    }

    /// Drop state for rules that left the active generation more than one
    /// full polling cycle ago. Called once at the end of every cycle.
    pub fn sweep(&mut self, active: &HashSet<&str>) {
        self.states.retain(|name, state| {
            if active.contains(name.as_str()) {
                return true;
            }
            state.missing_cycles += 1;
            if state.missing_cycles >= 2 {
                debug!(rule = %name, "dropping state for removed rule");
                return false;
            }
            true
        });
    }

    /// Read-only snapshot for the presentation layer.
    pub fn snapshot(&self) -> HashMap<String, RuleSnapshot> {
        self.states
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    RuleSnapshot {
                        rule: name.clone(),
                        phase: state.phase,
                        last_value: state.last_value,
                        since: state.phase_since,
                        last_error: state.last_error.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn phase(&self, rule: &str) -> Option<AlertPhase> {
        self.states.get(rule).map(|s| s.phase)
    }
}

fn render_message(rule: &Rule, value: f64) -> String {
    let template = rule
        .message
        .as_deref()
        .unwrap_or("rule `{rule}`: value {value} breached threshold {op} {threshold}");

    template
        .replace("{rule}", &rule.name)
        .replace("{value}", &value.to_string())
        .replace("{threshold}", &rule.threshold.to_string())
        .replace("{op}", &rule.op.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CmpOp, Priority};
    use assert_matches::assert_matches;
    use chrono::{TimeDelta, TimeZone};

    fn rule(name: &str, threshold: f64, for_secs: i64) -> Rule {
        Rule {
            name: name.to_string(),
            query: "q".to_string(),
            op: CmpOp::Gt,
            threshold,
            for_duration: TimeDelta::seconds(for_secs),
            no_data_breaches: false,
            renotify: None,
            priority: Priority::Normal,
            message: None,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn signal(value: f64, threshold: f64, secs: i64) -> Observation {
        Observation::Signal(BreachSignal {
            breached: value > threshold,
            value,
            at: at(secs),
        })
    }

    #[test]
    fn short_breach_never_fires() {
        let mut tracker = AlertStateTracker::new();
        let r = rule("cpu-high", 80.0, 60);

        // single breach shorter than `for`, then clear
        assert!(tracker.apply(&r, signal(85.0, 80.0, 0), at(0)).is_none());
        assert_eq!(tracker.phase("cpu-high"), Some(AlertPhase::Pending));

        assert!(tracker.apply(&r, signal(50.0, 80.0, 30), at(30)).is_none());
        assert_eq!(tracker.phase("cpu-high"), Some(AlertPhase::Ok));
    }

    #[test]
    fn debounce_fires_after_sustained_breach_then_resolves() {
        // threshold >80, for=60s, tick=30s; values 85, 82, 90, 70
        let mut tracker = AlertStateTracker::new();
        let r = rule("cpu-high", 80.0, 60);

        assert!(tracker.apply(&r, signal(85.0, 80.0, 0), at(0)).is_none());
        assert_eq!(tracker.phase("cpu-high"), Some(AlertPhase::Pending));

        assert!(tracker.apply(&r, signal(82.0, 80.0, 30), at(30)).is_none());
        assert_eq!(tracker.phase("cpu-high"), Some(AlertPhase::Pending));

        let fire = tracker.apply(&r, signal(90.0, 80.0, 60), at(60));
        assert_matches!(
            fire,
            Some(AlertEvent::Fire { rule, value, .. }) if rule == "cpu-high" && value == 90.0
        );
        assert_eq!(tracker.phase("cpu-high"), Some(AlertPhase::Firing));

        let resolve = tracker.apply(&r, signal(70.0, 80.0, 90), at(90));
        assert_matches!(resolve, Some(AlertEvent::Resolve { rule, .. }) if rule == "cpu-high");
        assert_eq!(tracker.phase("cpu-high"), Some(AlertPhase::Resolved));

        // Resolved collapses to Ok on the next observation
        assert!(tracker.apply(&r, signal(70.0, 80.0, 120), at(120)).is_none());
        assert_eq!(tracker.phase("cpu-high"), Some(AlertPhase::Ok));
    }

    #[test]
    fn timeouts_do_not_advance_state() {
        // mem-high: threshold >90, for=30s; timeouts at t=0 and t=30, 95 at t=60
        let mut tracker = AlertStateTracker::new();
        let r = rule("mem-high", 90.0, 30);

        assert!(tracker.apply(&r, Observation::Transient, at(0)).is_none());
        assert_eq!(tracker.phase("mem-high"), Some(AlertPhase::Ok));

        assert!(tracker.apply(&r, Observation::Transient, at(30)).is_none());
        assert_eq!(tracker.phase("mem-high"), Some(AlertPhase::Ok));

        assert!(tracker.apply(&r, signal(95.0, 90.0, 60), at(60)).is_none());
        assert_eq!(tracker.phase("mem-high"), Some(AlertPhase::Pending));

        // breach persists → fires at t=90
        let fire = tracker.apply(&r, signal(95.0, 90.0, 90), at(90));
        assert_matches!(fire, Some(AlertEvent::Fire { .. }));
    }

    #[test]
    fn timeout_does_not_reset_pending_timer() {
        let mut tracker = AlertStateTracker::new();
        let r = rule("cpu-high", 80.0, 60);

        tracker.apply(&r, signal(85.0, 80.0, 0), at(0));
        // transient error in the middle of the debounce window
        tracker.apply(&r, Observation::Transient, at(30));
        assert_eq!(tracker.phase("cpu-high"), Some(AlertPhase::Pending));

        // behaves exactly like two consecutive breach cycles
        let fire = tracker.apply(&r, signal(85.0, 80.0, 60), at(60));
        assert_matches!(fire, Some(AlertEvent::Fire { .. }));
    }

    #[test]
    fn exactly_one_fire_and_one_resolve_per_episode() {
        let mut tracker = AlertStateTracker::new();
        let r = rule("cpu-high", 80.0, 0);
        let mut fires = 0;
        let mut resolves = 0;

        // long firing episode across many cycles
        for i in 0..10 {
            match tracker.apply(&r, signal(95.0, 80.0, i * 30), at(i * 30)) {
                Some(AlertEvent::Fire { .. }) => fires += 1,
                Some(AlertEvent::Resolve { .. }) => resolves += 1,
                None => {}
            }
        }
        match tracker.apply(&r, signal(10.0, 80.0, 300), at(300)) {
            Some(AlertEvent::Resolve { .. }) => resolves += 1,
            other => panic!("expected resolve, got {other:?}"),
        }

        assert_eq!(fires, 1);
        assert_eq!(resolves, 1);
    }

    #[test]
    fn zero_for_duration_fires_on_first_breach() {
        let mut tracker = AlertStateTracker::new();
        let r = rule("disk-full", 90.0, 0);

        let fire = tracker.apply(&r, signal(95.0, 90.0, 0), at(0));
        assert_matches!(fire, Some(AlertEvent::Fire { .. }));
        assert_eq!(tracker.phase("disk-full"), Some(AlertPhase::Firing));
    }

    #[test]
    fn eval_error_is_non_breaching_but_surfaced() {
        let mut tracker = AlertStateTracker::new();
        let r = rule("cpu-high", 80.0, 60);

        tracker.apply(&r, Observation::EvalError("malformed query: oops".to_string()), at(0));

        let snapshot = tracker.snapshot();
        let entry = &snapshot["cpu-high"];
        assert_eq!(entry.phase, AlertPhase::Ok);
        assert_eq!(entry.last_error.as_deref(), Some("malformed query: oops"));

        // a good observation clears the diagnostic
        tracker.apply(&r, signal(10.0, 80.0, 30), at(30));
        assert!(tracker.snapshot()["cpu-high"].last_error.is_none());
    }

    #[test]
    fn eval_error_resolves_a_firing_rule() {
        let mut tracker = AlertStateTracker::new();
        let r = rule("cpu-high", 80.0, 0);

        tracker.apply(&r, signal(95.0, 80.0, 0), at(0));
        assert_eq!(tracker.phase("cpu-high"), Some(AlertPhase::Firing));

        // empty result counts as "no breach" for state purposes
        let event = tracker.apply(&r, Observation::EvalError("no data".to_string()), at(30));
        assert_matches!(event, Some(AlertEvent::Resolve { .. }));
        assert_eq!(
            tracker.snapshot()["cpu-high"].last_error.as_deref(),
            Some("no data")
        );
    }

    #[test]
    fn renotify_repeats_fire_on_interval() {
        let mut tracker = AlertStateTracker::new();
        let mut r = rule("cpu-high", 80.0, 0);
        r.renotify = Some(TimeDelta::seconds(60));

        assert_matches!(
            tracker.apply(&r, signal(95.0, 80.0, 0), at(0)),
            Some(AlertEvent::Fire { .. })
        );
        // within the renotify interval: silent
        assert!(tracker.apply(&r, signal(95.0, 80.0, 30), at(30)).is_none());
        // interval elapsed: repeat notification
        assert_matches!(
            tracker.apply(&r, signal(95.0, 80.0, 60), at(60)),
            Some(AlertEvent::Fire { .. })
        );
    }

    #[test]
    fn renotify_disabled_by_default() {
        let mut tracker = AlertStateTracker::new();
        let r = rule("cpu-high", 80.0, 0);

        tracker.apply(&r, signal(95.0, 80.0, 0), at(0));
        for i in 1..20 {
            assert!(tracker.apply(&r, signal(95.0, 80.0, i * 30), at(i * 30)).is_none());
        }
    }

    #[test]
    fn sweep_drops_removed_rules_after_one_extra_cycle() {
        let mut tracker = AlertStateTracker::new();
        let r = rule("old-rule", 80.0, 60);
        tracker.apply(&r, signal(85.0, 80.0, 0), at(0));

        let empty: HashSet<&str> = HashSet::new();

        // first cycle without the rule: still visible
        tracker.sweep(&empty);
        assert!(tracker.snapshot().contains_key("old-rule"));

        // second cycle: gone
        tracker.sweep(&empty);
        assert!(!tracker.snapshot().contains_key("old-rule"));
    }

    #[test]
    fn sweep_keeps_active_rules() {
        let mut tracker = AlertStateTracker::new();
        let r = rule("cpu-high", 80.0, 60);
        tracker.apply(&r, signal(85.0, 80.0, 0), at(0));

        let active: HashSet<&str> = ["cpu-high"].into();
        for _ in 0..5 {
            tracker.sweep(&active);
        }
        assert!(tracker.snapshot().contains_key("cpu-high"));
    }

    #[test]
    fn message_template_substitution() {
        let mut r = rule("cpu-high", 80.0, 0);
        r.message = Some("{rule} hit {value} (limit {op} {threshold})".to_string());

        let mut tracker = AlertStateTracker::new();
        let event = tracker.apply(&r, signal(95.0, 80.0, 0), at(0));
        assert_matches!(
            event,
            Some(AlertEvent::Fire { message, .. }) if message == "cpu-high hit 95 (limit > 80)"
        );
    }
}
