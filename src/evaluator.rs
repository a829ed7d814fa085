//! Pure threshold evaluation
//!
//! No side effects, no clock access: `now` is passed in so evaluation is
//! fully deterministic under test.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::Rule;
use crate::Series;

/// The boolean breach signal for one rule and one poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreachSignal {
    pub breached: bool,

    /// Representative value: the breaching sample, or the freshest sample seen
    pub value: f64,

    pub at: DateTime<Utc>,
}

/// Result of evaluating a query result against a rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Signal(BreachSignal),

    /// No usable sample at or before `now`; the caller decides whether this
    /// counts as a breach (per-rule `no_data_breaches`)
    NoData,
}

/// Evaluate a rule against the returned series.
///
/// Each series contributes its most recent sample at or before `now`. The
/// rule breaches if any of those samples satisfies the comparison; the
/// signal carries the first breaching value, otherwise the freshest value.
/// NaN samples never breach.
pub fn evaluate(rule: &Rule, series: &[Series], now: DateTime<Utc>) -> Outcome {
    let mut freshest: Option<crate::Sample> = None;

    for s in series {
        let Some(sample) = s.latest_at_or_before(now) else {
            continue;
        };

        if sample.value.is_nan() {
            warn!(rule = %rule.name, "ignoring NaN sample for breach evaluation");
        } else if rule.op.holds(sample.value, rule.threshold) {
            return Outcome::Signal(BreachSignal {
                breached: true,
                value: sample.value,
                at: sample.timestamp,
            });
        }

        if freshest.is_none_or(|f| sample.timestamp > f.timestamp) {
            freshest = Some(sample);
        }
    }

    match freshest {
        Some(sample) => Outcome::Signal(BreachSignal {
            breached: false,
            value: sample.value,
            at: sample.timestamp,
        }),
        None => Outcome::NoData,
    }
}
