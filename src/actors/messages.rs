//! Message types for actor communication
//!
//! Commands go to a specific actor over mpsc with an optional oneshot
//! response channel; alert events flow outward to the dispatcher.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::Priority;
use crate::tracker::RuleSnapshot;

/// Outbound notification event, handed to the external dispatcher.
///
/// At most one `Fire` and one `Resolve` are emitted per firing episode
/// (optional re-notification aside); delivery, retry and confirmation are
/// the dispatcher's problem.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AlertEvent {
    Fire {
        rule: String,
        value: f64,
        at: DateTime<Utc>,
        message: String,
        priority: Priority,
    },
    Resolve {
        rule: String,
        at: DateTime<Utc>,
    },
}

impl AlertEvent {
    pub fn rule(&self) -> &str {
        match self {
            AlertEvent::Fire { rule, .. } | AlertEvent::Resolve { rule, .. } => rule,
        }
    }
}

/// Commands accepted by the scheduler actor.
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Read-only snapshot of all rule states (dashboard boundary)
    CurrentStates {
        respond_to: oneshot::Sender<HashMap<String, RuleSnapshot>>,
    },

    /// Run one polling cycle immediately, bypassing the interval timer
    PollNow {
        respond_to: oneshot::Sender<CycleStats>,
    },

    /// Gracefully shut down; cancels in-flight queries
    Shutdown,
}

/// Summary of one polling cycle, mainly for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Generation the whole cycle was evaluated against
    pub generation: u64,

    /// Rules whose query completed before the cycle deadline
    pub completed: usize,

    /// Rules treated as timed out for this cycle
    pub timed_out: usize,

    /// Notification events emitted
    pub events: usize,
}
