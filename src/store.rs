//! Config store: the currently active rule generation
//!
//! The active rule set is an immutable snapshot behind a watch channel.
//! `publish` builds the next generation completely, validates it, and swaps
//! it in one step; readers always observe a whole generation, never a
//! partially updated rule list. In-flight polling cycles keep the `Arc` to
//! the generation they started with and finish unaffected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::config::{compile_rules, ConfigError, Rule, RuleConfig};

/// One immutable, versioned snapshot of the full rule set.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Monotonically increasing generation counter
    pub seq: u64,

    pub rules: Vec<Arc<Rule>>,
}

impl Generation {
    fn empty() -> Self {
        Self { seq: 0, rules: Vec::new() }
    }
}

/// Holds the active [`Generation`]; read-shared, single-writer.
///
/// The scheduler reads `current()` once per cycle; the file watcher is the
/// only caller of `publish`. Neither path ever blocks the other.
pub struct ConfigStore {
    tx: watch::Sender<Arc<Generation>>,
    seq: AtomicU64,
}

impl ConfigStore {
    /// Create a store with an empty generation zero.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Generation::empty()));
        Self { tx, seq: AtomicU64::new(0) }
    }

    /// Validate a rule set and atomically swap it in as the next generation.
    ///
    /// On validation failure the previous generation stays active and the
    /// error is returned for the caller to surface.
    #[instrument(skip(self, rules), fields(rules = rules.len()))]
    pub fn publish(&self, rules: &[RuleConfig]) -> Result<u64, ConfigError> {
        let compiled = compile_rules(rules)?;

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = Arc::new(Generation {
            seq,
            rules: compiled.into_iter().map(Arc::new).collect(),
        });

        debug!("publishing generation {seq}");
        self.tx.send_replace(generation);
        Ok(seq)
    }

    /// Non-blocking read of the active generation.
    pub fn current(&self) -> Arc<Generation> {
        self.tx.borrow().clone()
    }

    /// Subscribe to generation swaps.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Generation>> {
        self.tx.subscribe()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}
