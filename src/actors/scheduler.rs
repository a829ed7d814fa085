//! SchedulerActor - drives periodic rule evaluation
//!
//! Each tick the actor snapshots the active generation once, fans out one
//! backend query per rule with bounded concurrency, and applies every
//! completed (or timed-out) result to the alert state tracker before the
//! cycle ends. The tracker is owned by this actor, so per-rule state
//! transitions are strictly sequential: cycle N+1 can only start after every
//! result of cycle N has been applied.
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → snapshot generation → fan out queries → evaluate → tracker → AlertEvents
//!     ↑
//!     └─── Commands (CurrentStates, PollNow, Shutdown)
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout_at, Instant};
use tracing::{debug, instrument, trace, warn};

use crate::config::{EngineSettings, Rule};
use crate::evaluator::{self, BreachSignal, Outcome};
use crate::query::{QueryClient, QueryError};
use crate::store::ConfigStore;
use crate::tracker::{AlertStateTracker, Observation, RuleSnapshot};

use super::messages::{AlertEvent, CycleStats, SchedulerCommand};

/// Actor that owns the polling loop and the alert state tracker.
pub struct SchedulerActor {
    settings: EngineSettings,

    /// Source of the active rule generation (read once per cycle)
    store: Arc<ConfigStore>,

    /// Backend query client, shared by the worker pool
    client: Arc<dyn QueryClient>,

    /// Exclusively owned per-rule alert state
    tracker: AlertStateTracker,

    command_rx: mpsc::Receiver<SchedulerCommand>,

    /// Outbound fire/resolve events for the dispatcher
    event_tx: mpsc::Sender<AlertEvent>,
}

impl SchedulerActor {
    pub fn new(
        settings: EngineSettings,
        store: Arc<ConfigStore>,
        client: Arc<dyn QueryClient>,
        command_rx: mpsc::Receiver<SchedulerCommand>,
        event_tx: mpsc::Sender<AlertEvent>,
    ) -> Self {
        Self {
            settings,
            store,
            client,
            tracker: AlertStateTracker::new(),
            command_rx,
            event_tx,
        }
    }

    /// Run the actor's main loop until shutdown.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting scheduler");

        let mut ticker = interval(self.settings.tick);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.run_cycle().await;
                    trace!(?stats, "cycle complete");
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SchedulerCommand::CurrentStates { respond_to } => {
                            let _ = respond_to.send(self.tracker.snapshot());
                        }

                        SchedulerCommand::PollNow { respond_to } => {
                            debug!("received PollNow command");
                            let stats = self.run_cycle().await;
                            let _ = respond_to.send(stats);
                        }

                        SchedulerCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("scheduler stopped");
    }

    /// Execute one full polling cycle against a single generation snapshot.
    async fn run_cycle(&mut self) -> CycleStats {
        let generation = self.store.current();
        let cycle_start = Utc::now();

        let mut stats = CycleStats { generation: generation.seq, ..Default::default() };

        // fan out with a worker-pool ceiling so a large rule set cannot
        // overwhelm the backend
        let semaphore = Arc::new(Semaphore::new(self.settings.max_in_flight));
        let mut in_flight: JoinSet<(Arc<Rule>, Result<Vec<crate::Series>, QueryError>)> =
            JoinSet::new();

        for rule in &generation.rules {
            let rule = Arc::clone(rule);
            let client = Arc::clone(&self.client);
            let semaphore = Arc::clone(&semaphore);
            in_flight.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("query semaphore closed");
                let result = client.execute(&rule.query, cycle_start).await;
                (rule, result)
            });
        }

        let deadline = Instant::now() + self.settings.deadline;
        let mut seen: HashSet<String> = HashSet::with_capacity(generation.rules.len());

        loop {
            match timeout_at(deadline, in_flight.join_next()).await {
                Ok(Some(Ok((rule, result)))) => {
                    seen.insert(rule.name.clone());
                    stats.completed += 1;
                    let observation = classify(&rule, result);
                    self.record(&rule, observation, &mut stats).await;
                }
                Ok(Some(Err(join_err))) => {
                    warn!("query task failed: {join_err}");
                }
                Ok(None) => break,
                Err(_) => {
                    // cycle deadline passed; stragglers must never block the
                    // next tick
                    in_flight.abort_all();
                    break;
                }
            }
        }

        // rules whose query did not complete count as a timeout this cycle
        for rule in &generation.rules {
            if !seen.contains(&rule.name) {
                trace!(rule = %rule.name, "query missed the cycle deadline");
                stats.timed_out += 1;
                self.record(rule, Observation::Transient, &mut stats).await;
            }
        }

        let active: HashSet<&str> = generation.rules.iter().map(|r| r.name.as_str()).collect();
        self.tracker.sweep(&active);

        stats
    }

    async fn record(&mut self, rule: &Rule, observation: Observation, stats: &mut CycleStats) {
        let Some(event) = self.tracker.apply(rule, observation, Utc::now()) else {
            return;
        };

        stats.events += 1;
        debug!(rule = %event.rule(), "emitting {event:?}");
        // block until the dispatcher has room; dropping a Fire or Resolve
        // here would lose it forever, the tracker has already transitioned
        if let Err(e) = self.event_tx.send(event).await {
            warn!("failed to hand event to dispatcher: {e}");
        }
    }
}

/// Map a query result onto the tracker's observation model.
///
/// Transient backend errors are "no observation"; malformed queries and
/// missing data are non-breaching diagnostics, except that a rule may opt
/// into treating missing data as a breach.
fn classify(rule: &Rule, result: Result<Vec<crate::Series>, QueryError>) -> Observation {
    let no_data = |error: QueryError| {
        if rule.no_data_breaches {
            Observation::Signal(BreachSignal {
                breached: true,
                value: f64::NAN,
                at: Utc::now(),
            })
        } else {
            Observation::EvalError(error.to_string())
        }
    };

    match result {
        Ok(series) => match evaluator::evaluate(rule, &series, Utc::now()) {
            Outcome::Signal(signal) => Observation::Signal(signal),
            Outcome::NoData => no_data(QueryError::EmptyResult),
        },
        Err(e) if e.is_transient() => Observation::Transient,
        Err(e @ QueryError::EmptyResult) => no_data(e),
        Err(e) => Observation::EvalError(e.to_string()),
    }
}

/// Handle for controlling the scheduler actor.
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Spawn the scheduler as a tokio task and return a handle.
    pub fn spawn(
        settings: EngineSettings,
        store: Arc<ConfigStore>,
        client: Arc<dyn QueryClient>,
        event_tx: mpsc::Sender<AlertEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = SchedulerActor::new(settings, store, client, cmd_rx, event_tx);
        tokio::spawn(actor.run());
        Self { sender: cmd_tx }
    }

    /// Read-only snapshot of all rule states (dashboard boundary).
    pub async fn current_states(
        &self,
    ) -> Option<std::collections::HashMap<String, RuleSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::CurrentStates { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Run one polling cycle immediately.
    pub async fn poll_now(&self) -> Option<CycleStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::PollNow { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Gracefully shut down the scheduler.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(SchedulerCommand::Shutdown).await;
    }
}
