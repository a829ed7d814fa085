//! Actor-based alert engine
//!
//! Each actor runs as an independent async task communicating via Tokio
//! channels.
//!
//! ```text
//!   config file ──▶ ConfigWatcher ──publish──▶ ConfigStore
//!                                                  │ current() once per tick
//!                                                  ▼
//!                                           SchedulerActor
//!                                    ┌─────────────┼─────────────┐
//!                                    ▼             ▼             ▼
//!                               QueryClient   QueryClient   QueryClient   (bounded pool)
//!                                    └─────────────┼─────────────┘
//!                                                  ▼
//!                                          AlertStateTracker
//!                                                  │ fire / resolve
//!                                                  ▼
//!                                             dispatcher
//! ```
//!
//! The config-reload path never shares a lock with a polling cycle: the
//! watcher publishes a complete generation and the scheduler picks it up at
//! its next tick.

pub mod messages;
pub mod scheduler;
pub mod watcher;
