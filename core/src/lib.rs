#![deny(missing_docs)]
//! remind_core: shared building blocks (config, KV, logging, schedules,
//! dispatch, reconnect policy).

/// Configuration helpers (AppId, dirs, load_or_init, etc.)
pub mod cfg;
/// Simple file-backed KV store with serde helpers.
pub mod store;
/// Tracing/log initialization helpers.
pub mod logx;
/// Error taxonomy shared by the scheduler, dispatch and gateway paths.
pub mod error;
/// Wall-clock abstraction used by schedules and countdowns.
pub mod clock;
/// Schedule configuration, time-to-target math and countdowns.
pub mod schedule;
/// Persistence of schedule configs and dispatch history.
pub mod persist;
/// Dispatch invoker with its busy guard.
pub mod dispatch;
/// Shared scheduler service (one timer pair per feature area).
pub mod scheduler;
/// Gateway reconnect policy state machine.
pub mod reconnect;
/// Member roster and due-date selection.
pub mod members;
/// Messaging transport contract and the bulk sender built on it.
pub mod transport;
/// Per-recipient reporting over the dispatch history.
pub mod reports;
