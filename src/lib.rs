//! Lightweight service-supervisor core: a state machine for individual
//! services, a durable task engine for multi-step changes, and a plan
//! combiner that merges layered YAML config into a single desired state.

#![warn(unused_crate_dependencies)]
#[cfg(test)]
use assert_cmd as _;
#[cfg(test)]
use predicates as _;
#[cfg(test)]
use tempfile as _;

/// Errors.
pub mod error;

/// Shared constants and defaults.
pub mod constants;

/// Workload identity resolution (user/group, or local).
pub mod identity;

/// Layered config combination into a single plan.
pub mod plan;

/// Subreaper and zombie-reaping.
pub mod reaper;

/// In-memory ring buffer log with independent reader cursors.
pub mod ringlog;

/// Durable state tree: changes, tasks, and notices.
pub mod state;

/// Dispatches runnable tasks from the state tree to registered handlers.
pub mod taskrunner;

/// Per-service state machine and lifecycle control.
pub mod service;

/// Check-manager interface contract.
pub mod check;

/// Boots and drives the supervisor core.
pub mod overlord;

/// Runtime paths and modes.
pub mod runtime;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;

/// Installs a `tracing-subscriber` `EnvFilter` subscriber for binaries and
/// integration tests embedding this crate. Respects `RUST_LOG`, defaulting
/// to `info`. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
