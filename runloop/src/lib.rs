//! Run-orchestration engine for long-running, step-wise automation.
//!
//! A run pursues one goal through discrete steps: observe, plan, policy check,
//! execute, record. Every sub-step is appended to a durable per-run event log
//! before the engine acts on it, which makes runs pausable, resumable after a
//! crash, and replayable for audit. The architecture keeps a strict split:
//!
//! - **[`core`]**: pure, deterministic logic (event fold, safe-mode policy,
//!   stuck detection, retry schedule). No I/O, fully testable in isolation.
//! - **[`io`]**: side effects (event log, snapshots, config) and the adapter
//!   traits for planner, executor and observer.
//!
//! Orchestration modules ([`start`], [`step`], [`looping`], [`resume`],
//! [`replay`]) coordinate core logic with I/O.

pub mod core;
pub mod error;
pub mod io;
pub mod logging;
pub mod looping;
pub mod replay;
pub mod resume;
pub mod signal;
pub mod start;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::EngineError;
