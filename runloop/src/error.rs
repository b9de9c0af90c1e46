//! Typed engine errors.
//!
//! Orchestration code returns `anyhow::Result`; callers that need to react to a
//! specific failure use `err.downcast_ref::<EngineError>()`.

use thiserror::Error;

use crate::core::types::RunStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The log does not continue at `previous + 1`. Always fatal.
    #[error("sequence violation in run '{run_id}': expected {expected}, got {actual}")]
    SequenceViolation {
        run_id: String,
        expected: u64,
        actual: u64,
    },

    /// Operator asked to resume a run that is not resumable as requested.
    #[error("run '{run_id}' cannot be resumed from status {status}: {detail}")]
    InvalidResumeState {
        run_id: String,
        status: RunStatus,
        detail: String,
    },

    /// The log describes a lifecycle the state machine does not allow.
    #[error("invalid transition in run '{run_id}' at sequence {sequence_no}: {detail}")]
    InvalidTransition {
        run_id: String,
        sequence_no: u64,
        detail: String,
    },

    #[error("run '{0}' not found")]
    RunNotFound(String),

    /// The action executor reported misconfiguration rather than an action outcome.
    #[error("action executor failed fatally: {0}")]
    ExecutorFatal(String),
}
