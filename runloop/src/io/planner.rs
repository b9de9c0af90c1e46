//! Planner adapter boundary.
//!
//! A planner is an opaque decision oracle: given the run and the latest
//! observation it proposes one action. Adapters make a single attempt per
//! call; the controller owns retry and backoff (see [`crate::step`]).

use std::time::Duration;

use thiserror::Error;

use crate::core::run::Run;
use crate::core::types::ActionProposal;
use crate::io::observer::Observation;
use crate::signal::CancelToken;

/// Input for one proposal attempt.
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub run: &'a Run,
    pub observation: &'a Observation,
    /// Step the proposal is for.
    pub step: u32,
    /// 1-indexed attempt within the step.
    pub attempt: u32,
    pub timeout: Duration,
    pub cancel: &'a CancelToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlannerError {
    #[error("planner unavailable: {0}")]
    Unavailable(String),

    #[error("planner timed out after {0:?}")]
    Timeout(Duration),

    #[error("planner call cancelled")]
    Cancelled,
}

pub trait Planner {
    fn propose(&self, request: &PlanRequest<'_>) -> Result<ActionProposal, PlannerError>;
}

impl<P: Planner + ?Sized> Planner for &P {
    fn propose(&self, request: &PlanRequest<'_>) -> Result<ActionProposal, PlannerError> {
        (**self).propose(request)
    }
}
