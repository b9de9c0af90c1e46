//! Shared deterministic types for the run engine.
//!
//! These types define stable contracts between the controller, the event log
//! and the adapters. They must not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque tool arguments. The engine never interprets them.
pub type Arguments = Map<String, Value>;

/// Tool name a planner uses to declare the goal reached.
pub const DONE_TOOL: &str = "done";
/// Tool name a planner uses to give up on the goal.
pub const FAIL_TOOL: &str = "fail";

/// Machine-readable reasons attached to policy decisions and lifecycle events.
pub mod reason {
    pub const STEP_BUDGET_EXHAUSTED: &str = "step_budget_exhausted";
    pub const STEP_BUDGET_REACHED: &str = "step_budget_reached";
    pub const POLICY_FORBIDDEN: &str = "policy_forbidden";
    pub const DESTRUCTIVE_BLOCKED: &str = "destructive_blocked";
    pub const NOT_ALLOWLISTED: &str = "not_allowlisted";
    pub const CONFIRMATION_REQUIRED: &str = "confirmation_required";
    pub const APPROVED: &str = "approved";
    pub const SAFE_MODE_DISABLED: &str = "safe_mode_disabled";
    pub const PLANNER_EXHAUSTED: &str = "planner_exhausted";
    pub const PLANNER_GAVE_UP: &str = "planner_gave_up";
    pub const GOAL_REACHED: &str = "goal_reached";
    pub const RECOVERY_EXHAUSTED: &str = "recovery_exhausted";
    pub const EXECUTOR_FATAL: &str = "executor_fatal";
    pub const AWAITING_CONFIRMATION: &str = "awaiting_confirmation";
    pub const OPERATOR_REQUESTED: &str = "operator_requested";
    pub const STOP_AFTER_STEP: &str = "stop_after_step";
    pub const CANCELLED: &str = "cancelled";
    pub const INTERRUPTED: &str = "interrupted";
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// `created -> running <-> paused`, `running -> completed | failed`.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::{Completed, Created, Failed, Paused, Running};
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The planner's output for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionProposal {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Arguments,
    /// Free text kept for audit only.
    #[serde(default)]
    pub rationale: String,
}

impl ActionProposal {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments: Arguments::new(),
            rationale: String::new(),
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    /// String argument lookup, used for `done`/`fail` summaries.
    pub fn str_argument(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyVerdict {
    Approved,
    Rejected,
    RequiresConfirmation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub verdict: PolicyVerdict,
    pub reason: String,
}

impl PolicyDecision {
    pub fn approved(reason: &str) -> Self {
        Self {
            verdict: PolicyVerdict::Approved,
            reason: reason.to_string(),
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self {
            verdict: PolicyVerdict::Rejected,
            reason: reason.to_string(),
        }
    }

    pub fn requires_confirmation() -> Self {
        Self {
            verdict: PolicyVerdict::RequiresConfirmation,
            reason: reason::CONFIRMATION_REQUIRED.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failed,
    Timeout,
}

/// Structured outcome of one executed action.
///
/// `error_detail` is present iff `status != Success`; use the constructors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observable_effect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl ActionResult {
    pub fn success(effect: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Success,
            observable_effect: Some(effect.into()),
            error_detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Failed,
            observable_effect: None,
            error_detail: Some(detail.into()),
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Timeout,
            observable_effect: None,
            error_detail: Some(detail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// Operator decision carried by a resume of a confirmation pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeDecision {
    /// Plain resume of an operator/cancel/interrupt pause.
    Continue,
    /// Execute the proposal that was held for confirmation.
    Confirm,
    /// Close the held step without executing anything.
    Deny,
}

/// What the controller wants to happen after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Continue,
    Pause { reason: String },
    Complete { reason: String },
    Fail { reason: String },
}

impl Directive {
    pub fn is_continue(&self) -> bool {
        matches!(self, Directive::Continue)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Directive::Continue => None,
            Directive::Pause { reason }
            | Directive::Complete { reason }
            | Directive::Fail { reason } => Some(reason),
        }
    }
}
