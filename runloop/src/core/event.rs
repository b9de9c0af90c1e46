//! Run events: the immutable, ordered record of everything that happened.
//!
//! On disk an event is one JSON object with a `kind` tag and a kind-specific
//! `payload`. [`EventBody`] is the typed view of `(kind, payload)`; the
//! controller builds events from a body and the fold reads them back through
//! [`Event::body`].

use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::policy::SafeModeConfig;
use crate::core::stuck::StuckTrigger;
use crate::core::types::{
    ActionProposal, ActionResult, Arguments, PolicyVerdict, ResumeDecision,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunCreated,
    StepStarted,
    PlanRequested,
    PlanReceived,
    PlanRetry,
    PolicyDecision,
    ActionStarted,
    ActionResult,
    RecoveryTriggered,
    StepCompleted,
    Paused,
    Resumed,
    Completed,
    Failed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::RunCreated => "run_created",
            EventKind::StepStarted => "step_started",
            EventKind::PlanRequested => "plan_requested",
            EventKind::PlanReceived => "plan_received",
            EventKind::PlanRetry => "plan_retry",
            EventKind::PolicyDecision => "policy_decision",
            EventKind::ActionStarted => "action_started",
            EventKind::ActionResult => "action_result",
            EventKind::RecoveryTriggered => "recovery_triggered",
            EventKind::StepCompleted => "step_completed",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub run_id: String,
    pub step_index: u32,
    /// Replay order key: `1, 2, 3, ...` with no gaps.
    pub sequence_no: u64,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl Event {
    pub fn new(
        run_id: &str,
        step_index: u32,
        sequence_no: u64,
        timestamp: DateTime<Utc>,
        body: &EventBody,
    ) -> Result<Self> {
        let (kind, payload) = body.split()?;
        Ok(Self {
            run_id: run_id.to_string(),
            step_index,
            sequence_no,
            kind,
            timestamp,
            payload,
        })
    }

    /// Typed view of the payload.
    pub fn body(&self) -> Result<EventBody> {
        let tagged = json!({ "kind": self.kind, "payload": self.payload });
        serde_json::from_value(tagged).with_context(|| {
            format!(
                "decode {} payload at sequence {}",
                self.kind, self.sequence_no
            )
        })
    }
}

/// Typed event payloads, one variant per [`EventKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventBody {
    RunCreated {
        goal: String,
        max_steps: u32,
        safe_mode: SafeModeConfig,
        stuck_window: usize,
    },
    StepStarted {
        /// Fingerprint of the observation handed to the planner.
        fingerprint: String,
    },
    PlanRequested {
        attempt: u32,
    },
    PlanReceived {
        proposal: ActionProposal,
        attempts: u32,
    },
    PlanRetry {
        attempt: u32,
        error: String,
        /// `None` when this was the last attempt.
        #[serde(default)]
        retry_in_ms: Option<u64>,
    },
    PolicyDecision {
        tool_name: String,
        verdict: PolicyVerdict,
        reason: String,
    },
    ActionStarted {
        tool_name: String,
        arguments: Arguments,
    },
    ActionResult {
        #[serde(flatten)]
        result: ActionResult,
        /// Fingerprint observed after the action.
        #[serde(default)]
        fingerprint: Option<String>,
        /// True for the result of a recovery action.
        #[serde(default)]
        recovery: bool,
    },
    RecoveryTriggered {
        trigger: StuckTrigger,
        tool_name: String,
        arguments: Arguments,
    },
    StepCompleted {},
    Paused {
        reason: String,
        /// Proposal held for operator confirmation.
        #[serde(default)]
        pending: Option<ActionProposal>,
    },
    Resumed {
        decision: ResumeDecision,
    },
    Completed {
        reason: String,
        #[serde(default)]
        summary: Option<String>,
    },
    Failed {
        reason: String,
        #[serde(default)]
        detail: Option<String>,
    },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::RunCreated { .. } => EventKind::RunCreated,
            EventBody::StepStarted { .. } => EventKind::StepStarted,
            EventBody::PlanRequested { .. } => EventKind::PlanRequested,
            EventBody::PlanReceived { .. } => EventKind::PlanReceived,
            EventBody::PlanRetry { .. } => EventKind::PlanRetry,
            EventBody::PolicyDecision { .. } => EventKind::PolicyDecision,
            EventBody::ActionStarted { .. } => EventKind::ActionStarted,
            EventBody::ActionResult { .. } => EventKind::ActionResult,
            EventBody::RecoveryTriggered { .. } => EventKind::RecoveryTriggered,
            EventBody::StepCompleted {} => EventKind::StepCompleted,
            EventBody::Paused { .. } => EventKind::Paused,
            EventBody::Resumed { .. } => EventKind::Resumed,
            EventBody::Completed { .. } => EventKind::Completed,
            EventBody::Failed { .. } => EventKind::Failed,
        }
    }

    fn split(&self) -> Result<(EventKind, Value)> {
        let mut tagged = serde_json::to_value(self).context("serialize event body")?;
        let payload = tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or_else(|| json!({}));
        Ok((self.kind(), payload))
    }
}
