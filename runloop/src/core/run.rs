//! Run snapshot and the event fold that derives it.
//!
//! A [`Run`] is never edited directly: the controller appends an event and
//! then applies that same event here, and `rebuild` applies every event of the
//! log in order. Both paths go through [`Run::apply`], so a rebuilt run is
//! identical to the live one at the same log head.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::event::{Event, EventBody};
use crate::core::policy::SafeModeConfig;
use crate::core::stuck::StuckDetector;
use crate::core::types::{ActionProposal, ActionStatus, PolicyVerdict, RunStatus};
use crate::error::EngineError;

/// Counters folded from the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub planner_calls: u32,
    pub planner_retries: u32,
    pub policy_rejections: u32,
    pub actions: u32,
    pub action_failures: u32,
    pub recoveries: u32,
}

/// A proposal held until an operator confirms or denies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub step: u32,
    pub proposal: ActionProposal,
}

/// How far the in-flight step got with its side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPhase {
    /// No action started yet; the step can be re-planned safely.
    NotStarted,
    /// An action (or recovery action) started and has no recorded result.
    Started { recovery: bool },
    /// The last started action has a recorded result.
    Settled,
}

/// A step that has started but not committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightStep {
    pub step: u32,
    pub phase: ActionPhase,
}

/// Where a run currently stands. Derived; the event log is the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub goal: String,
    pub status: RunStatus,
    /// Number of committed steps; the next step is `current_step + 1`.
    pub current_step: u32,
    pub max_steps: u32,
    pub safe_mode: SafeModeConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Sequence number of the last folded event.
    pub last_sequence_no: u64,
    /// Why the run paused, completed or failed.
    pub reason: Option<String>,
    pub summary: Option<String>,
    pub pending_confirmation: Option<PendingConfirmation>,
    pub in_flight: Option<InFlightStep>,
    pub stuck: StuckDetector,
    pub metrics: RunMetrics,
}

impl Run {
    /// Start a fold from the first event of a log, which must be `run_created`.
    pub fn from_created(event: &Event) -> Result<Self, EngineError> {
        if event.sequence_no != 1 {
            return Err(EngineError::SequenceViolation {
                run_id: event.run_id.clone(),
                expected: 1,
                actual: event.sequence_no,
            });
        }
        let body = decode(event)?;
        let EventBody::RunCreated {
            goal,
            max_steps,
            safe_mode,
            stuck_window,
        } = body
        else {
            return Err(invalid(event, "log must start with run_created"));
        };
        Ok(Self {
            run_id: event.run_id.clone(),
            goal,
            status: RunStatus::Created,
            current_step: 0,
            max_steps,
            safe_mode,
            created_at: event.timestamp,
            updated_at: event.timestamp,
            last_sequence_no: event.sequence_no,
            reason: None,
            summary: None,
            pending_confirmation: None,
            in_flight: None,
            stuck: StuckDetector::new(stuck_window),
            metrics: RunMetrics::default(),
        })
    }

    /// Fold a complete, in-memory event sequence. `None` for an empty log.
    pub fn from_events<'a, I>(events: I) -> Result<Option<Self>, EngineError>
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut run: Option<Run> = None;
        for event in events {
            match run.as_mut() {
                None => run = Some(Run::from_created(event)?),
                Some(run) => run.apply(event)?,
            }
        }
        Ok(run)
    }

    pub fn next_step(&self) -> u32 {
        self.current_step + 1
    }

    /// Apply one event. Rejects gaps, foreign events and impossible lifecycles.
    pub fn apply(&mut self, event: &Event) -> Result<(), EngineError> {
        if event.run_id != self.run_id {
            return Err(invalid(
                event,
                &format!("event belongs to run '{}'", event.run_id),
            ));
        }
        let expected = self.last_sequence_no + 1;
        if event.sequence_no != expected {
            return Err(EngineError::SequenceViolation {
                run_id: self.run_id.clone(),
                expected,
                actual: event.sequence_no,
            });
        }
        if self.status.is_terminal() {
            return Err(invalid(event, &format!("run already {}", self.status)));
        }

        match decode(event)? {
            EventBody::RunCreated { .. } => {
                return Err(invalid(event, "duplicate run_created"));
            }
            EventBody::StepStarted { .. } => {
                if event.step_index != self.next_step() {
                    return Err(invalid(
                        event,
                        &format!(
                            "step {} started but next step is {}",
                            event.step_index,
                            self.next_step()
                        ),
                    ));
                }
                if self.in_flight.is_some() {
                    return Err(invalid(event, "previous step has not completed"));
                }
                match self.status {
                    RunStatus::Running => {}
                    RunStatus::Created => self.transition(event, RunStatus::Running)?,
                    status => {
                        return Err(invalid(event, &format!("step started while {status}")));
                    }
                }
                self.in_flight = Some(InFlightStep {
                    step: event.step_index,
                    phase: ActionPhase::NotStarted,
                });
            }
            EventBody::PlanRequested { .. } => {
                self.require_in_flight(event)?;
                self.metrics.planner_calls += 1;
            }
            EventBody::PlanRetry { .. } => {
                self.require_in_flight(event)?;
                self.metrics.planner_retries += 1;
            }
            EventBody::PlanReceived { .. } => {
                self.require_in_flight(event)?;
            }
            EventBody::PolicyDecision { verdict, .. } => {
                self.require_in_flight(event)?;
                if verdict == PolicyVerdict::Rejected {
                    self.metrics.policy_rejections += 1;
                }
            }
            EventBody::ActionStarted { .. } => {
                self.start_action(event, false)?;
                self.metrics.actions += 1;
            }
            EventBody::RecoveryTriggered { .. } => {
                self.start_action(event, true)?;
                self.stuck.record_recovery_started();
                self.metrics.recoveries += 1;
            }
            EventBody::ActionResult {
                result,
                fingerprint,
                recovery,
            } => {
                let flight = self.require_in_flight(event)?;
                if flight.phase != (ActionPhase::Started { recovery }) {
                    return Err(invalid(event, "action_result without a matching start"));
                }
                if recovery {
                    self.stuck.record_recovery_result(result.status);
                } else {
                    self.stuck
                        .record_action(result.status, fingerprint.as_deref());
                }
                if result.status != ActionStatus::Success {
                    self.metrics.action_failures += 1;
                }
                self.set_phase(ActionPhase::Settled);
            }
            EventBody::StepCompleted {} => {
                let flight = self.require_in_flight(event)?;
                if matches!(flight.phase, ActionPhase::Started { .. }) {
                    return Err(invalid(event, "step completed with an unsettled action"));
                }
                self.current_step = flight.step;
                self.in_flight = None;
                self.pending_confirmation = None;
                self.stuck.record_step_completed();
            }
            EventBody::Paused { reason, pending } => {
                self.transition(event, RunStatus::Paused)?;
                self.reason = Some(reason);
                match pending {
                    Some(proposal) => {
                        let flight = self.require_in_flight(event)?;
                        self.pending_confirmation = Some(PendingConfirmation {
                            step: flight.step,
                            proposal,
                        });
                    }
                    None => {
                        if matches!(
                            self.in_flight,
                            Some(InFlightStep {
                                phase: ActionPhase::Started { .. } | ActionPhase::Settled,
                                ..
                            })
                        ) {
                            return Err(invalid(event, "pause inside a step with side effects"));
                        }
                        self.in_flight = None;
                        self.pending_confirmation = None;
                    }
                }
            }
            EventBody::Resumed { .. } => {
                self.transition(event, RunStatus::Running)?;
                self.reason = None;
                self.pending_confirmation = None;
            }
            EventBody::Completed { reason, summary } => {
                self.transition(event, RunStatus::Completed)?;
                self.reason = Some(reason);
                self.summary = summary;
            }
            EventBody::Failed { reason, detail } => {
                self.transition(event, RunStatus::Failed)?;
                self.reason = Some(reason);
                self.summary = detail;
            }
        }

        self.last_sequence_no = event.sequence_no;
        self.updated_at = event.timestamp;
        Ok(())
    }

    fn transition(&mut self, event: &Event, next: RunStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(invalid(
                event,
                &format!(
                    "{} cannot move from {} to {}",
                    event.kind, self.status, next
                ),
            ));
        }
        self.status = next;
        Ok(())
    }

    fn require_in_flight(&self, event: &Event) -> Result<InFlightStep, EngineError> {
        match self.in_flight {
            Some(flight) if flight.step == event.step_index => Ok(flight),
            Some(flight) => Err(invalid(
                event,
                &format!(
                    "event for step {} while step {} is in flight",
                    event.step_index, flight.step
                ),
            )),
            None => Err(invalid(event, &format!("{} outside of a step", event.kind))),
        }
    }

    fn start_action(&mut self, event: &Event, recovery: bool) -> Result<(), EngineError> {
        let flight = self.require_in_flight(event)?;
        if matches!(flight.phase, ActionPhase::Started { .. }) {
            return Err(invalid(event, "action started while another is unsettled"));
        }
        if self.status != RunStatus::Running {
            return Err(invalid(
                event,
                &format!("action started while {}", self.status),
            ));
        }
        self.set_phase(ActionPhase::Started { recovery });
        Ok(())
    }

    fn set_phase(&mut self, phase: ActionPhase) {
        if let Some(flight) = self.in_flight.as_mut() {
            flight.phase = phase;
        }
    }
}

fn decode(event: &Event) -> Result<EventBody, EngineError> {
    event
        .body()
        .map_err(|err| invalid(event, &format!("{err:#}")))
}

fn invalid(event: &Event, detail: &str) -> EngineError {
    EngineError::InvalidTransition {
        run_id: event.run_id.clone(),
        sequence_no: event.sequence_no,
        detail: detail.to_string(),
    }
}
