//! Orchestration for a single run step.
//!
//! One step is: observe, plan (with bounded retry), policy check, execute,
//! record the result, detect stuck, commit. Every sub-step is appended to the
//! event log before the controller acts on it, and the in-memory [`Run`] only
//! changes by folding the appended event, so a crash at any point leaves a
//! log that `rebuild` turns back into the same run.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::event::EventBody;
use crate::core::policy;
use crate::core::run::Run;
use crate::core::types::{
    ActionProposal, ActionResult, Arguments, DONE_TOOL, Directive, FAIL_TOOL, PolicyVerdict,
    RunStatus, reason,
};
use crate::error::EngineError;
use crate::io::config::EngineConfig;
use crate::io::executor::{ActionExecutor, ActionRequest};
use crate::io::observer::{Observation, Observer};
use crate::io::planner::{PlanRequest, Planner, PlannerError};
use crate::io::state_store::StateStore;
use crate::signal::RunControls;

/// Everything a step needs besides the run itself.
pub struct Runtime<'a, P, X, O> {
    pub store: &'a StateStore,
    pub planner: &'a P,
    pub executor: &'a X,
    pub observer: &'a O,
    pub config: &'a EngineConfig,
    pub controls: &'a RunControls,
}

impl<P, X, O> Clone for Runtime<'_, P, X, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P, X, O> Copy for Runtime<'_, P, X, O> {}

/// A run being driven by this process.
#[derive(Debug, Clone)]
pub struct Session {
    run: Run,
    /// Latest observation, reused as the next step's pre-plan observation.
    observation: Option<Observation>,
}

impl Session {
    pub fn new(run: Run) -> Self {
        Self {
            run,
            observation: None,
        }
    }

    /// Load a run for stepping.
    pub fn open(store: &StateStore, run_id: &str) -> Result<Self> {
        Ok(Self::new(store.load(run_id)?))
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn into_run(self) -> Run {
        self.run
    }

    pub(crate) fn run_mut(&mut self) -> &mut Run {
        &mut self.run
    }
}

/// Result of a single [`run_step`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub run_id: String,
    /// Step the outcome belongs to (the last committed step for a pause taken
    /// before a new step started).
    pub step: u32,
    /// False when the call paused before starting a step.
    pub started: bool,
    pub directive: Directive,
}

enum Planned {
    Proposal(ActionProposal),
    Exhausted(String),
    Cancelled,
}

/// Execute one step of a created or running run.
///
/// Pause requests are honored here, before a new step starts. The snapshot is
/// saved on every return path, including errors.
#[instrument(skip_all, fields(run_id = %session.run.run_id, step = session.run.next_step()))]
pub fn run_step<P: Planner, X: ActionExecutor, O: Observer>(
    rt: Runtime<'_, P, X, O>,
    session: &mut Session,
) -> Result<StepOutcome> {
    let run = &session.run;
    if run.status.is_terminal() {
        return Err(anyhow!("run '{}' already {}", run.run_id, run.status));
    }
    if run.status == RunStatus::Paused {
        return Err(anyhow!("run '{}' is paused; resume it first", run.run_id));
    }
    if let Some(flight) = run.in_flight {
        return Err(anyhow!(
            "run '{}' has an interrupted step {}; recover it first",
            run.run_id,
            flight.step
        ));
    }

    let (step, started, result) = match pause_requested(rt, run) {
        Some(pause_reason) => {
            let step = run.current_step;
            (step, false, pause(rt, session, step, pause_reason))
        }
        None => {
            let step = run.next_step();
            (step, true, cycle(rt, session, step))
        }
    };
    rt.store.save(&session.run)?;
    let directive = result?;

    info!(
        step,
        status = %session.run.status,
        reason = directive.reason().unwrap_or(""),
        "step finished"
    );
    Ok(StepOutcome {
        run_id: session.run.run_id.clone(),
        step,
        started,
        directive,
    })
}

fn pause_requested<P, X, O>(rt: Runtime<'_, P, X, O>, run: &Run) -> Option<&'static str> {
    if run.status != RunStatus::Running {
        return None;
    }
    if rt.controls.cancel.is_cancelled() {
        return Some(reason::CANCELLED);
    }
    if rt.controls.pause.is_requested() {
        return Some(reason::OPERATOR_REQUESTED);
    }
    match rt.controls.stop_after_step {
        Some(limit) if run.current_step >= limit => Some(reason::STOP_AFTER_STEP),
        _ => None,
    }
}

fn pause<P, X, O>(
    rt: Runtime<'_, P, X, O>,
    session: &mut Session,
    step: u32,
    pause_reason: &str,
) -> Result<Directive> {
    record(
        rt,
        session,
        step,
        EventBody::Paused {
            reason: pause_reason.to_string(),
            pending: None,
        },
    )?;
    if pause_reason == reason::OPERATOR_REQUESTED {
        rt.controls.pause.clear();
    }
    info!(step, reason = pause_reason, "run paused");
    Ok(Directive::Pause {
        reason: pause_reason.to_string(),
    })
}

fn cycle<P: Planner, X: ActionExecutor, O: Observer>(
    rt: Runtime<'_, P, X, O>,
    session: &mut Session,
    step: u32,
) -> Result<Directive> {
    let observation = match session.observation.take() {
        Some(observation) => observation,
        None => rt.observer.observe().context("observe environment")?,
    };
    record(
        rt,
        session,
        step,
        EventBody::StepStarted {
            fingerprint: observation.fingerprint.to_string(),
        },
    )?;

    let planned = request_plan(rt, session, step, &observation)?;
    session.observation = Some(observation);
    let proposal = match planned {
        Planned::Proposal(proposal) => proposal,
        Planned::Exhausted(detail) => {
            record(
                rt,
                session,
                step,
                EventBody::Failed {
                    reason: reason::PLANNER_EXHAUSTED.to_string(),
                    detail: Some(detail),
                },
            )?;
            return Ok(fail(reason::PLANNER_EXHAUSTED));
        }
        Planned::Cancelled => return pause(rt, session, step, reason::CANCELLED),
    };

    let run = &session.run;
    let decision = policy::evaluate(&proposal, run.current_step, run.max_steps, &run.safe_mode);
    debug!(
        tool = %proposal.tool_name,
        verdict = ?decision.verdict,
        reason = %decision.reason,
        "policy decision"
    );
    record(
        rt,
        session,
        step,
        EventBody::PolicyDecision {
            tool_name: proposal.tool_name.clone(),
            verdict: decision.verdict,
            reason: decision.reason.clone(),
        },
    )?;

    match decision.verdict {
        PolicyVerdict::Rejected if decision.reason == reason::STEP_BUDGET_EXHAUSTED => {
            record(
                rt,
                session,
                step,
                EventBody::Completed {
                    reason: decision.reason.clone(),
                    summary: None,
                },
            )?;
            Ok(Directive::Complete {
                reason: decision.reason,
            })
        }
        PolicyVerdict::Rejected => {
            warn!(tool = %proposal.tool_name, reason = %decision.reason, "proposal rejected");
            record(
                rt,
                session,
                step,
                EventBody::Failed {
                    reason: decision.reason.clone(),
                    detail: Some(format!("tool '{}' rejected", proposal.tool_name)),
                },
            )?;
            Ok(Directive::Fail {
                reason: decision.reason,
            })
        }
        PolicyVerdict::RequiresConfirmation => {
            record(
                rt,
                session,
                step,
                EventBody::Paused {
                    reason: reason::AWAITING_CONFIRMATION.to_string(),
                    pending: Some(proposal),
                },
            )?;
            info!(step, "awaiting operator confirmation");
            Ok(Directive::Pause {
                reason: reason::AWAITING_CONFIRMATION.to_string(),
            })
        }
        PolicyVerdict::Approved => match proposal.tool_name.as_str() {
            DONE_TOOL => {
                let summary = proposal.str_argument("summary").map(str::to_string);
                record(rt, session, step, EventBody::StepCompleted {})?;
                record(
                    rt,
                    session,
                    step,
                    EventBody::Completed {
                        reason: reason::GOAL_REACHED.to_string(),
                        summary,
                    },
                )?;
                Ok(Directive::Complete {
                    reason: reason::GOAL_REACHED.to_string(),
                })
            }
            FAIL_TOOL => {
                let detail = proposal.str_argument("reason").map(str::to_string);
                record(rt, session, step, EventBody::StepCompleted {})?;
                record(
                    rt,
                    session,
                    step,
                    EventBody::Failed {
                        reason: reason::PLANNER_GAVE_UP.to_string(),
                        detail,
                    },
                )?;
                Ok(fail(reason::PLANNER_GAVE_UP))
            }
            _ => {
                if rt.controls.cancel.is_cancelled() {
                    return pause(rt, session, step, reason::CANCELLED);
                }
                act_and_settle(rt, session, step, &proposal)
            }
        },
    }
}

/// Bounded retry loop around the planner. Each failed attempt is recorded as
/// `plan_retry`; only the proposal stage retries, so no side effect repeats.
fn request_plan<P: Planner, X, O>(
    rt: Runtime<'_, P, X, O>,
    session: &mut Session,
    step: u32,
    observation: &Observation,
) -> Result<Planned> {
    let retry = rt.config.retry_policy();
    let cancel = &rt.controls.cancel;
    let mut attempt = 1u32;
    loop {
        record(rt, session, step, EventBody::PlanRequested { attempt })?;
        let proposed = if cancel.is_cancelled() {
            Err(PlannerError::Cancelled)
        } else {
            rt.planner.propose(&PlanRequest {
                run: &session.run,
                observation,
                step,
                attempt,
                timeout: rt.config.planner_timeout(),
                cancel,
            })
        };

        let err = match proposed {
            Ok(proposal) => {
                debug!(attempt, tool = %proposal.tool_name, "proposal received");
                record(
                    rt,
                    session,
                    step,
                    EventBody::PlanReceived {
                        proposal: proposal.clone(),
                        attempts: attempt,
                    },
                )?;
                return Ok(Planned::Proposal(proposal));
            }
            Err(err) => err,
        };

        let delay = match err {
            PlannerError::Cancelled => None,
            _ => retry.delay_after(attempt),
        };
        warn!(attempt, error = %err, retry_in = ?delay, "planner attempt failed");
        record(
            rt,
            session,
            step,
            EventBody::PlanRetry {
                attempt,
                error: err.to_string(),
                retry_in_ms: delay.map(millis),
            },
        )?;

        if err == PlannerError::Cancelled {
            return Ok(Planned::Cancelled);
        }
        let Some(delay) = delay else {
            return Ok(Planned::Exhausted(format!(
                "{err} (after {attempt} attempts)"
            )));
        };
        if !cancel.sleep(delay) {
            return Ok(Planned::Cancelled);
        }
        attempt += 1;
    }
}

/// Execute an approved proposal for `step`, run recovery if the detector
/// fires, and commit the step.
pub(crate) fn act_and_settle<P, X: ActionExecutor, O: Observer>(
    rt: Runtime<'_, P, X, O>,
    session: &mut Session,
    step: u32,
    proposal: &ActionProposal,
) -> Result<Directive> {
    record(
        rt,
        session,
        step,
        EventBody::ActionStarted {
            tool_name: proposal.tool_name.clone(),
            arguments: proposal.arguments.clone(),
        },
    )?;
    let result = match execute(
        rt,
        &session.run.run_id,
        step,
        &proposal.tool_name,
        &proposal.arguments,
    ) {
        Ok(result) => result,
        Err(err) => return executor_fatal(rt, session, step, &err),
    };
    if !result.is_success() {
        debug!(tool = %proposal.tool_name, status = ?result.status, "action did not succeed");
    }
    settle(rt, session, step, result, false)?;

    if let Some(trigger) = session.run.stuck.signal() {
        if session.run.stuck.recovery_spent() {
            warn!(%trigger, "still stuck after recovery");
            record(
                rt,
                session,
                step,
                EventBody::Failed {
                    reason: reason::RECOVERY_EXHAUSTED.to_string(),
                    detail: Some(format!("{trigger} persisted after a recovery attempt")),
                },
            )?;
            return Ok(fail(reason::RECOVERY_EXHAUSTED));
        }

        let recovery = &rt.config.recovery;
        let fallback = ActionProposal {
            arguments: recovery.arguments.clone(),
            ..ActionProposal::new(recovery.tool.as_str())
        };
        let decision = policy::evaluate_recovery(&fallback, &session.run.safe_mode);
        record(
            rt,
            session,
            step,
            EventBody::PolicyDecision {
                tool_name: fallback.tool_name.clone(),
                verdict: decision.verdict,
                reason: decision.reason.clone(),
            },
        )?;
        if decision.verdict != PolicyVerdict::Approved {
            warn!(
                %trigger,
                tool = %recovery.tool,
                reason = %decision.reason,
                "recovery action rejected"
            );
            record(
                rt,
                session,
                step,
                EventBody::Failed {
                    reason: reason::RECOVERY_EXHAUSTED.to_string(),
                    detail: Some(format!(
                        "{trigger}: recovery tool '{}' rejected ({})",
                        recovery.tool, decision.reason
                    )),
                },
            )?;
            return Ok(fail(reason::RECOVERY_EXHAUSTED));
        }

        info!(%trigger, tool = %recovery.tool, "run looks stuck; recovering");
        record(
            rt,
            session,
            step,
            EventBody::RecoveryTriggered {
                trigger,
                tool_name: recovery.tool.clone(),
                arguments: recovery.arguments.clone(),
            },
        )?;
        let result = match execute(
            rt,
            &session.run.run_id,
            step,
            &recovery.tool,
            &recovery.arguments,
        ) {
            Ok(result) => result,
            Err(err) => return executor_fatal(rt, session, step, &err),
        };
        settle(rt, session, step, result, true)?;
    }

    commit_step(rt, session, step)
}

/// Record `step_completed` and finish the run if the budget is used up.
pub(crate) fn commit_step<P, X, O>(
    rt: Runtime<'_, P, X, O>,
    session: &mut Session,
    step: u32,
) -> Result<Directive> {
    record(rt, session, step, EventBody::StepCompleted {})?;
    if session.run.current_step >= session.run.max_steps {
        record(
            rt,
            session,
            step,
            EventBody::Completed {
                reason: reason::STEP_BUDGET_REACHED.to_string(),
                summary: None,
            },
        )?;
        return Ok(Directive::Complete {
            reason: reason::STEP_BUDGET_REACHED.to_string(),
        });
    }
    Ok(Directive::Continue)
}

fn execute<P, X: ActionExecutor, O>(
    rt: Runtime<'_, P, X, O>,
    run_id: &str,
    step: u32,
    tool_name: &str,
    arguments: &Arguments,
) -> Result<ActionResult> {
    rt.executor.execute(&ActionRequest {
        run_id,
        step,
        tool_name,
        arguments,
        timeout: rt.config.executor_timeout(),
        cancel: &rt.controls.cancel,
    })
}

/// Observe the outcome of an action and record its result.
///
/// The result is recorded even when observing fails, so the side effect is
/// never mistaken for one that did not happen.
fn settle<P, X, O: Observer>(
    rt: Runtime<'_, P, X, O>,
    session: &mut Session,
    step: u32,
    result: ActionResult,
    recovery: bool,
) -> Result<()> {
    match rt.observer.observe() {
        Ok(observation) => {
            let fingerprint = Some(observation.fingerprint.to_string());
            record(
                rt,
                session,
                step,
                EventBody::ActionResult {
                    result,
                    fingerprint,
                    recovery,
                },
            )?;
            session.observation = Some(observation);
            Ok(())
        }
        Err(err) => {
            record(
                rt,
                session,
                step,
                EventBody::ActionResult {
                    result,
                    fingerprint: None,
                    recovery,
                },
            )?;
            Err(err.context("observe environment after action"))
        }
    }
}

fn executor_fatal<P, X, O>(
    rt: Runtime<'_, P, X, O>,
    session: &mut Session,
    step: u32,
    err: &anyhow::Error,
) -> Result<Directive> {
    let detail = format!("{err:#}");
    warn!(error = %detail, "action executor failed fatally");
    record(
        rt,
        session,
        step,
        EventBody::Failed {
            reason: reason::EXECUTOR_FATAL.to_string(),
            detail: Some(detail.clone()),
        },
    )?;
    Err(EngineError::ExecutorFatal(detail).into())
}

fn record<P, X, O>(
    rt: Runtime<'_, P, X, O>,
    session: &mut Session,
    step: u32,
    body: EventBody,
) -> Result<()> {
    rt.store.record(session.run_mut(), step, body)?;
    Ok(())
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

fn fail(fail_reason: &str) -> Directive {
    Directive::Fail {
        reason: fail_reason.to_string(),
    }
}
