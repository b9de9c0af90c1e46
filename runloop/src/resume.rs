//! Resuming paused runs and recovering runs whose process died.
//!
//! Both start from `rebuild`, never from a snapshot: the log alone decides
//! what has already happened, so a recorded step is never executed twice.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::event::EventBody;
use crate::core::run::{ActionPhase, Run};
use crate::core::types::{ActionResult, Directive, ResumeDecision, RunStatus, reason};
use crate::error::EngineError;
use crate::io::executor::ActionExecutor;
use crate::io::observer::Observer;
use crate::io::planner::Planner;
use crate::io::state_store::StateStore;
use crate::looping::{LoopOutcome, run_loop};
use crate::step::{Runtime, Session, StepOutcome, act_and_settle, commit_step};

/// Resume a paused run and drive it until it pauses again or ends.
///
/// A run paused for confirmation needs [`ResumeDecision::Confirm`] (execute
/// the held proposal for the held step) or [`ResumeDecision::Deny`] (close the
/// step without executing anything). Any other pause needs
/// [`ResumeDecision::Continue`].
#[instrument(skip_all, fields(run_id = %run_id, decision = ?decision))]
pub fn resume<P, X, O, F>(
    rt: Runtime<'_, P, X, O>,
    run_id: &str,
    decision: ResumeDecision,
    mut on_step: F,
) -> Result<LoopOutcome>
where
    P: Planner,
    X: ActionExecutor,
    O: Observer,
    F: FnMut(&StepOutcome),
{
    let run = rt.store.rebuild(run_id)?;
    check_resumable(&run, decision)?;
    let pending = run.pending_confirmation.clone();
    let mut session = Session::new(run);

    let step = session.run().current_step;
    rt.store
        .record(session.run_mut(), step, EventBody::Resumed { decision })?;
    info!(step, "run resumed");

    if let Some(pending) = pending {
        let settled = match decision {
            ResumeDecision::Confirm => {
                info!(
                    step = pending.step,
                    tool = %pending.proposal.tool_name,
                    "confirmed by operator"
                );
                act_and_settle(rt, &mut session, pending.step, &pending.proposal)
            }
            _ => {
                info!(
                    step = pending.step,
                    tool = %pending.proposal.tool_name,
                    "denied by operator"
                );
                commit_step(rt, &mut session, pending.step)
            }
        };
        rt.store.save(session.run())?;
        let directive = match settled {
            Ok(directive) => directive,
            Err(err) => {
                if let Some(EngineError::ExecutorFatal(_)) = err.downcast_ref::<EngineError>() {
                    Directive::Fail {
                        reason: reason::EXECUTOR_FATAL.to_string(),
                    }
                } else {
                    return Err(err);
                }
            }
        };
        let outcome = StepOutcome {
            run_id: session.run().run_id.clone(),
            step: pending.step,
            started: true,
            directive: directive.clone(),
        };
        on_step(&outcome);
        if !directive.is_continue() {
            return Ok(LoopOutcome {
                run_id: outcome.run_id,
                started_at_step: pending.step,
                steps_executed: 1,
                stop: directive,
                run: session.into_run(),
            });
        }
        let mut rest = run_loop(rt, session, on_step)?;
        rest.started_at_step = pending.step;
        rest.steps_executed += 1;
        return Ok(rest);
    }

    rt.store.save(session.run())?;
    run_loop(rt, session, on_step)
}

fn check_resumable(run: &Run, decision: ResumeDecision) -> Result<(), EngineError> {
    let invalid = |detail: &str| EngineError::InvalidResumeState {
        run_id: run.run_id.clone(),
        status: run.status,
        detail: detail.to_string(),
    };
    if run.status != RunStatus::Paused {
        return Err(invalid("only paused runs can be resumed"));
    }
    match (&run.pending_confirmation, decision) {
        (Some(_), ResumeDecision::Continue) => Err(invalid(
            "an action is awaiting confirmation; resume with confirm or deny",
        )),
        (None, ResumeDecision::Confirm | ResumeDecision::Deny) => {
            Err(invalid("no action is awaiting confirmation"))
        }
        _ => Ok(()),
    }
}

/// Turn a `running` run left behind by a dead process into a `paused` one.
///
/// An action that started without a recorded result is recorded as a
/// `timeout` with detail `interrupted` and its step is committed, so resume
/// never repeats it. A step that had not started an action is dropped and
/// re-planned on resume.
#[instrument(skip_all, fields(run_id = %run_id))]
pub fn recover_interrupted(store: &StateStore, run_id: &str) -> Result<Run> {
    let mut run = store.rebuild(run_id)?;
    if run.status != RunStatus::Running {
        return Err(EngineError::InvalidResumeState {
            run_id: run.run_id.clone(),
            status: run.status,
            detail: "only running runs can be recovered".to_string(),
        }
        .into());
    }

    if let Some(flight) = run.in_flight {
        match flight.phase {
            ActionPhase::Started { recovery } => {
                warn!(
                    step = flight.step,
                    recovery,
                    "closing action interrupted mid-flight"
                );
                store.record(
                    &mut run,
                    flight.step,
                    EventBody::ActionResult {
                        result: ActionResult::timeout(reason::INTERRUPTED),
                        fingerprint: None,
                        recovery,
                    },
                )?;
                store.record(&mut run, flight.step, EventBody::StepCompleted {})?;
            }
            ActionPhase::Settled => {
                store.record(&mut run, flight.step, EventBody::StepCompleted {})?;
            }
            ActionPhase::NotStarted => {
                info!(step = flight.step, "interrupted step will be re-planned");
            }
        }
    }

    let step = run.current_step;
    store.record(
        &mut run,
        step,
        EventBody::Paused {
            reason: reason::INTERRUPTED.to_string(),
            pending: None,
        },
    )?;
    store.save(&run)?;
    info!(step, "interrupted run is paused and resumable");
    Ok(run)
}
