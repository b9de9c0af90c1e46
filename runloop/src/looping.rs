//! Multi-step driver: run steps until the run pauses or ends.

use anyhow::Result;
use tracing::{info, warn};

use crate::core::run::Run;
use crate::core::types::{Directive, reason};
use crate::error::EngineError;
use crate::io::executor::ActionExecutor;
use crate::io::observer::Observer;
use crate::io::planner::Planner;
use crate::step::{Runtime, Session, StepOutcome, run_step};

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_id: String,
    /// First step this invocation attempted.
    pub started_at_step: u32,
    /// Steps started by this invocation.
    pub steps_executed: u32,
    /// Why the loop stopped; never `Directive::Continue`.
    pub stop: Directive,
    /// The run as persisted when the loop stopped.
    pub run: Run,
}

/// Call [`run_step`] until it returns a non-continue directive.
///
/// A fatal executor error has already been recorded as `failed` by the step,
/// so it ends the loop like any other failure. Every other error is returned.
pub fn run_loop<P, X, O, F>(
    rt: Runtime<'_, P, X, O>,
    mut session: Session,
    mut on_step: F,
) -> Result<LoopOutcome>
where
    P: Planner,
    X: ActionExecutor,
    O: Observer,
    F: FnMut(&StepOutcome),
{
    let started_at_step = session.run().next_step();
    let mut steps_executed = 0u32;
    loop {
        let stop = match run_step(rt, &mut session) {
            Ok(step) => {
                if step.started {
                    steps_executed += 1;
                }
                on_step(&step);
                if step.directive.is_continue() {
                    continue;
                }
                step.directive
            }
            Err(err) => {
                if let Some(EngineError::ExecutorFatal(detail)) =
                    err.downcast_ref::<EngineError>()
                {
                    warn!(error = %detail, "run failed on executor error");
                    steps_executed += 1;
                    Directive::Fail {
                        reason: reason::EXECUTOR_FATAL.to_string(),
                    }
                } else {
                    return Err(err);
                }
            }
        };

        info!(
            run_id = %session.run().run_id,
            steps_executed,
            reason = stop.reason().unwrap_or(""),
            "loop stopped"
        );
        return Ok(LoopOutcome {
            run_id: session.run().run_id.clone(),
            started_at_step,
            steps_executed,
            stop,
            run: session.into_run(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ActionResult, RunStatus};
    use crate::signal::RunControls;
    use crate::test_support::{
        ScriptedExecutor, ScriptedObserver, ScriptedPlanner, TestRuns, proposal,
    };

    #[test]
    fn loop_runs_until_the_budget_is_reached() {
        let runs = TestRuns::new().expect("runs");
        let run = runs.start("goal", 4).expect("start");
        let planner = ScriptedPlanner::proposals(vec![proposal("tap")]);
        let executor = ScriptedExecutor::always(ActionResult::success("ok"));
        let observer = ScriptedObserver::counting();
        let controls = RunControls::default();

        let mut seen = Vec::new();
        let outcome = run_loop(
            runs.runtime(&planner, &executor, &observer, &controls),
            Session::new(run),
            |step| seen.push(step.step),
        )
        .expect("loop");

        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert_eq!(outcome.started_at_step, 1);
        assert_eq!(outcome.steps_executed, 4);
        assert_eq!(
            outcome.stop,
            Directive::Complete {
                reason: reason::STEP_BUDGET_REACHED.to_string()
            }
        );
        assert_eq!(outcome.run.status, RunStatus::Completed);
    }

    #[test]
    fn stop_after_step_pauses_the_loop() {
        let runs = TestRuns::new().expect("runs");
        let run = runs.start("goal", 10).expect("start");
        let planner = ScriptedPlanner::proposals(vec![proposal("tap")]);
        let executor = ScriptedExecutor::always(ActionResult::success("ok"));
        let observer = ScriptedObserver::counting();
        let controls = RunControls {
            stop_after_step: Some(2),
            ..RunControls::default()
        };

        let outcome = run_loop(
            runs.runtime(&planner, &executor, &observer, &controls),
            Session::new(run),
            |_| {},
        )
        .expect("loop");

        assert_eq!(outcome.steps_executed, 2);
        assert_eq!(
            outcome.stop,
            Directive::Pause {
                reason: reason::STOP_AFTER_STEP.to_string()
            }
        );
        assert_eq!(outcome.run.current_step, 2);
        assert_eq!(outcome.run.status, RunStatus::Paused);
    }

    #[test]
    fn executor_fatal_ends_the_loop_as_a_failure() {
        let runs = TestRuns::new().expect("runs");
        let run = runs.start("goal", 10).expect("start");
        let planner = ScriptedPlanner::proposals(vec![proposal("tap")]);
        let executor = ScriptedExecutor::fatal("no device");
        let observer = ScriptedObserver::counting();
        let controls = RunControls::default();

        let outcome = run_loop(
            runs.runtime(&planner, &executor, &observer, &controls),
            Session::new(run),
            |_| {},
        )
        .expect("loop");

        assert_eq!(
            outcome.stop,
            Directive::Fail {
                reason: reason::EXECUTOR_FATAL.to_string()
            }
        );
        assert_eq!(outcome.run.status, RunStatus::Failed);
    }
}
