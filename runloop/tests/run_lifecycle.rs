//! End-to-end run lifecycle scenarios.
//!
//! These tests drive runs through `run_loop` / `resume` with scripted adapters
//! and assert on the persisted event log, which is what resume and replay
//! depend on.

use serde_json::json;

use runloop::core::event::{Event, EventKind};
use runloop::core::types::{
    ActionProposal, ActionResult, Directive, PolicyVerdict, ResumeDecision, RunStatus, reason,
};
use runloop::error::EngineError;
use runloop::io::config::EngineConfig;
use runloop::looping::{LoopOutcome, run_loop};
use runloop::resume::resume;
use runloop::signal::RunControls;
use runloop::step::{Runtime, Session};
use runloop::test_support::{
    ScriptedExecutor, ScriptedObserver, ScriptedPlanner, TestRuns, proposal,
};

fn drive(
    runs: &TestRuns,
    run_id: &str,
    planner: &ScriptedPlanner,
    executor: &ScriptedExecutor,
    observer: &ScriptedObserver,
) -> LoopOutcome {
    let controls = RunControls::default();
    let session = Session::open(runs.store(), run_id).expect("open");
    run_loop(
        runs.runtime(planner, executor, observer, &controls),
        session,
        |_| {},
    )
    .expect("loop")
}

fn of_kind(events: &[Event], kind: EventKind) -> Vec<&Event> {
    events.iter().filter(|event| event.kind == kind).collect()
}

fn confirm_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.planner.base_delay_ms = 1;
    config.planner.max_delay_ms = 4;
    config.safe_mode.confirm_tools.insert("open_app".to_string());
    config
}

#[test]
fn budget_of_three_completes_after_three_actions() {
    let runs = TestRuns::new().expect("runs");
    let run = runs.start("scroll the feed", 3).expect("start");
    let planner = ScriptedPlanner::proposals(vec![proposal("scroll")]);
    let executor = ScriptedExecutor::always(ActionResult::success("scrolled"));
    let observer = ScriptedObserver::counting();

    let outcome = drive(&runs, &run.run_id, &planner, &executor, &observer);

    assert_eq!(
        outcome.stop,
        Directive::Complete {
            reason: reason::STEP_BUDGET_REACHED.to_string()
        }
    );
    assert_eq!(outcome.run.status, RunStatus::Completed);
    assert_eq!(outcome.run.current_step, 3);
    let events = runs.events(&run.run_id).expect("events");
    assert_eq!(of_kind(&events, EventKind::ActionResult).len(), 3);
    assert_eq!(
        events.last().map(|event| event.kind),
        Some(EventKind::Completed)
    );
}

#[test]
fn confirm_tool_pauses_before_any_action() {
    let runs = TestRuns::with_config(confirm_config()).expect("runs");
    let run = runs.start("open the camera", 5).expect("start");
    let planner = ScriptedPlanner::proposals(vec![
        proposal("open_app").with_argument("package", "camera"),
    ]);
    let executor = ScriptedExecutor::always(ActionResult::success("opened"));
    let observer = ScriptedObserver::counting();

    let outcome = drive(&runs, &run.run_id, &planner, &executor, &observer);

    assert_eq!(
        outcome.stop,
        Directive::Pause {
            reason: reason::AWAITING_CONFIRMATION.to_string()
        }
    );
    let events = runs.events(&run.run_id).expect("events");
    let decisions = of_kind(&events, EventKind::PolicyDecision);
    assert_eq!(decisions.len(), 1);
    assert_eq!(
        decisions[0].payload["verdict"],
        json!(PolicyVerdict::RequiresConfirmation)
    );
    assert!(of_kind(&events, EventKind::ActionStarted).is_empty());
    assert_eq!(executor.calls(), 0);
    let pending = outcome.run.pending_confirmation.expect("pending");
    assert_eq!(pending.step, 1);
    assert_eq!(pending.proposal.tool_name, "open_app");
}

#[test]
fn confirmed_resume_executes_the_held_action_and_extends_the_log() {
    let runs = TestRuns::with_config(confirm_config()).expect("runs");
    let run = runs.start("open the camera", 5).expect("start");
    let planner = ScriptedPlanner::proposals(vec![
        proposal("open_app"),
        ActionProposal::new("done").with_argument("summary", "camera open"),
    ]);
    let executor = ScriptedExecutor::always(ActionResult::success("opened"));
    let observer = ScriptedObserver::counting();
    drive(&runs, &run.run_id, &planner, &executor, &observer);
    let paused_log = runs.events(&run.run_id).expect("paused log");
    let planner_calls = planner.calls();

    let controls = RunControls::default();
    let outcome = resume(
        runs.runtime(&planner, &executor, &observer, &controls),
        &run.run_id,
        ResumeDecision::Confirm,
        |_| {},
    )
    .expect("resume");

    let resumed_log = runs.events(&run.run_id).expect("resumed log");
    assert!(resumed_log.len() > paused_log.len());
    assert_eq!(&resumed_log[..paused_log.len()], paused_log.as_slice());
    assert_eq!(resumed_log[paused_log.len()].kind, EventKind::Resumed);
    assert_eq!(
        resumed_log[paused_log.len() + 1].kind,
        EventKind::ActionStarted
    );

    assert_eq!(executor.tools(), vec!["open_app".to_string()]);
    assert_eq!(planner.calls(), planner_calls + 1);
    assert_eq!(outcome.started_at_step, 1);
    assert_eq!(outcome.steps_executed, 2);
    assert_eq!(outcome.run.status, RunStatus::Completed);
    assert_eq!(outcome.run.reason.as_deref(), Some(reason::GOAL_REACHED));
    assert_eq!(outcome.run.summary.as_deref(), Some("camera open"));
}

#[test]
fn denied_resume_closes_the_step_without_executing() {
    let runs = TestRuns::with_config(confirm_config()).expect("runs");
    let run = runs.start("open the camera", 5).expect("start");
    let planner =
        ScriptedPlanner::proposals(vec![proposal("open_app"), ActionProposal::new("done")]);
    let executor = ScriptedExecutor::always(ActionResult::success("opened"));
    let observer = ScriptedObserver::counting();
    drive(&runs, &run.run_id, &planner, &executor, &observer);

    let controls = RunControls::default();
    let outcome = resume(
        runs.runtime(&planner, &executor, &observer, &controls),
        &run.run_id,
        ResumeDecision::Deny,
        |_| {},
    )
    .expect("resume");

    assert_eq!(executor.calls(), 0);
    assert_eq!(outcome.run.current_step, 2);
    assert_eq!(outcome.run.status, RunStatus::Completed);
}

#[test]
fn plain_resume_of_a_confirmation_pause_is_rejected() {
    let runs = TestRuns::with_config(confirm_config()).expect("runs");
    let run = runs.start("open the camera", 5).expect("start");
    let planner = ScriptedPlanner::proposals(vec![proposal("open_app")]);
    let executor = ScriptedExecutor::always(ActionResult::success("opened"));
    let observer = ScriptedObserver::counting();
    drive(&runs, &run.run_id, &planner, &executor, &observer);
    let before = runs.events(&run.run_id).expect("events");

    let controls = RunControls::default();
    let err = resume(
        runs.runtime(&planner, &executor, &observer, &controls),
        &run.run_id,
        ResumeDecision::Continue,
        |_| {},
    )
    .expect_err("needs a decision");

    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::InvalidResumeState {
            status: RunStatus::Paused,
            ..
        })
    ));
    assert_eq!(runs.events(&run.run_id).expect("events"), before);
}

#[test]
fn disallowed_tool_fails_the_run() {
    let mut config = EngineConfig::default();
    config.safe_mode.disallowed_tools.insert("tap_xy".to_string());
    let runs = TestRuns::with_config(config).expect("runs");
    let run = runs.start("tap somewhere", 5).expect("start");
    let planner = ScriptedPlanner::proposals(vec![proposal("tap_xy")]);
    let executor = ScriptedExecutor::always(ActionResult::success("tapped"));
    let observer = ScriptedObserver::counting();

    let outcome = drive(&runs, &run.run_id, &planner, &executor, &observer);

    assert_eq!(
        outcome.stop,
        Directive::Fail {
            reason: reason::POLICY_FORBIDDEN.to_string()
        }
    );
    assert_eq!(outcome.run.metrics.policy_rejections, 1);
    assert_eq!(executor.calls(), 0);
}

#[test]
fn destructive_tool_is_blocked_by_default() {
    let runs = TestRuns::new().expect("runs");
    let run = runs.start("clean up", 5).expect("start");
    let planner = ScriptedPlanner::proposals(vec![proposal("erase_device")]);
    let executor = ScriptedExecutor::always(ActionResult::success("erased"));
    let observer = ScriptedObserver::counting();

    let outcome = drive(&runs, &run.run_id, &planner, &executor, &observer);

    assert_eq!(
        outcome.run.reason.as_deref(),
        Some(reason::DESTRUCTIVE_BLOCKED)
    );
    assert_eq!(executor.calls(), 0);
}

#[test]
fn repeated_failures_trigger_exactly_one_recovery_that_succeeds() {
    let runs = TestRuns::new().expect("runs");
    let run = runs.start("find the button", 5).expect("start");
    let planner = ScriptedPlanner::proposals(vec![proposal("tap")]);
    let executor = ScriptedExecutor::always(ActionResult::failed("element not found"))
        .with_tool("scroll", vec![ActionResult::success("scrolled")]);
    let observer = ScriptedObserver::screens(vec![json!({"screen": "list", "items": 3})]);

    let outcome = drive(&runs, &run.run_id, &planner, &executor, &observer);

    let events = runs.events(&run.run_id).expect("events");
    let recoveries = of_kind(&events, EventKind::RecoveryTriggered);
    assert_eq!(recoveries.len(), 1);
    assert_eq!(recoveries[0].step_index, 3);
    assert_eq!(
        recoveries[0].payload["trigger"],
        json!("identical_observations")
    );
    assert_eq!(
        executor.tools(),
        vec!["tap", "tap", "tap", "scroll", "tap", "tap"]
    );
    assert_eq!(
        outcome.stop,
        Directive::Complete {
            reason: reason::STEP_BUDGET_REACHED.to_string()
        }
    );
}

#[test]
fn stuck_again_after_a_failed_recovery_is_recovery_exhausted() {
    let runs = TestRuns::new().expect("runs");
    let run = runs.start("find the button", 10).expect("start");
    let planner = ScriptedPlanner::proposals(vec![proposal("tap")]);
    let executor = ScriptedExecutor::always(ActionResult::failed("element not found"));
    let observer = ScriptedObserver::screens(vec![json!({"screen": "list"})]);

    let outcome = drive(&runs, &run.run_id, &planner, &executor, &observer);

    assert_eq!(
        outcome.stop,
        Directive::Fail {
            reason: reason::RECOVERY_EXHAUSTED.to_string()
        }
    );
    let events = runs.events(&run.run_id).expect("events");
    assert_eq!(of_kind(&events, EventKind::RecoveryTriggered).len(), 1);
    assert_eq!(outcome.run.current_step, 3);
}

#[test]
fn recovery_action_rejected_by_safe_mode_fails_without_executing() {
    let runs = TestRuns::new().expect("runs");
    let run = runs.start("find the button", 10).expect("start");
    let planner = ScriptedPlanner::proposals(vec![proposal("tap")]);
    let executor = ScriptedExecutor::always(ActionResult::failed("element not found"));
    let observer = ScriptedObserver::screens(vec![json!({"screen": "list"})]);
    let controls = RunControls::default();
    let mut config = runs.config().clone();
    config.recovery.tool = "erase_device".to_string();
    let rt = Runtime {
        store: runs.store(),
        planner: &planner,
        executor: &executor,
        observer: &observer,
        config: &config,
        controls: &controls,
    };

    let outcome = run_loop(rt, Session::new(run), |_| {}).expect("loop");

    assert_eq!(
        outcome.stop,
        Directive::Fail {
            reason: reason::RECOVERY_EXHAUSTED.to_string()
        }
    );
    assert_eq!(executor.tools(), vec!["tap", "tap", "tap"]);
    let events = runs.events(&outcome.run_id).expect("events");
    assert!(of_kind(&events, EventKind::RecoveryTriggered).is_empty());
    let last_decision = of_kind(&events, EventKind::PolicyDecision)
        .last()
        .map(|event| event.payload.clone())
        .expect("decision");
    assert_eq!(last_decision["tool_name"], json!("erase_device"));
    assert_eq!(last_decision["reason"], json!(reason::DESTRUCTIVE_BLOCKED));
    assert!(
        outcome
            .run
            .summary
            .as_deref()
            .is_some_and(|detail| detail.contains("erase_device"))
    );
}

#[test]
fn planner_exhaustion_fails_after_bounded_retries() {
    let runs = TestRuns::new().expect("runs");
    let run = runs.start("goal", 5).expect("start");
    let planner = ScriptedPlanner::unavailable("connection refused");
    let executor = ScriptedExecutor::always(ActionResult::success("ok"));
    let observer = ScriptedObserver::counting();

    let outcome = drive(&runs, &run.run_id, &planner, &executor, &observer);

    assert_eq!(
        outcome.stop,
        Directive::Fail {
            reason: reason::PLANNER_EXHAUSTED.to_string()
        }
    );
    assert_eq!(planner.calls(), 3);
    let events = runs.events(&run.run_id).expect("events");
    let retries = of_kind(&events, EventKind::PlanRetry);
    let delays: Vec<_> = retries
        .iter()
        .map(|event| event.payload["retry_in_ms"].clone())
        .collect();
    assert_eq!(delays, vec![json!(1), json!(2), json!(null)]);
    assert!(of_kind(&events, EventKind::ActionStarted).is_empty());
    assert_eq!(outcome.run.current_step, 0);
}

#[test]
fn rebuild_is_deterministic_and_matches_the_snapshot() {
    let runs = TestRuns::new().expect("runs");
    let run = runs.start("goal", 4).expect("start");
    let planner = ScriptedPlanner::proposals(vec![proposal("tap"), proposal("swipe")]);
    let executor = ScriptedExecutor::results(vec![
        ActionResult::failed("missed"),
        ActionResult::success("ok"),
    ]);
    let observer = ScriptedObserver::counting();
    let outcome = drive(&runs, &run.run_id, &planner, &executor, &observer);

    let first = runs.store().rebuild(&run.run_id).expect("first");
    let second = runs.store().rebuild(&run.run_id).expect("second");
    assert_eq!(first, second);
    assert_eq!(first, outcome.run);
    assert_eq!(runs.store().load(&run.run_id).expect("load"), first);
}

#[test]
fn paused_run_resumes_at_the_next_step() {
    let runs = TestRuns::new().expect("runs");
    let run = runs.start("goal", 4).expect("start");
    let planner = ScriptedPlanner::proposals(vec![proposal("tap")]);
    let executor = ScriptedExecutor::always(ActionResult::success("ok"));
    let observer = ScriptedObserver::counting();
    let controls = RunControls {
        stop_after_step: Some(2),
        ..RunControls::default()
    };
    let paused = run_loop(
        runs.runtime(&planner, &executor, &observer, &controls),
        Session::new(run),
        |_| {},
    )
    .expect("loop");
    assert_eq!(paused.run.status, RunStatus::Paused);
    let paused_log = runs.events(&paused.run_id).expect("events");

    let controls = RunControls::default();
    let outcome = resume(
        runs.runtime(&planner, &executor, &observer, &controls),
        &paused.run_id,
        ResumeDecision::Continue,
        |_| {},
    )
    .expect("resume");

    assert_eq!(outcome.started_at_step, 3);
    assert_eq!(outcome.steps_executed, 2);
    assert_eq!(executor.calls(), 4);
    let resumed_log = runs.events(&paused.run_id).expect("events");
    assert_eq!(&resumed_log[..paused_log.len()], paused_log.as_slice());
    let started: Vec<_> = of_kind(&resumed_log, EventKind::StepStarted)
        .iter()
        .map(|event| event.step_index)
        .collect();
    assert_eq!(started, vec![1, 2, 3, 4]);
}
