//! Test-only helpers: scripted adapters and a temp-dir run harness.
//!
//! Scripts are queues; the last entry repeats once the others are used up, so
//! "always fail" is a one-entry script.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::event::{Event, EventKind};
use crate::core::run::Run;
use crate::core::types::{ActionProposal, ActionResult, ActionStatus};
use crate::io::config::EngineConfig;
use crate::io::executor::{ActionExecutor, ActionRequest};
use crate::io::observer::{Observation, Observer};
use crate::io::planner::{PlanRequest, Planner, PlannerError};
use crate::io::state_store::StateStore;
use crate::signal::RunControls;
use crate::start::{StartOptions, start_run};
use crate::step::Runtime;

fn next_scripted<T: Clone>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut queue = queue.lock().ok()?;
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

/// Proposal for `tool` with no arguments.
pub fn proposal(tool: &str) -> ActionProposal {
    ActionProposal::new(tool).with_rationale(format!("scripted {tool}"))
}

/// Planner that replays a fixed list of responses.
pub struct ScriptedPlanner {
    script: Mutex<VecDeque<Result<ActionProposal, PlannerError>>>,
    calls: AtomicUsize,
}

impl ScriptedPlanner {
    pub fn new(script: Vec<Result<ActionProposal, PlannerError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn proposals(proposals: Vec<ActionProposal>) -> Self {
        Self::new(proposals.into_iter().map(Ok).collect())
    }

    /// Planner that fails every call.
    pub fn unavailable(message: &str) -> Self {
        Self::new(vec![Err(PlannerError::Unavailable(message.to_string()))])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Planner for ScriptedPlanner {
    fn propose(&self, _request: &PlanRequest<'_>) -> Result<ActionProposal, PlannerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        next_scripted(&self.script).unwrap_or_else(|| {
            Err(PlannerError::Unavailable("planner script is empty".to_string()))
        })
    }
}

/// One scripted executor response.
#[derive(Debug, Clone)]
pub enum ScriptedAction {
    Result(ActionResult),
    /// Adapter misconfiguration: `execute` returns `Err`.
    Fatal(String),
}

/// Executor that replays scripted results, optionally per tool.
pub struct ScriptedExecutor {
    default: Mutex<VecDeque<ScriptedAction>>,
    by_tool: Mutex<HashMap<String, VecDeque<ScriptedAction>>>,
    log: Mutex<Vec<(String, ActionStatus)>>,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<ScriptedAction>) -> Self {
        Self {
            default: Mutex::new(script.into()),
            by_tool: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(result: ActionResult) -> Self {
        Self::new(vec![ScriptedAction::Result(result)])
    }

    pub fn results(results: Vec<ActionResult>) -> Self {
        Self::new(results.into_iter().map(ScriptedAction::Result).collect())
    }

    pub fn fatal(message: &str) -> Self {
        Self::new(vec![ScriptedAction::Fatal(message.to_string())])
    }

    /// Use a separate script whenever `tool` is executed.
    pub fn with_tool(self, tool: &str, results: Vec<ActionResult>) -> Self {
        if let Ok(mut by_tool) = self.by_tool.lock() {
            by_tool.insert(
                tool.to_string(),
                results.into_iter().map(ScriptedAction::Result).collect(),
            );
        }
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Tools executed, in order.
    pub fn tools(&self) -> Vec<String> {
        self.log
            .lock()
            .map(|log| log.iter().map(|(tool, _)| tool.clone()).collect())
            .unwrap_or_default()
    }

    /// Statuses returned, in order.
    pub fn statuses(&self) -> Vec<ActionStatus> {
        self.log
            .lock()
            .map(|log| log.iter().map(|(_, status)| *status).collect())
            .unwrap_or_default()
    }

    fn next_for(&self, tool: &str) -> Option<ScriptedAction> {
        let mut by_tool = self.by_tool.lock().ok()?;
        if let Some(queue) = by_tool.get_mut(tool) {
            return if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
        }
        drop(by_tool);
        next_scripted(&self.default)
    }
}

impl ActionExecutor for ScriptedExecutor {
    fn execute(&self, request: &ActionRequest<'_>) -> Result<ActionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let action = self
            .next_for(request.tool_name)
            .ok_or_else(|| anyhow!("executor script is empty"))?;
        match action {
            ScriptedAction::Result(result) => {
                if let Ok(mut log) = self.log.lock() {
                    log.push((request.tool_name.to_string(), result.status));
                }
                Ok(result)
            }
            ScriptedAction::Fatal(message) => Err(anyhow!(message)),
        }
    }
}

/// Observer that replays screens, or produces a fresh screen on every call.
pub struct ScriptedObserver {
    screens: Mutex<VecDeque<Value>>,
    counting: bool,
    calls: AtomicUsize,
}

impl ScriptedObserver {
    pub fn screens(screens: Vec<Value>) -> Self {
        Self {
            screens: Mutex::new(screens.into()),
            counting: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every observation differs, so the identical-window trigger never fires.
    pub fn counting() -> Self {
        Self {
            screens: Mutex::new(VecDeque::new()),
            counting: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Observer for ScriptedObserver {
    fn observe(&self) -> Result<Observation> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.counting {
            return Ok(Observation::new(json!({ "tick": call })));
        }
        next_scripted(&self.screens)
            .map(Observation::new)
            .ok_or_else(|| anyhow!("observer script is empty"))
    }
}

/// Temp-dir backed run store for lifecycle tests.
pub struct TestRuns {
    _temp: TempDir,
    store: StateStore,
    config: EngineConfig,
}

impl TestRuns {
    /// Default config with millisecond planner backoff.
    pub fn new() -> Result<Self> {
        let mut config = EngineConfig::default();
        config.planner.base_delay_ms = 1;
        config.planner.max_delay_ms = 4;
        Self::with_config(config)
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let temp = tempfile::tempdir()?;
        let store = StateStore::new(temp.path().join("runs"));
        Ok(Self {
            _temp: temp,
            store,
            config,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn start(&self, goal: &str, max_steps: u32) -> Result<Run> {
        start_run(
            &self.store,
            &self.config,
            &StartOptions {
                max_steps: Some(max_steps),
                ..StartOptions::new(goal)
            },
        )
    }

    pub fn runtime<'a, P, X, O>(
        &'a self,
        planner: &'a P,
        executor: &'a X,
        observer: &'a O,
        controls: &'a RunControls,
    ) -> Runtime<'a, P, X, O> {
        Runtime {
            store: &self.store,
            planner,
            executor,
            observer,
            config: &self.config,
            controls,
        }
    }

    pub fn events(&self, run_id: &str) -> Result<Vec<Event>> {
        self.store.log().read_all(run_id)?.collect()
    }

    pub fn kinds(&self, run_id: &str) -> Result<Vec<EventKind>> {
        Ok(self.events(run_id)?.iter().map(|event| event.kind).collect())
    }
}
