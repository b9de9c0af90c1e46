//! Side-effect-free replay of a run's event log.
//!
//! Replay never calls a planner, executor or observer: it re-emits recorded
//! events in `sequence_no` order and folds them, so it can audit a run on any
//! machine that has its `events.jsonl`.

use anyhow::Result;
use tracing::debug;

use crate::core::event::Event;
use crate::core::run::Run;
use crate::error::EngineError;
use crate::io::state_store::StateStore;

/// Everything a replay produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    pub events: Vec<Event>,
    /// The run folded from `events`; equal to `rebuild` at the same head.
    pub run: Run,
}

/// Replay a run, handing each event and the run as of that event to `on_event`.
pub fn replay_with<F>(store: &StateStore, run_id: &str, mut on_event: F) -> Result<Replay>
where
    F: FnMut(&Event, &Run),
{
    let mut events = Vec::new();
    let mut run: Option<Run> = None;
    for event in store.log().read_all(run_id)? {
        let event = event?;
        let folded = match run.take() {
            None => Run::from_created(&event)?,
            Some(mut run) => {
                run.apply(&event)?;
                run
            }
        };
        on_event(&event, &folded);
        run = Some(folded);
        events.push(event);
    }
    let run = run.ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
    debug!(run_id, events = events.len(), status = %run.status, "replay finished");
    Ok(Replay { events, run })
}

pub fn replay(store: &StateStore, run_id: &str) -> Result<Replay> {
    replay_with(store, run_id, |_, _| {})
}
