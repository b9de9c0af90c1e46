//! Orchestration for creating a new run.
//!
//! A "run" is one goal pursued step by step under a stable `run_id`. Starting
//! a run only records `run_created` (sequence 1) with the step budget and the
//! safe-mode snapshot; the first step happens on the first
//! [`crate::step::run_step`].

use anyhow::{Result, anyhow};
use chrono::Utc;
use rand::Rng;
use tracing::{debug, info};

use crate::core::event::{Event, EventBody};
use crate::core::run::Run;
use crate::io::config::EngineConfig;
use crate::io::layout::validate_run_id;
use crate::io::state_store::StateStore;

/// Parameters for [`start_run`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub goal: String,
    /// Overrides `EngineConfig::max_steps`; still clamped by safe mode.
    pub max_steps: Option<u32>,
    /// Caller-chosen id; generated when `None`.
    pub run_id: Option<String>,
}

impl StartOptions {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Self::default()
        }
    }
}

/// Create a run and persist its first event and snapshot.
pub fn start_run(store: &StateStore, config: &EngineConfig, options: &StartOptions) -> Result<Run> {
    config.validate()?;
    if options.goal.trim().is_empty() {
        return Err(anyhow!("goal must be non-empty"));
    }

    let run_id = match &options.run_id {
        Some(id) => {
            debug!(run_id = %id, "using caller-supplied run id");
            id.clone()
        }
        None => generate_run_id(),
    };
    validate_run_id(&run_id)?;
    if store.log().head(&run_id)? > 0 {
        return Err(anyhow!("run '{run_id}' already exists"));
    }

    let requested = options.max_steps.unwrap_or(config.max_steps);
    let max_steps = config.safe_mode.effective_max_steps(requested);
    if max_steps != requested {
        info!(requested, max_steps, "step budget clamped by safe mode");
    }

    let event = Event::new(
        &run_id,
        0,
        1,
        Utc::now(),
        &EventBody::RunCreated {
            goal: options.goal.clone(),
            max_steps,
            safe_mode: config.safe_mode.clone(),
            stuck_window: config.stuck.window,
        },
    )?;
    store.log().append(&event)?;
    let run = Run::from_created(&event)?;
    store.save(&run)?;

    info!(run_id = %run.run_id, max_steps, "run created");
    Ok(run)
}

/// `run_<UTC timestamp>_<8 hex>`: sorts by creation time, unique across hosts
/// in practice.
pub fn generate_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
    let suffix: u32 = rand::thread_rng().r#gen();
    format!("run_{stamp}_{suffix:08x}")
}
