//! Action executor boundary.
//!
//! The [`ActionExecutor`] trait decouples the run controller from whatever
//! actually performs actions on the target environment. Expected operational
//! failures (element missing, action timed out) are an [`ActionResult`] with a
//! non-success status; an `Err` means the adapter itself is misconfigured and
//! ends the run. Tests use scripted executors that return predetermined
//! results.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::{ActionResult, Arguments};
use crate::signal::CancelToken;

/// Parameters for one action.
#[derive(Debug, Clone, Copy)]
pub struct ActionRequest<'a> {
    pub run_id: &'a str,
    pub step: u32,
    pub tool_name: &'a str,
    pub arguments: &'a Arguments,
    /// Maximum time the adapter may spend before reporting a timeout result.
    pub timeout: Duration,
    pub cancel: &'a CancelToken,
}

pub trait ActionExecutor {
    fn execute(&self, request: &ActionRequest<'_>) -> Result<ActionResult>;
}

impl<E: ActionExecutor + ?Sized> ActionExecutor for &E {
    fn execute(&self, request: &ActionRequest<'_>) -> Result<ActionResult> {
        (**self).execute(request)
    }
}

/// Compiled JSON Schemas (Draft 2020-12) for tool arguments, keyed by tool.
#[derive(Default)]
pub struct ToolSchemas {
    validators: BTreeMap<String, Validator>,
}

impl ToolSchemas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the argument schema for `tool_name`, replacing any previous one.
    pub fn register(&mut self, tool_name: &str, schema: &Value) -> Result<()> {
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(schema)
            .with_context(|| format!("compile argument schema for '{tool_name}'"))?;
        self.validators.insert(tool_name.to_string(), validator);
        Ok(())
    }

    pub fn contains(&self, tool_name: &str) -> bool {
        self.validators.contains_key(tool_name)
    }

    /// Validate `arguments` for `tool_name`. Tools without a schema pass.
    pub fn check(&self, tool_name: &str, arguments: &Arguments) -> Result<()> {
        let Some(validator) = self.validators.get(tool_name) else {
            return Ok(());
        };
        let instance = Value::Object(arguments.clone());
        let messages: Vec<String> = validator
            .iter_errors(&instance)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(anyhow!(
                "invalid arguments for '{tool_name}': {}",
                messages.join("; ")
            ));
        }
        Ok(())
    }
}

/// Executor wrapper that rejects malformed arguments before they reach the
/// environment.
///
/// A schema mismatch becomes a failed [`ActionResult`], so it flows through
/// the stuck detector like any other failed action.
pub struct SchemaCheckedExecutor<E> {
    inner: E,
    schemas: ToolSchemas,
}

impl<E: ActionExecutor> SchemaCheckedExecutor<E> {
    pub fn new(inner: E, schemas: ToolSchemas) -> Self {
        Self { inner, schemas }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: ActionExecutor> ActionExecutor for SchemaCheckedExecutor<E> {
    #[instrument(
        skip_all,
        fields(run_id = request.run_id, step = request.step, tool = request.tool_name)
    )]
    fn execute(&self, request: &ActionRequest<'_>) -> Result<ActionResult> {
        if let Err(err) = self.schemas.check(request.tool_name, request.arguments) {
            warn!(error = %err, "rejecting action at the executor boundary");
            return Ok(ActionResult::failed(err.to_string()));
        }
        debug!("arguments valid");
        self.inner.execute(request)
    }
}
