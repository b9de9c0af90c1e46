//! Safe-mode policy: the gate every proposal passes before execution.
//!
//! [`evaluate`] is a pure function of the proposal, the run's progress and the
//! policy snapshot taken when the run was created. It holds no state of its
//! own, so the same inputs always produce the same decision.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::types::{ActionProposal, PolicyDecision, PolicyVerdict, reason};

/// Irreversible tools gated by `allow_destructive`.
pub const DESTRUCTIVE_TOOLS: &[&str] = &[
    "delete_item",
    "erase_device",
    "uninstall_app",
    "reset_settings",
    "submit_payment",
    "send_message",
];

/// Policy parameters, snapshotted into the run at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeModeConfig {
    /// When false, only the step budget is enforced.
    pub enabled: bool,

    /// Upper bound on steps for any run created under this policy.
    pub max_steps: u32,

    /// Tools that are always rejected.
    pub disallowed_tools: BTreeSet<String>,

    /// Tools that need an operator confirmation before they execute.
    pub confirm_tools: BTreeSet<String>,

    /// Permit tools in [`DESTRUCTIVE_TOOLS`].
    pub allow_destructive: bool,

    /// When non-empty, only these tools may run.
    pub allowed_tools: BTreeSet<String>,
}

impl Default for SafeModeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_steps: 25,
            disallowed_tools: BTreeSet::new(),
            confirm_tools: BTreeSet::new(),
            allow_destructive: false,
            allowed_tools: BTreeSet::new(),
        }
    }
}

impl SafeModeConfig {
    /// Clamp a requested step budget to `[1, max_steps]` when enabled.
    pub fn effective_max_steps(&self, requested: u32) -> u32 {
        if !self.enabled {
            return requested;
        }
        requested.clamp(1, self.max_steps.max(1))
    }
}

pub fn is_destructive(tool_name: &str) -> bool {
    DESTRUCTIVE_TOOLS.contains(&tool_name)
}

/// Decide whether `proposal` may run as the next step.
///
/// Rules apply in order; the first match wins:
///
/// 1. `current_step >= max_steps` -> rejected (`step_budget_exhausted`)
/// 2. disallowed tool -> rejected (`policy_forbidden`)
/// 3. destructive tool without `allow_destructive` -> rejected (`destructive_blocked`)
/// 4. non-empty allowlist without the tool -> rejected (`not_allowlisted`)
/// 5. confirm tool -> requires confirmation
/// 6. otherwise approved
pub fn evaluate(
    proposal: &ActionProposal,
    current_step: u32,
    max_steps: u32,
    config: &SafeModeConfig,
) -> PolicyDecision {
    if current_step >= max_steps {
        return PolicyDecision::rejected(reason::STEP_BUDGET_EXHAUSTED);
    }
    gate(proposal, config)
}

/// Vet the fallback action run when a step looks stuck.
///
/// The step budget was already checked for the step that triggered recovery.
/// Nobody is around to confirm mid-step, so a confirm tool is rejected.
pub fn evaluate_recovery(proposal: &ActionProposal, config: &SafeModeConfig) -> PolicyDecision {
    match gate(proposal, config) {
        PolicyDecision {
            verdict: PolicyVerdict::RequiresConfirmation,
            ..
        } => PolicyDecision::rejected(reason::CONFIRMATION_REQUIRED),
        decision => decision,
    }
}

fn gate(proposal: &ActionProposal, config: &SafeModeConfig) -> PolicyDecision {
    if !config.enabled {
        return PolicyDecision::approved(reason::SAFE_MODE_DISABLED);
    }

    let tool = proposal.tool_name.as_str();
    if config.disallowed_tools.contains(tool) {
        return PolicyDecision::rejected(reason::POLICY_FORBIDDEN);
    }
    if is_destructive(tool) && !config.allow_destructive {
        return PolicyDecision::rejected(reason::DESTRUCTIVE_BLOCKED);
    }
    if !config.allowed_tools.is_empty() && !config.allowed_tools.contains(tool) {
        return PolicyDecision::rejected(reason::NOT_ALLOWLISTED);
    }
    if config.confirm_tools.contains(tool) {
        return PolicyDecision::requires_confirmation();
    }
    PolicyDecision::approved(reason::APPROVED)
}
