//! Engine configuration (`runloop.toml`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::backoff::RetryPolicy;
use crate::core::policy::{self, SafeModeConfig};
use crate::core::stuck::DEFAULT_WINDOW;
use crate::core::types::{ActionProposal, Arguments, PolicyVerdict};

/// Engine configuration (TOML).
///
/// Meant to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Step budget requested for new runs (clamped by `safe_mode`).
    pub max_steps: u32,
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
    pub stuck: StuckConfig,
    pub recovery: RecoveryConfig,
    pub safe_mode: SafeModeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Proposal attempts per step, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StuckConfig {
    /// Fingerprints compared, and failures tolerated, before recovery.
    pub window: usize,
}

/// The fixed fallback action run once when a run looks stuck.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    pub tool: String,
    pub arguments: Arguments,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            planner: PlannerConfig::default(),
            executor: ExecutorConfig::default(),
            stuck: StuckConfig::default(),
            recovery: RecoveryConfig::default(),
            safe_mode: SafeModeConfig::default(),
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
            timeout_secs: 60,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        let mut arguments = Arguments::new();
        arguments.insert("direction".to_string(), json!("down"));
        Self {
            tool: "scroll".to_string(),
            arguments,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.planner.max_attempts == 0 {
            return Err(anyhow!("planner.max_attempts must be > 0"));
        }
        if self.planner.max_delay_ms < self.planner.base_delay_ms {
            return Err(anyhow!("planner.max_delay_ms must be >= planner.base_delay_ms"));
        }
        if self.planner.timeout_secs == 0 {
            return Err(anyhow!("planner.timeout_secs must be > 0"));
        }
        if self.executor.timeout_secs == 0 {
            return Err(anyhow!("executor.timeout_secs must be > 0"));
        }
        if self.stuck.window == 0 {
            return Err(anyhow!("stuck.window must be > 0"));
        }
        if self.recovery.tool.trim().is_empty() {
            return Err(anyhow!("recovery.tool must be non-empty"));
        }
        if self.safe_mode.max_steps == 0 {
            return Err(anyhow!("safe_mode.max_steps must be > 0"));
        }
        let fallback = ActionProposal::new(self.recovery.tool.as_str());
        let decision = policy::evaluate_recovery(&fallback, &self.safe_mode);
        if decision.verdict != PolicyVerdict::Approved {
            return Err(anyhow!(
                "recovery.tool '{}' is rejected by safe_mode ({})",
                self.recovery.tool, decision.reason
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.planner.max_attempts,
            base_delay: Duration::from_millis(self.planner.base_delay_ms),
            max_delay: Duration::from_millis(self.planner.max_delay_ms),
        }
    }

    pub fn planner_timeout(&self) -> Duration {
        Duration::from_secs(self.planner.timeout_secs)
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
